use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::Request;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, Level};

use crate::credentials::ClientConfig;
use crate::token_cache::TokenCache;
use crate::types::{HttpClient, Token, DEFAULT_UNIVERSE_DOMAIN};
use crate::{Credential, Error};

/// Impersonation token lifetime requested from IAM Credentials.
const DEFAULT_LIFETIME_SECONDS: u64 = 3600;

/// Credential that impersonates a service account via IAM Credentials
///
/// A token from the owned source credential authorizes calls to
/// `:generateAccessToken` / `:generateIdToken` for the target service
/// account. The source must not itself be an impersonated credential.
///
/// See https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateAccessToken
pub struct ImpersonatedServiceAccount {
    client: HttpClient,
    source: Arc<dyn Credential>,
    impersonation_url: String,
    delegates: Vec<String>,
    scopes: Vec<String>,
    quota_project: Option<Arc<str>>,
    universe_domain: Arc<str>,
    cache: TokenCache,
}

impl ImpersonatedServiceAccount {
    pub(crate) fn new(
        source: Arc<dyn Credential>,
        impersonation_url: String,
        delegates: Vec<String>,
        client: &HttpClient,
        config: &ClientConfig,
    ) -> Self {
        debug!(url = %impersonation_url, "creating ImpersonatedServiceAccount credential");
        Self {
            client: client.clone(),
            source,
            impersonation_url,
            delegates,
            scopes: config.scopes.clone(),
            quota_project: config
                .quota_project
                .clone()
                .or_else(crate::credentials::quota_project_from_env),
            universe_domain: config
                .universe_domain
                .clone()
                .unwrap_or_else(|| Arc::from(DEFAULT_UNIVERSE_DOMAIN)),
            cache: config.token_cache(),
        }
    }

    /// The target service account's email, as embedded in the IAM URL
    fn email_from_url(&self) -> Option<&str> {
        let (_, tail) = self.impersonation_url.split_once("/serviceAccounts/")?;
        match tail.split_once(':') {
            Some((email, _)) => Some(email),
            None => Some(tail),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_token(&self) -> Result<Token, Error> {
        let source_token = self.source.access_token().await?;

        let request = AccessTokenRequest {
            lifetime: format!("{DEFAULT_LIFETIME_SECONDS}s"),
            scope: self.scopes.clone(),
            delegates: self.delegates.clone(),
        };
        let body =
            serde_json::to_vec(&request).expect("access token request failed to serialize");

        let response = self
            .client
            .request(
                Request::post(&self.impersonation_url)
                    .header(AUTHORIZATION, format!("Bearer {}", source_token.as_str()))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Full::from(Bytes::from(body)))
                    .unwrap(),
                "ImpersonatedServiceAccount",
            )
            .await
            .map_err(Error::into_refresh_failure)?;

        let response = serde_json::from_slice::<ImpersonationTokenResponse>(&response)
            .map_err(|err| Error::Json("failed to parse impersonation response", err))?;
        Ok(Token::new(
            response.access_token,
            response.expire_time.parse::<DateTime<Utc>>().map_err(|_| {
                Error::Str("impersonation response carried an invalid expireTime")
            })?,
        ))
    }
}

#[async_trait]
impl Credential for ImpersonatedServiceAccount {
    async fn access_token(&self) -> Result<Arc<Token>, Error> {
        self.cache.get_or_refresh(|| self.fetch_token()).await
    }

    async fn id_token(&self, audience: &str) -> Result<Arc<Token>, Error> {
        let source_token = self.source.access_token().await?;
        let url = match self.impersonation_url.strip_suffix(":generateAccessToken") {
            Some(prefix) => format!("{prefix}:generateIdToken"),
            None => return Err(Error::Str("malformed service account impersonation URL")),
        };

        let body = serde_json::json!({
            "audience": audience,
            "delegates": self.delegates,
            "includeEmail": true,
        });
        let response = self
            .client
            .request(
                Request::post(url)
                    .header(AUTHORIZATION, format!("Bearer {}", source_token.as_str()))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Full::from(Bytes::from(serde_json::to_vec(&body).unwrap())))
                    .unwrap(),
                "ImpersonatedServiceAccount/IdToken",
            )
            .await
            .map_err(Error::into_refresh_failure)?;

        let response = serde_json::from_slice::<IdTokenResponse>(&response)
            .map_err(|err| Error::Json("failed to parse generateIdToken response", err))?;
        Token::from_jwt(response.token).map(Arc::new)
    }

    fn supports_id_tokens(&self) -> bool {
        true
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        // name@PROJECT.iam.gserviceaccount.com embeds the project id.
        let email = self
            .email_from_url()
            .ok_or(Error::Str("malformed service account impersonation URL"))?;
        let domain = email
            .split_once('@')
            .map(|(_, domain)| domain)
            .ok_or(Error::Str("malformed service account email"))?;
        match domain.split_once('.') {
            Some((project, "iam.gserviceaccount.com")) => Ok(Arc::from(project)),
            _ => self.source.project_id().await,
        }
    }

    async fn service_account_email(&self) -> Result<Arc<str>, Error> {
        self.email_from_url()
            .map(Arc::from)
            .ok_or(Error::Str("malformed service account impersonation URL"))
    }

    /// IAM Credentials calls on behalf of the impersonated account are
    /// authorized with the source token, not the minted one.
    async fn signing_token(&self) -> Result<Arc<Token>, Error> {
        self.source.access_token().await
    }

    fn quota_project_id(&self) -> Option<Arc<str>> {
        self.quota_project.clone()
    }

    async fn universe_domain(&self) -> Result<Arc<str>, Error> {
        Ok(self.universe_domain.clone())
    }

    fn kind(&self) -> &'static str {
        "impersonated service account"
    }
}

impl fmt::Debug for ImpersonatedServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImpersonatedServiceAccount")
            .field("impersonation_url", &self.impersonation_url)
            .field("delegates", &self.delegates)
            .finish()
    }
}

#[derive(Serialize, Clone)]
struct AccessTokenRequest {
    lifetime: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    scope: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    delegates: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpersonationTokenResponse {
    access_token: String,
    expire_time: String,
}

#[derive(Deserialize)]
struct IdTokenResponse {
    token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorized_user::AuthorizedUser;

    const IMPERSONATION_URL: &str = "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/robot@test_project.iam.gserviceaccount.com:generateAccessToken";

    fn source(client: &HttpClient) -> Arc<dyn Credential> {
        let user = AuthorizedUser::from_json(
            r#"{
                "client_id": "id",
                "client_secret": "secret",
                "refresh_token": "refresh",
                "type": "authorized_user"
            }"#,
            client,
            &ClientConfig::default(),
        )
        .unwrap();
        Arc::new(user)
    }

    #[test]
    fn deserialize_impersonation_token() {
        let resp_body =
            "{\n  \"accessToken\": \"secret_token\",\n  \"expireTime\": \"2023-08-18T04:09:45Z\"\n}";
        let token: ImpersonationTokenResponse =
            serde_json::from_str(resp_body).expect("Failed to parse token");
        assert_eq!(token.access_token, "secret_token");
        assert!(token.expire_time.parse::<DateTime<Utc>>().is_ok());
    }

    #[tokio::test]
    async fn identity_derived_from_impersonation_url() {
        let client = HttpClient::new().unwrap();
        let impersonated = ImpersonatedServiceAccount::new(
            source(&client),
            IMPERSONATION_URL.to_owned(),
            Vec::new(),
            &client,
            &ClientConfig::default(),
        );

        assert_eq!(
            &*impersonated.service_account_email().await.unwrap(),
            "robot@test_project.iam.gserviceaccount.com"
        );
        assert_eq!(&*impersonated.project_id().await.unwrap(), "test_project");
    }

    #[test]
    fn access_token_request_omits_empty_fields() {
        let request = AccessTokenRequest {
            lifetime: "3600s".into(),
            scope: Vec::new(),
            delegates: Vec::new(),
        };
        let serialized = serde_json::to_value(&request).unwrap();
        assert_eq!(serialized.get("scope"), None);
        assert_eq!(serialized.get("delegates"), None);
        assert_eq!(serialized["lifetime"], "3600s");
    }
}
