use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::Request;
use serde::Deserialize;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::credentials::ClientConfig;
use crate::token_cache::TokenCache;
use crate::types::{HttpClient, Token, DEFAULT_UNIVERSE_DOMAIN};
use crate::{Credential, Error};

/// Credential backed by a user's OAuth2 refresh token
///
/// This is the shape written by `gcloud auth application-default login`. The
/// refresh token is exchanged for short-lived access tokens at the OAuth2
/// token endpoint. Authorized-user credentials always live in the default
/// universe unless explicitly overridden.
#[derive(Debug)]
pub struct AuthorizedUser {
    client: HttpClient,
    credentials: UserCredentials,
    quota_project: Option<Arc<str>>,
    universe_domain: Arc<str>,
    cache: TokenCache,
}

impl AuthorizedUser {
    pub(crate) fn new(
        credentials: UserCredentials,
        client: &HttpClient,
        config: &ClientConfig,
    ) -> Self {
        debug!(client_id = %credentials.client_id, "creating AuthorizedUser credential");
        Self {
            client: client.clone(),
            quota_project: config
                .quota_project
                .clone()
                .or_else(crate::credentials::quota_project_from_env)
                .or_else(|| credentials.quota_project_id.clone()),
            universe_domain: config
                .universe_domain
                .clone()
                .unwrap_or_else(|| Arc::from(DEFAULT_UNIVERSE_DOMAIN)),
            cache: config.token_cache(),
            credentials,
        }
    }

    /// Parse authorized user credentials from a JSON string
    pub fn from_json(
        json: &str,
        client: &HttpClient,
        config: &ClientConfig,
    ) -> Result<Self, Error> {
        let credentials = serde_json::from_str::<UserCredentials>(json)
            .map_err(|err| Error::CredentialFile("invalid authorized_user credentials", err))?;
        Ok(Self::new(credentials, client, config))
    }

    fn token_uri(&self) -> String {
        format!("https://oauth2.{}/token", self.universe_domain)
    }

    fn refresh_form(&self, target_audience: Option<&str>) -> String {
        let mut form = form_urlencoded::Serializer::new(String::new());
        form.extend_pairs(&[
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", self.credentials.refresh_token.as_str()),
        ]);
        if let Some(audience) = target_audience {
            form.append_pair("target_audience", audience);
        }
        form.finish()
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_token(&self) -> Result<Token, Error> {
        let uri = self.token_uri();
        let body = self.refresh_form(None);
        self.client
            .token(
                &|| {
                    Request::post(&uri)
                        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                        .body(Full::from(Bytes::from(body.clone().into_bytes())))
                        .unwrap()
                },
                "AuthorizedUser",
            )
            .await
    }
}

#[async_trait]
impl Credential for AuthorizedUser {
    async fn access_token(&self) -> Result<Arc<Token>, Error> {
        self.cache.get_or_refresh(|| self.fetch_token()).await
    }

    async fn id_token(&self, audience: &str) -> Result<Arc<Token>, Error> {
        let response = self
            .client
            .request(
                Request::post(self.token_uri())
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Full::from(Bytes::from(
                        self.refresh_form(Some(audience)).into_bytes(),
                    )))
                    .unwrap(),
                "AuthorizedUser/IdToken",
            )
            .await
            .map_err(Error::into_refresh_failure)?;

        let response = serde_json::from_slice::<IdTokenResponse>(&response)
            .map_err(|err| Error::Json("failed to deserialize ID token response", err))?;
        Token::from_jwt(response.id_token).map(Arc::new)
    }

    fn supports_id_tokens(&self) -> bool {
        true
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        Err(Error::Str("no project id in authorized user credentials"))
    }

    fn quota_project_id(&self) -> Option<Arc<str>> {
        self.quota_project.clone()
    }

    async fn universe_domain(&self) -> Result<Arc<str>, Error> {
        Ok(self.universe_domain.clone())
    }

    fn kind(&self) -> &'static str {
        "authorized user"
    }
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct UserCredentials {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) refresh_token: String,
    pub(crate) quota_project_id: Option<Arc<str>>,
}

#[derive(Deserialize)]
struct IdTokenResponse {
    id_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CREDS: &str = r#"{
        "client_id": "***id***.apps.googleusercontent.com",
        "client_secret": "***secret***",
        "quota_project_id": "test_project",
        "refresh_token": "***refresh***",
        "type": "authorized_user"
    }"#;

    #[tokio::test]
    async fn parses_user_credentials() {
        let client = HttpClient::new().unwrap();
        let user = AuthorizedUser::from_json(TEST_CREDS, &client, &ClientConfig::default()).unwrap();

        assert_eq!(user.quota_project_id().as_deref(), Some("test_project"));
        assert_eq!(&*user.universe_domain().await.unwrap(), "googleapis.com");
        assert!(user.project_id().await.is_err());
        assert!(user.signer().is_none());
    }

    #[test]
    fn refresh_form_carries_target_audience_only_for_id_tokens() {
        let client = HttpClient::new().unwrap();
        let user = AuthorizedUser::from_json(TEST_CREDS, &client, &ClientConfig::default()).unwrap();

        let access = user.refresh_form(None);
        assert!(access.contains("grant_type=refresh_token"));
        assert!(!access.contains("target_audience"));

        let id = user.refresh_form(Some("https://service.example.com"));
        assert!(id.contains("target_audience=https%3A%2F%2Fservice.example.com"));
    }
}
