use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::Request;
use serde::Deserialize;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::credentials::ClientConfig;
use crate::token_cache::TokenCache;
use crate::types::{HttpClient, Token, DEFAULT_UNIVERSE_DOMAIN};
use crate::{Credential, Error};

/// Workforce-identity user credential holding a long-lived refresh token
///
/// Produced by browser-based workforce federation sign-in. Shaped like an
/// authorized user, but the refresh happens against the STS token endpoint
/// with the client authenticating through HTTP basic auth.
#[derive(Debug)]
pub struct ExternalAccountAuthorizedUser {
    client: HttpClient,
    credentials: ExternalAccountAuthorizedUserCredentials,
    quota_project: Option<Arc<str>>,
    universe_domain: Arc<str>,
    cache: TokenCache,
}

impl ExternalAccountAuthorizedUser {
    pub(crate) fn new(
        credentials: ExternalAccountAuthorizedUserCredentials,
        client: &HttpClient,
        config: &ClientConfig,
    ) -> Self {
        debug!(audience = ?credentials.audience, "creating ExternalAccountAuthorizedUser credential");
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

    fn token_url(&self) -> String {
        match &self.credentials.token_url {
            Some(url) => url.clone(),
            None => format!("https://sts.{}/v1/oauthtoken", self.universe_domain),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_token(&self) -> Result<Token, Error> {
        let url = self.token_url();
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.credentials.refresh_token.as_str()),
            ])
            .finish();
        let basic = STANDARD.encode(format!(
            "{}:{}",
            self.credentials.client_id, self.credentials.client_secret
        ));

        self.client
            .token(
                &|| {
                    Request::post(&url)
                        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                        .header(AUTHORIZATION, format!("Basic {basic}"))
                        .body(Full::from(Bytes::from(body.clone().into_bytes())))
                        .unwrap()
                },
                "ExternalAccountAuthorizedUser",
            )
            .await
    }
}

#[async_trait]
impl Credential for ExternalAccountAuthorizedUser {
    async fn access_token(&self) -> Result<Arc<Token>, Error> {
        self.cache.get_or_refresh(|| self.fetch_token()).await
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        Err(Error::Str(
            "no project id in external account authorized user credentials",
        ))
    }

    fn quota_project_id(&self) -> Option<Arc<str>> {
        self.quota_project.clone()
    }

    async fn universe_domain(&self) -> Result<Arc<str>, Error> {
        Ok(self.universe_domain.clone())
    }

    fn kind(&self) -> &'static str {
        "external account authorized user"
    }
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct ExternalAccountAuthorizedUserCredentials {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) refresh_token: String,
    pub(crate) token_url: Option<String>,
    pub(crate) audience: Option<String>,
    pub(crate) quota_project_id: Option<Arc<str>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_workforce_user_credentials() {
        let creds: ExternalAccountAuthorizedUserCredentials = serde_json::from_str(
            r#"{
                "type": "external_account_authorized_user",
                "audience": "//iam.googleapis.com/locations/global/workforcePools/pool/providers/provider",
                "client_id": "client-id.apps.googleusercontent.com",
                "client_secret": "***secret***",
                "refresh_token": "***refresh***",
                "token_url": "https://sts.googleapis.com/v1/oauthtoken",
                "quota_project_id": "workforce_project"
            }"#,
        )
        .unwrap();

        let client = HttpClient::new().unwrap();
        let user = ExternalAccountAuthorizedUser::new(creds, &client, &ClientConfig::default());
        assert_eq!(user.token_url(), "https://sts.googleapis.com/v1/oauthtoken");
        assert_eq!(user.quota_project_id().as_deref(), Some("workforce_project"));
        assert!(user.project_id().await.is_err());
        assert!(matches!(
            user.id_token("https://aud.example").await.unwrap_err(),
            Error::IdTokenUnsupported(_)
        ));
    }

    #[test]
    fn token_url_falls_back_to_sts_for_the_universe() {
        let creds: ExternalAccountAuthorizedUserCredentials = serde_json::from_str(
            r#"{
                "client_id": "id",
                "client_secret": "secret",
                "refresh_token": "token"
            }"#,
        )
        .unwrap();
        let client = HttpClient::new().unwrap();
        let user = ExternalAccountAuthorizedUser::new(creds, &client, &ClientConfig::default());
        assert_eq!(user.token_url(), "https://sts.googleapis.com/v1/oauthtoken");
    }
}
