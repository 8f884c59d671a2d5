use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::Request;
use serde::Deserialize;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::credentials::ClientConfig;
use crate::subject_token::{CredentialSource, SubjectTokenSource};
use crate::token_cache::TokenCache;
use crate::types::{HttpClient, Token, DEFAULT_UNIVERSE_DOMAIN};
use crate::{Credential, Error};

/// Scope the STS leg is pinned to when impersonation follows it.
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// External account credentials for Workload and Workforce Identity Federation
///
/// A third-party subject token is exchanged at the Security Token Service for
/// a GCP access token; optionally that federated token then impersonates a
/// service account for the final credential.
///
/// See: https://google.aip.dev/auth/4117
#[derive(Debug)]
pub struct ExternalAccount {
    client: HttpClient,
    credentials: ExternalAccountCredentials,
    source: SubjectTokenSource,
    scopes: Vec<String>,
    quota_project: Option<Arc<str>>,
    universe_domain: Arc<str>,
    cache: TokenCache,
}

impl ExternalAccount {
    pub(crate) fn new(
        credentials: ExternalAccountCredentials,
        client: &HttpClient,
        config: &ClientConfig,
    ) -> Result<Self, Error> {
        debug!(
            audience = %credentials.audience,
            token_url = %credentials.token_url,
            "creating ExternalAccount credential"
        );
        let source = SubjectTokenSource::new(credentials.credential_source.clone())?;
        let quota_project = config
            .quota_project
            .clone()
            .or_else(crate::credentials::quota_project_from_env)
            .or_else(|| credentials.quota_project_id.clone())
            .or_else(|| credentials.workforce_pool_user_project.clone());

        Ok(Self {
            client: client.clone(),
            source,
            scopes: config.scopes.clone(),
            quota_project,
            universe_domain: config
                .universe_domain
                .clone()
                .unwrap_or_else(|| Arc::from(DEFAULT_UNIVERSE_DOMAIN)),
            cache: config.token_cache(),
            credentials,
        })
    }

    /// Parse external account credentials from a JSON string
    pub fn from_json(
        json: &str,
        client: &HttpClient,
        config: &ClientConfig,
    ) -> Result<Self, Error> {
        let credentials = serde_json::from_str::<ExternalAccountCredentials>(json)
            .map_err(|err| Error::CredentialFile("invalid external_account credentials", err))?;
        Self::new(credentials, client, config)
    }

    fn effective_scopes(&self) -> String {
        match self.scopes.is_empty() {
            true => CLOUD_PLATFORM_SCOPE.to_owned(),
            false => self.scopes.join(" "),
        }
    }

    /// Exchange the subject token for a federated access token via STS
    #[instrument(level = Level::DEBUG, skip(self, subject_token))]
    async fn exchange_token(&self, subject_token: &str) -> Result<Token, Error> {
        let impersonating = self.credentials.service_account_impersonation_url.is_some();
        let scope = match impersonating {
            // Impersonation narrows the scopes afterwards; the STS leg always
            // asks for cloud-platform.
            true => CLOUD_PLATFORM_SCOPE.to_owned(),
            false => self.effective_scopes(),
        };

        let body = {
            let mut form = form_urlencoded::Serializer::new(String::new());
            form.extend_pairs(&[
                ("grant_type", TOKEN_EXCHANGE_GRANT_TYPE),
                ("audience", &self.credentials.audience),
                ("subject_token", subject_token),
                ("subject_token_type", &self.credentials.subject_token_type),
                ("requested_token_type", ACCESS_TOKEN_TYPE),
                ("scope", &scope),
            ]);
            if let (Some(project), false) = (&self.credentials.workforce_pool_user_project, impersonating)
            {
                form.append_pair(
                    "options",
                    &serde_json::json!({ "userProject": project }).to_string(),
                );
            }
            form.finish()
        };

        let mut builder = Request::post(&self.credentials.token_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let (Some(id), Some(secret)) = (
            &self.credentials.client_id,
            &self.credentials.client_secret,
        ) {
            let basic = STANDARD.encode(format!("{id}:{secret}"));
            builder = builder.header(AUTHORIZATION, format!("Basic {basic}"));
        }

        let response_body = self
            .client
            .request(
                builder.body(Full::from(Bytes::from(body.into_bytes()))).unwrap(),
                "ExternalAccount/STS",
            )
            .await
            .map_err(Error::into_refresh_failure)?;

        let sts_response = serde_json::from_slice::<StsTokenResponse>(&response_body)
            .map_err(|err| Error::Json("failed to parse STS response", err))?;

        let expires_in = std::time::Duration::from_secs(sts_response.expires_in.unwrap_or(3600));
        Ok(Token::from_string(sts_response.access_token, expires_in))
    }

    /// Use the federated token to impersonate a service account
    #[instrument(level = Level::DEBUG, skip(self, federated_token))]
    async fn impersonate(
        &self,
        impersonation_url: &str,
        federated_token: &Token,
    ) -> Result<Token, Error> {
        debug!(url = %impersonation_url, "impersonating service account");

        let body = serde_json::json!({
            "scope": match self.scopes.is_empty() {
                true => vec![CLOUD_PLATFORM_SCOPE.to_owned()],
                false => self.scopes.clone(),
            },
            "lifetime": "3600s",
        });

        let response_body = self
            .client
            .request(
                Request::post(impersonation_url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(
                        AUTHORIZATION,
                        format!("Bearer {}", federated_token.as_str()),
                    )
                    .body(Full::from(Bytes::from(serde_json::to_vec(&body).unwrap())))
                    .unwrap(),
                "ExternalAccount/Impersonate",
            )
            .await
            .map_err(Error::into_refresh_failure)?;

        let response = serde_json::from_slice::<ImpersonatedTokenResponse>(&response_body)
            .map_err(|err| Error::Json("failed to parse impersonation response", err))?;

        let expires_at = response
            .expire_time
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now() + chrono::Duration::hours(1));
        Ok(Token::new(response.access_token, expires_at))
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_token(&self) -> Result<Token, Error> {
        let subject_token = self
            .source
            .subject_token(&self.client, &self.credentials.audience)
            .await?;
        let token = self.exchange_token(&subject_token).await?;

        match &self.credentials.service_account_impersonation_url {
            Some(impersonation_url) => self.impersonate(impersonation_url, &token).await,
            None => Ok(token),
        }
    }
}

#[async_trait]
impl Credential for ExternalAccount {
    async fn access_token(&self) -> Result<Arc<Token>, Error> {
        self.cache.get_or_refresh(|| self.fetch_token()).await
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        // The audience embeds the workload pool's project number; resolve it
        // to a project id through Cloud Resource Manager.
        let project_number = project_number_from_audience(&self.credentials.audience)
            .ok_or(Error::ProjectIdUndetectable)?;

        let token = self.access_token().await?;
        let uri = format!(
            "https://cloudresourcemanager.{}/v1/projects/{project_number}",
            self.universe_domain,
        );
        let body = self
            .client
            .request(
                Request::get(uri)
                    .header(AUTHORIZATION, format!("Bearer {}", token.as_str()))
                    .body(Full::from(Bytes::new()))
                    .unwrap(),
                "ExternalAccount/ResourceManager",
            )
            .await?;

        let project = serde_json::from_slice::<ProjectResponse>(&body)
            .map_err(|err| Error::Json("failed to parse Cloud Resource Manager response", err))?;
        Ok(Arc::from(project.project_id.as_str()))
    }

    async fn service_account_email(&self) -> Result<Arc<str>, Error> {
        // Only an impersonating external account has a service account
        // identity; its email is embedded in the IAM URL.
        let url = self
            .credentials
            .service_account_impersonation_url
            .as_deref()
            .ok_or(Error::Str("no service account behind this external account"))?;
        let (_, tail) = url
            .split_once("/serviceAccounts/")
            .ok_or(Error::Str("malformed service account impersonation URL"))?;
        match tail.split_once(':') {
            Some((email, _)) => Ok(Arc::from(email)),
            None => Ok(Arc::from(tail)),
        }
    }

    fn quota_project_id(&self) -> Option<Arc<str>> {
        self.quota_project.clone()
    }

    async fn universe_domain(&self) -> Result<Arc<str>, Error> {
        Ok(self.universe_domain.clone())
    }

    fn kind(&self) -> &'static str {
        "external account"
    }
}

/// Pull the project number out of an `…/projects/<number>/…` audience
fn project_number_from_audience(audience: &str) -> Option<&str> {
    let mut segments = audience.split('/');
    while let Some(segment) = segments.next() {
        if segment == "projects" {
            return segments
                .next()
                .filter(|number| !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()));
        }
    }
    None
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct ExternalAccountCredentials {
    pub(crate) audience: String,
    pub(crate) subject_token_type: String,
    pub(crate) token_url: String,
    pub(crate) credential_source: CredentialSource,
    pub(crate) service_account_impersonation_url: Option<String>,
    pub(crate) client_id: Option<String>,
    pub(crate) client_secret: Option<String>,
    pub(crate) quota_project_id: Option<Arc<str>>,
    pub(crate) workforce_pool_user_project: Option<Arc<str>>,
}

/// Response from STS token exchange
#[derive(Deserialize)]
struct StsTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Response from service account impersonation
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpersonatedTokenResponse {
    access_token: String,
    expire_time: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    project_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CREDS: &str = r#"{
        "type": "external_account",
        "audience": "//iam.googleapis.com/projects/123456/locations/global/workloadIdentityPools/pool/providers/provider",
        "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
        "token_url": "https://sts.googleapis.com/v1/token",
        "credential_source": {
            "file": "/var/run/secrets/token",
            "format": {"type": "text"}
        },
        "service_account_impersonation_url": "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/robot@test_project.iam.gserviceaccount.com:generateAccessToken"
    }"#;

    #[tokio::test]
    async fn parses_external_account() {
        let client = HttpClient::new().unwrap();
        let account =
            ExternalAccount::from_json(TEST_CREDS, &client, &ClientConfig::default()).unwrap();

        assert!(matches!(account.source, SubjectTokenSource::File { .. }));
        assert_eq!(&*account.universe_domain().await.unwrap(), "googleapis.com");
        assert!(account.quota_project_id().is_none());
        // Federation cannot mint ID tokens.
        assert!(matches!(
            account.id_token("https://aud.example").await.unwrap_err(),
            Error::IdTokenUnsupported(_)
        ));
    }

    #[test]
    fn sts_scope_is_cloud_platform_under_impersonation() {
        let client = HttpClient::new().unwrap();
        let config = ClientConfig {
            scopes: vec!["https://www.googleapis.com/auth/devstorage.read_only".to_owned()],
            ..ClientConfig::default()
        };
        let account = ExternalAccount::from_json(TEST_CREDS, &client, &config).unwrap();

        // The user scope applies to the impersonation leg, never to STS.
        assert!(account.credentials.service_account_impersonation_url.is_some());
        assert_eq!(
            account.effective_scopes(),
            "https://www.googleapis.com/auth/devstorage.read_only"
        );
    }

    #[test]
    fn workforce_project_feeds_quota_header() {
        let creds = r#"{
            "type": "external_account",
            "audience": "//iam.googleapis.com/locations/global/workforcePools/pool/providers/provider",
            "subject_token_type": "urn:ietf:params:oauth:token-type:id_token",
            "token_url": "https://sts.googleapis.com/v1/token",
            "workforce_pool_user_project": "workforce_project",
            "credential_source": {"file": "/var/run/secrets/token"}
        }"#;
        let client = HttpClient::new().unwrap();
        let account = ExternalAccount::from_json(creds, &client, &ClientConfig::default()).unwrap();
        assert_eq!(account.quota_project_id().as_deref(), Some("workforce_project"));
    }

    #[test]
    fn audience_project_number() {
        assert_eq!(
            project_number_from_audience(
                "//iam.googleapis.com/projects/123456/locations/global/workloadIdentityPools/p/providers/x"
            ),
            Some("123456")
        );
        assert_eq!(
            project_number_from_audience(
                "//iam.googleapis.com/locations/global/workforcePools/pool/providers/provider"
            ),
            None
        );
    }
}
