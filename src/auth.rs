use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::HeaderMap;
use http_body_util::Full;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::Request;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::api_key::ApiKeyCredential;
use crate::credentials::{self, ClientConfig, CredentialFile};
use crate::gcloud;
use crate::id_token::IdTokenCredential;
use crate::metadata::MetadataServiceAccount;
use crate::token_cache::DEFAULT_EAGER_WINDOW;
use crate::types::{HttpClient, Token};
use crate::{Credential, Error};

/// Configuration for an [`Auth`] instance
///
/// Everything is optional; the default configuration discovers application
/// default credentials from the environment.
#[derive(Clone, Debug, Default)]
pub struct AuthOptions {
    /// Inline credential JSON, in any of the credential file shapes
    pub credentials_json: Option<String>,
    /// Path to a credential file, used instead of discovery
    pub credentials_file: Option<PathBuf>,
    /// Scopes requested for issued tokens; shadow `default_scopes` when set
    pub scopes: Vec<String>,
    /// Fallback scopes applied while `scopes` is empty
    pub default_scopes: Vec<String>,
    /// Explicit project id, short-circuiting detection
    pub project_id: Option<String>,
    /// API key used instead of credential material
    pub api_key: Option<String>,
    /// A pre-built credential supplied by the caller
    pub credential: Option<Arc<dyn Credential>>,
    /// Explicit universe domain; wins over `client_options.universe_domain`
    pub universe_domain: Option<String>,
    /// Options forwarded to whichever credential client gets built
    pub client_options: ClientOptions,
}

/// Options forwarded to the resolved credential client
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    /// API key, equivalent to the top-level option
    pub api_key: Option<String>,
    /// Delegated subject for domain-wide delegation
    pub subject: Option<String>,
    /// Universe domain, used when the top-level option is unset
    pub universe_domain: Option<String>,
    /// Explicit quota project for the `x-goog-user-project` header
    pub quota_project_id: Option<String>,
    /// Refresh tokens this long before expiry; default is five minutes
    pub eager_refresh_threshold: Option<Duration>,
    /// Serve a stale token when a refresh fails instead of the error
    pub force_refresh_on_failure: bool,
}

/// Entry point resolving and holding application default credentials
///
/// An `Auth` instance lazily discovers the appropriate credential on first
/// use and then owns it for its own lifetime; concurrent first calls share a
/// single resolution. The project id is detected separately and cached
/// independently of the credential.
pub struct Auth {
    options: AuthOptions,
    client: HttpClient,
    credential: OnceCell<(Arc<dyn Credential>, Option<Arc<str>>)>,
    project_id: OnceCell<Arc<str>>,
}

impl Auth {
    /// Validate the configuration and prepare lazy resolution
    ///
    /// No I/O happens here; configuring both an API key and credential
    /// material is rejected immediately.
    pub fn new(options: AuthOptions) -> Result<Self, Error> {
        let has_api_key =
            options.api_key.is_some() || options.client_options.api_key.is_some();
        let has_credentials = options.credentials_json.is_some()
            || options.credentials_file.is_some()
            || options.credential.is_some();
        if has_api_key && has_credentials {
            return Err(Error::ConfigConflict(
                "an API key cannot be combined with credentials",
            ));
        }

        Ok(Self {
            options,
            client: HttpClient::new()?,
            credential: OnceCell::new(),
            project_id: OnceCell::new(),
        })
    }

    /// Discover application default credentials with default options
    #[instrument]
    pub async fn default_credentials() -> Result<Self, Error> {
        let auth = Self::new(AuthOptions::default())?;
        auth.credential().await?;
        Ok(auth)
    }

    /// The resolved credential client, discovering it on first call
    pub async fn credential(&self) -> Result<Arc<dyn Credential>, Error> {
        self.resolved().await.map(|(credential, _)| credential.clone())
    }

    async fn resolved(&self) -> Result<&(Arc<dyn Credential>, Option<Arc<str>>), Error> {
        self.credential
            .get_or_try_init(|| async {
                if let Some(credential) = &self.options.credential {
                    debug!("using caller-supplied credential");
                    return Ok((credential.clone(), None));
                }

                let config = self.client_config();
                let api_key = self
                    .options
                    .api_key
                    .as_ref()
                    .or(self.options.client_options.api_key.as_ref());
                if let Some(key) = api_key {
                    debug!("using configured API key");
                    let credential: Arc<dyn Credential> = Arc::new(ApiKeyCredential::new(
                        key.clone(),
                        config.universe_domain.clone(),
                    ));
                    return Ok((credential, None));
                }

                if let Some(json) = &self.options.credentials_json {
                    let file = CredentialFile::from_json(json)?;
                    let project_id = file.project_id();
                    return Ok((file.into_credential(&self.client, &config)?, project_id));
                }

                if let Some(path) = &self.options.credentials_file {
                    let file =
                        CredentialFile::from_file(path, "failed to read credential key file")
                            .await?;
                    let project_id = file.project_id();
                    return Ok((file.into_credential(&self.client, &config)?, project_id));
                }

                credentials::resolve_adc(&self.client, &config).await
            })
            .await
    }

    fn client_config(&self) -> ClientConfig {
        let options = &self.options;
        ClientConfig {
            scopes: match options.scopes.is_empty() {
                true => options.default_scopes.clone(),
                false => options.scopes.clone(),
            },
            subject: options.client_options.subject.clone(),
            quota_project: options
                .client_options
                .quota_project_id
                .as_deref()
                .map(Arc::from),
            universe_domain: options
                .universe_domain
                .as_deref()
                .or(options.client_options.universe_domain.as_deref())
                .map(Arc::from),
            eager_refresh_window: options
                .client_options
                .eager_refresh_threshold
                .unwrap_or(DEFAULT_EAGER_WINDOW),
            force_refresh_on_failure: options.client_options.force_refresh_on_failure,
        }
    }

    /// Fetch (or reuse) a bearer token from the resolved credential
    pub async fn access_token(&self) -> Result<Arc<Token>, Error> {
        self.credential().await?.access_token().await
    }

    /// Request headers carrying the resolved credential
    ///
    /// `Authorization: Bearer …` for token-based credentials, or
    /// `x-goog-api-key` for an API key, plus `x-goog-user-project` when a
    /// quota project applies.
    pub async fn request_headers(&self) -> Result<HeaderMap, Error> {
        self.credential().await?.headers().await
    }

    /// Merge auth headers into a request
    ///
    /// Auth headers overwrite same-named headers on collision; all other
    /// request headers are preserved.
    pub async fn authorize_request<B>(&self, request: &mut Request<B>) -> Result<(), Error> {
        let headers = self.request_headers().await?;
        for (name, value) in headers.iter() {
            request.headers_mut().insert(name, value.clone());
        }
        Ok(())
    }

    /// Authorize and send a request through the shared HTTP client
    pub async fn request(&self, mut request: Request<Full<Bytes>>) -> Result<Bytes, Error> {
        self.authorize_request(&mut request).await?;
        self.client.request(request, "Auth").await
    }

    /// Sign a payload on behalf of the resolved identity
    ///
    /// Uses the local private key when the credential carries one; otherwise
    /// calls the IAM Credentials `:signBlob` endpoint for the credential's
    /// service account. Returns the signature in base64.
    pub async fn sign(&self, data: &[u8]) -> Result<String, Error> {
        let credential = self.credential().await?;
        if let Some(signer) = credential.signer() {
            return Ok(STANDARD.encode(signer.sign(data)?));
        }

        let email = match credential.service_account_email().await {
            Ok(email) => email,
            Err(_) => return Err(Error::SignUnsupported(credential.kind())),
        };
        let token = credential.signing_token().await?;
        let universe = credential.universe_domain().await?;

        debug!(email = %email, "signing via IAM Credentials signBlob");
        let uri = format!(
            "https://iamcredentials.{universe}/v1/projects/-/serviceAccounts/{email}:signBlob"
        );
        let body = serde_json::json!({
            "delegates": [],
            "payload": STANDARD.encode(data),
        });

        let response = self
            .client
            .request(
                Request::post(uri)
                    .header(AUTHORIZATION, format!("Bearer {}", token.as_str()))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Full::from(Bytes::from(serde_json::to_vec(&body).unwrap())))
                    .unwrap(),
                "Auth/SignBlob",
            )
            .await?;

        let response = serde_json::from_slice::<SignBlobResponse>(&response)
            .map_err(|err| Error::Json("failed to parse signBlob response", err))?;
        Ok(response.signed_blob)
    }

    /// Detect the project id for the resolved identity
    ///
    /// Sources are consulted in a fixed precedence order and the first hit is
    /// cached for the lifetime of this instance, independently of the
    /// credential cache.
    pub async fn project_id(&self) -> Result<Arc<str>, Error> {
        self.project_id
            .get_or_try_init(|| async {
                if let Some(project) = &self.options.project_id {
                    return Ok(Arc::from(project.as_str()));
                }

                for var in [
                    "GCLOUD_PROJECT",
                    "gcloud_project",
                    "GOOGLE_CLOUD_PROJECT",
                    "google_cloud_project",
                ] {
                    let value = std::env::var(var).ok().filter(|value| !value.is_empty());
                    if let Some(value) = value {
                        return Ok(Arc::from(value.as_str()));
                    }
                }

                let (credential, file_project_id) = self.resolved().await?;
                if let Some(project) = file_project_id {
                    return Ok(project.clone());
                }

                match credential.project_id().await {
                    Ok(project) => return Ok(project),
                    // Being denied on Cloud Resource Manager is an answer,
                    // not a miss.
                    Err(err @ Error::RequestFailed { status: 403, .. }) => return Err(err),
                    Err(_) => {}
                }

                if let Ok(project) = gcloud::config_helper_project_id().await {
                    return Ok(project);
                }

                if crate::metadata::is_on_gce(&self.client).await {
                    let metadata = MetadataServiceAccount::new(&self.client, &self.client_config());
                    if let Ok(project) = metadata.project_id().await {
                        return Ok(project);
                    }
                }

                Err(Error::ProjectIdUndetectable)
            })
            .await
            .cloned()
    }

    /// The universe domain every endpoint is parameterized with
    pub async fn universe_domain(&self) -> Result<Arc<str>, Error> {
        if let Some(universe) = &self.options.universe_domain {
            return Ok(Arc::from(universe.as_str()));
        }

        if let Some(universe) = &self.options.client_options.universe_domain {
            return Ok(Arc::from(universe.as_str()));
        }

        self.credential().await?.universe_domain().await
    }

    /// Wrap the resolved credential into an ID-token credential
    ///
    /// Fails for credential kinds that cannot mint ID tokens, such as
    /// external accounts.
    pub async fn id_token_credential(&self, audience: &str) -> Result<IdTokenCredential, Error> {
        let credential = self.credential().await?;
        if !credential.supports_id_tokens() {
            return Err(Error::IdTokenUnsupported(credential.kind()));
        }

        Ok(IdTokenCredential::new(
            credential,
            audience.to_owned(),
            &self.client_config(),
        ))
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("options", &self.options)
            .field("resolved", &self.credential.get().is_some())
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignBlobResponse {
    signed_blob: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_account_key::tests::TEST_KEY_JSON;

    fn with_key_json() -> AuthOptions {
        AuthOptions {
            credentials_json: Some(TEST_KEY_JSON.to_owned()),
            ..AuthOptions::default()
        }
    }

    #[test]
    fn api_key_with_credentials_is_a_conflict() {
        let err = Auth::new(AuthOptions {
            api_key: Some("key".into()),
            ..with_key_json()
        })
        .unwrap_err();
        assert!(matches!(err, Error::ConfigConflict(_)));

        // The nested option location conflicts the same way.
        let err = Auth::new(AuthOptions {
            client_options: ClientOptions {
                api_key: Some("key".into()),
                ..ClientOptions::default()
            },
            ..with_key_json()
        })
        .unwrap_err();
        assert!(matches!(err, Error::ConfigConflict(_)));
    }

    #[tokio::test]
    async fn explicit_project_id_wins_without_io() {
        let auth = Auth::new(AuthOptions {
            project_id: Some("explicit".into()),
            ..with_key_json()
        })
        .unwrap();

        assert_eq!(&*auth.project_id().await.unwrap(), "explicit");
        // Still unresolved: detection never touched the credential.
        assert!(auth.credential.get().is_none());
    }

    #[tokio::test]
    async fn file_project_id_backs_env_precedence() {
        let auth = Auth::new(with_key_json()).unwrap();
        assert_eq!(&*auth.project_id().await.unwrap(), "test_project");
    }

    #[tokio::test]
    async fn concurrent_resolution_yields_one_client() {
        let auth = Arc::new(Auth::new(with_key_json()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move { auth.credential().await.unwrap() }));
        }

        let first = handles.remove(0).await.unwrap();
        for handle in handles {
            let other = handle.await.unwrap();
            assert!(Arc::ptr_eq(&first, &other));
        }
    }

    #[tokio::test]
    async fn api_key_resolves_to_api_key_credential() {
        let auth = Auth::new(AuthOptions {
            api_key: Some("key-value".into()),
            ..AuthOptions::default()
        })
        .unwrap();

        let credential = auth.credential().await.unwrap();
        assert_eq!(credential.kind(), "API key");

        let headers = auth.request_headers().await.unwrap();
        assert_eq!(headers["x-goog-api-key"], "key-value");
        assert!(!headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn universe_precedence_prefers_top_level() {
        let auth = Auth::new(AuthOptions {
            universe_domain: Some("top.example".into()),
            client_options: ClientOptions {
                universe_domain: Some("nested.example".into()),
                ..ClientOptions::default()
            },
            ..AuthOptions::default()
        })
        .unwrap();
        assert_eq!(&*auth.universe_domain().await.unwrap(), "top.example");
    }

    #[tokio::test]
    async fn id_token_credential_rejected_for_federation() {
        let creds = r#"{
            "type": "external_account",
            "audience": "//iam.googleapis.com/projects/123456/locations/global/workloadIdentityPools/pool/providers/provider",
            "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
            "token_url": "https://sts.googleapis.com/v1/token",
            "credential_source": {"file": "/var/run/secrets/token"}
        }"#;
        let auth = Auth::new(AuthOptions {
            credentials_json: Some(creds.to_owned()),
            ..AuthOptions::default()
        })
        .unwrap();

        let err = auth.id_token_credential("https://aud.example").await.unwrap_err();
        assert!(matches!(err, Error::IdTokenUnsupported("external account")));
    }

    #[tokio::test]
    async fn authorize_request_preserves_unrelated_headers() {
        let auth = Auth::new(AuthOptions {
            api_key: Some("key-value".into()),
            ..AuthOptions::default()
        })
        .unwrap();

        let mut request = Request::builder()
            .uri("https://example.googleapis.com/v1/thing")
            .header("x-custom", "kept")
            .header("x-goog-api-key", "overwritten")
            .body(Full::<Bytes>::from(Bytes::new()))
            .unwrap();
        auth.authorize_request(&mut request).await.unwrap();

        assert_eq!(request.headers()["x-custom"], "kept");
        assert_eq!(request.headers()["x-goog-api-key"], "key-value");
    }
}
