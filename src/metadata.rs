use std::str;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, Level};

use crate::credentials::ClientConfig;
use crate::token_cache::TokenCache;
use crate::types::{HttpClient, Token, DEFAULT_UNIVERSE_DOMAIN};
use crate::{Credential, Error};

/// Credential served by the GCP instance metadata server
///
/// Available on Compute Engine, GKE nodes, Cloud Run and Cloud Functions.
/// See https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys
/// for the endpoints involved.
#[derive(Debug)]
pub struct MetadataServiceAccount {
    client: HttpClient,
    cache: TokenCache,
    quota_project: Option<Arc<str>>,
    email: OnceCell<Arc<str>>,
    project_id: OnceCell<Arc<str>>,
    universe_domain: OnceCell<Arc<str>>,
}

impl MetadataServiceAccount {
    /// Probe for the metadata server and build the credential when present
    ///
    /// Fails with [`Error::MetadataUnavailable`] when neither the hostname
    /// nor the fixed address answers.
    pub async fn discover(client: &HttpClient, config: &ClientConfig) -> Result<Self, Error> {
        match is_on_gce(client).await {
            true => Ok(Self::new(client, config)),
            false => Err(Error::MetadataUnavailable),
        }
    }

    pub(crate) fn new(client: &HttpClient, config: &ClientConfig) -> Self {
        debug!("creating MetadataServiceAccount credential");
        Self {
            client: client.clone(),
            cache: config.token_cache(),
            quota_project: config
                .quota_project
                .clone()
                .or_else(crate::credentials::quota_project_from_env),
            email: OnceCell::new(),
            project_id: OnceCell::new(),
            universe_domain: OnceCell::new(),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_token(&self) -> Result<Token, Error> {
        self.client
            .token(&|| metadata_request(TOKEN_URI), "MetadataServiceAccount")
            .await
    }

    async fn fetch_text(&self, uri: &'static str, ctx: &'static str) -> Result<Arc<str>, Error> {
        let body = self.client.request(metadata_request(uri), ctx).await?;
        match str::from_utf8(&body) {
            Ok(s) if !s.is_empty() => Ok(Arc::from(s.trim())),
            Ok(_) => Err(Error::Str("empty response from metadata server")),
            Err(_) => Err(Error::Str("invalid UTF-8 response from metadata server")),
        }
    }
}

#[async_trait]
impl Credential for MetadataServiceAccount {
    async fn access_token(&self) -> Result<Arc<Token>, Error> {
        self.cache.get_or_refresh(|| self.fetch_token()).await
    }

    async fn id_token(&self, audience: &str) -> Result<Arc<Token>, Error> {
        let uri = format!("{IDENTITY_URI}?audience={}&format=full", audience);
        let body = self
            .client
            .request(
                Request::builder()
                    .method(Method::GET)
                    .uri(uri)
                    .header("Metadata-Flavor", "Google")
                    .body(Full::from(Bytes::new()))
                    .unwrap(),
                "MetadataServiceAccount/IdToken",
            )
            .await
            .map_err(Error::into_refresh_failure)?;

        let jwt = str::from_utf8(&body)
            .map_err(|_| Error::Str("invalid UTF-8 identity response from metadata server"))?;
        Token::from_jwt(jwt.trim().to_owned()).map(Arc::new)
    }

    fn supports_id_tokens(&self) -> bool {
        true
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        self.project_id
            .get_or_try_init(|| {
                debug!("getting project id from GCP instance metadata server");
                self.fetch_text(PROJECT_ID_URI, "MetadataServiceAccount/ProjectId")
            })
            .await
            .cloned()
    }

    async fn service_account_email(&self) -> Result<Arc<str>, Error> {
        self.email
            .get_or_try_init(|| {
                debug!("getting service account email from GCP instance metadata server");
                self.fetch_text(EMAIL_URI, "MetadataServiceAccount/Email")
            })
            .await
            .cloned()
    }

    fn quota_project_id(&self) -> Option<Arc<str>> {
        self.quota_project.clone()
    }

    async fn universe_domain(&self) -> Result<Arc<str>, Error> {
        self.universe_domain
            .get_or_try_init(|| async {
                match self
                    .fetch_text(UNIVERSE_URI, "MetadataServiceAccount/Universe")
                    .await
                {
                    Ok(universe) => Ok(universe),
                    // Older metadata servers do not expose the endpoint.
                    Err(Error::RequestFailed { status: 404, .. }) | Err(Error::Str(_)) => {
                        Ok(Arc::from(DEFAULT_UNIVERSE_DOMAIN))
                    }
                    Err(err) => Err(err),
                }
            })
            .await
            .cloned()
    }

    fn kind(&self) -> &'static str {
        "metadata server"
    }
}

fn metadata_request(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("Metadata-Flavor", "Google")
        .body(Full::from(Bytes::new()))
        .unwrap()
}

const BASE_URI: &str = "http://metadata.google.internal/computeMetadata/v1";
const SECONDARY_BASE_URI: &str = "http://169.254.169.254/computeMetadata/v1";
const TOKEN_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const EMAIL_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/email";
const IDENTITY_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity";
const PROJECT_ID_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/project/project-id";
const UNIVERSE_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/universe/universe-domain";
const CLUSTER_NAME_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/attributes/cluster-name";

/// Deadline for each availability probe; the metadata server answers in
/// single-digit milliseconds when present.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

static ON_GCE: Mutex<Option<bool>> = Mutex::new(None);

/// Whether the process runs on Google Compute Engine
///
/// Probes the metadata server on its hostname and its fixed IP address;
/// an answer from either (any status) means the server is present.
/// The result is cached process-wide; see [`reset_gce_probe`].
pub async fn is_on_gce(client: &HttpClient) -> bool {
    if let Ok(value) = std::env::var("NO_GCE_CHECK") {
        if value == "1" || value.eq_ignore_ascii_case("true") {
            return false;
        }
    }

    if let Some(cached) = *ON_GCE.lock().unwrap() {
        return cached;
    }

    let primary_uri = format!("{BASE_URI}/instance");
    let secondary_uri = format!("{SECONDARY_BASE_URI}/instance");
    let (primary, secondary) = tokio::join!(
        probe(client, &primary_uri),
        probe(client, &secondary_uri),
    );
    let detected = primary || secondary;
    debug!(detected, "probed for GCP instance metadata server");
    *ON_GCE.lock().unwrap() = Some(detected);
    detected
}

/// Forget the cached probe result (for tests)
pub fn reset_gce_probe() {
    *ON_GCE.lock().unwrap() = None;
}

async fn probe(client: &HttpClient, uri: &str) -> bool {
    let request = client.request(metadata_request(uri), "MetadataProbe");
    match tokio::time::timeout(PROBE_TIMEOUT, request).await {
        // A response with any status means something is listening there.
        Ok(Ok(_)) | Ok(Err(Error::RequestFailed { .. })) => true,
        _ => false,
    }
}

/// Whether the instance carries a GKE cluster name attribute
pub(crate) async fn has_cluster_name(client: &HttpClient) -> bool {
    client
        .request(metadata_request(CLUSTER_NAME_URI), "MetadataClusterName")
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_gce_check_skips_probe() {
        std::env::set_var("NO_GCE_CHECK", "1");
        let client = HttpClient::new().unwrap();
        assert!(!is_on_gce(&client).await);
        std::env::remove_var("NO_GCE_CHECK");
    }

    #[test]
    fn probe_cache_resets() {
        *ON_GCE.lock().unwrap() = Some(true);
        reset_gce_probe();
        assert_eq!(*ON_GCE.lock().unwrap(), None);
    }
}
