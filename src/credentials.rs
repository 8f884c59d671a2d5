use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::authorized_user::{AuthorizedUser, UserCredentials};
use crate::external_account::{ExternalAccount, ExternalAccountCredentials};
use crate::external_account_authorized_user::{
    ExternalAccountAuthorizedUser, ExternalAccountAuthorizedUserCredentials,
};
use crate::impersonated::ImpersonatedServiceAccount;
use crate::metadata::{self, MetadataServiceAccount};
use crate::service_account_key::{ApplicationCredentials, ServiceAccountKey};
use crate::token_cache::{TokenCache, DEFAULT_EAGER_WINDOW};
use crate::types::HttpClient;
use crate::{Credential, Error};

/// Options applied to every credential the resolver builds
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Effective scopes for token requests
    pub scopes: Vec<String>,
    /// Delegated user for domain-wide delegation (service accounts only)
    pub subject: Option<String>,
    /// Explicit quota project; wins over the env var and file values
    pub quota_project: Option<Arc<str>>,
    /// Explicit universe domain override
    pub universe_domain: Option<Arc<str>>,
    /// Refresh tokens this long before they expire
    pub eager_refresh_window: Duration,
    /// Serve a stale token when a refresh fails instead of the error
    pub force_refresh_on_failure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scopes: Vec::new(),
            subject: None,
            quota_project: None,
            universe_domain: None,
            eager_refresh_window: DEFAULT_EAGER_WINDOW,
            force_refresh_on_failure: false,
        }
    }
}

impl ClientConfig {
    pub(crate) fn token_cache(&self) -> TokenCache {
        TokenCache::new(self.eager_refresh_window, self.force_refresh_on_failure)
    }
}

/// Quota project from the environment; an empty value counts as unset
pub(crate) fn quota_project_from_env() -> Option<Arc<str>> {
    match std::env::var("GOOGLE_CLOUD_QUOTA_PROJECT") {
        Ok(value) if !value.is_empty() => Some(Arc::from(value.as_str())),
        _ => None,
    }
}

/// A credential file parsed into its variant
///
/// The `type` tag is inspected before the payload is deserialized so that an
/// unknown variant and a malformed known variant surface as different errors.
#[derive(Debug)]
pub(crate) enum CredentialFile {
    ServiceAccount(ApplicationCredentials),
    AuthorizedUser(UserCredentials),
    ExternalAccount(ExternalAccountCredentials),
    ExternalAccountAuthorizedUser(ExternalAccountAuthorizedUserCredentials),
    ImpersonatedServiceAccount(ImpersonatedCredentials),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImpersonatedCredentials {
    service_account_impersonation_url: String,
    source_credentials: Value,
    #[serde(default)]
    delegates: Vec<String>,
}

impl CredentialFile {
    pub(crate) fn from_json(json: &str) -> Result<Self, Error> {
        let value = serde_json::from_str::<Value>(json)
            .map_err(|err| Error::CredentialFile("credential file is not valid JSON", err))?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, Error> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(Error::Str("credential file has no `type` field"))?
            .to_owned();

        match tag.as_str() {
            "service_account" => serde_json::from_value(value)
                .map(Self::ServiceAccount)
                .map_err(|err| Error::CredentialFile("invalid service_account credentials", err)),
            "authorized_user" => serde_json::from_value(value)
                .map(Self::AuthorizedUser)
                .map_err(|err| Error::CredentialFile("invalid authorized_user credentials", err)),
            "external_account" => serde_json::from_value(value)
                .map(Self::ExternalAccount)
                .map_err(|err| Error::CredentialFile("invalid external_account credentials", err)),
            "external_account_authorized_user" => serde_json::from_value(value)
                .map(Self::ExternalAccountAuthorizedUser)
                .map_err(|err| {
                    Error::CredentialFile(
                        "invalid external_account_authorized_user credentials",
                        err,
                    )
                }),
            "impersonated_service_account" => serde_json::from_value(value)
                .map(Self::ImpersonatedServiceAccount)
                .map_err(|err| {
                    Error::CredentialFile("invalid impersonated_service_account credentials", err)
                }),
            _ => Err(Error::UnrecognizedCredentialType(tag)),
        }
    }

    pub(crate) async fn from_file(path: &Path, what: &'static str) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::Io(what, err))?;
        Self::from_json(&contents)
    }

    /// Project id recorded in the file itself, if any
    pub(crate) fn project_id(&self) -> Option<Arc<str>> {
        match self {
            Self::ServiceAccount(creds) => creds.project_id.clone(),
            _ => None,
        }
    }

    /// Build the credential client for this file's variant
    pub(crate) fn into_credential(
        self,
        client: &HttpClient,
        config: &ClientConfig,
    ) -> Result<Arc<dyn Credential>, Error> {
        Ok(match self {
            Self::ServiceAccount(creds) => {
                Arc::new(ServiceAccountKey::new(creds, client, config)?)
            }
            Self::AuthorizedUser(creds) => Arc::new(AuthorizedUser::new(creds, client, config)),
            Self::ExternalAccount(creds) => Arc::new(ExternalAccount::new(creds, client, config)?),
            Self::ExternalAccountAuthorizedUser(creds) => {
                Arc::new(ExternalAccountAuthorizedUser::new(creds, client, config))
            }
            Self::ImpersonatedServiceAccount(creds) => {
                let source = match Self::from_value(creds.source_credentials)? {
                    Self::ImpersonatedServiceAccount(_) => {
                        return Err(Error::UnrecognizedCredentialType(
                            "impersonated_service_account nested as its own source".to_owned(),
                        ))
                    }
                    source => source.into_credential(client, config)?,
                };

                Arc::new(ImpersonatedServiceAccount::new(
                    source,
                    creds.service_account_impersonation_url,
                    creds.delegates,
                    client,
                    config,
                ))
            }
        })
    }
}

/// Application default credentials discovery
///
/// Returns the resolved credential together with the project id embedded in
/// the credential file, when one was read. Tries, in order:
///
/// 1. The file named by `GOOGLE_APPLICATION_CREDENTIALS` (either case);
///    a set variable pointing at a missing or invalid file is fatal.
/// 2. The gcloud well-known file under `%APPDATA%` (Windows) or
///    `$HOME/.config` (elsewhere); skipped when the base variable is unset.
/// 3. The GCP instance metadata server, when the availability probe finds it.
pub(crate) async fn resolve_adc(
    client: &HttpClient,
    config: &ClientConfig,
) -> Result<(Arc<dyn Credential>, Option<Arc<str>>), Error> {
    if let Some(file) = from_env_var().await? {
        let project_id = file.project_id();
        return Ok((file.into_credential(client, config)?, project_id));
    }

    if let Some(file) = from_well_known_file().await? {
        let project_id = file.project_id();
        return Ok((file.into_credential(client, config)?, project_id));
    }

    if metadata::is_on_gce(client).await {
        debug!("using MetadataServiceAccount after metadata server probe");
        return Ok((Arc::new(MetadataServiceAccount::new(client, config)), None));
    }

    Err(Error::AdcNotFound)
}

pub(crate) async fn from_env_var() -> Result<Option<CredentialFile>, Error> {
    let path = ["GOOGLE_APPLICATION_CREDENTIALS", "google_application_credentials"]
        .iter()
        .find_map(|var| std::env::var_os(var).filter(|value| !value.is_empty()));

    let Some(path) = path else {
        return Ok(None);
    };

    debug!("reading credentials file from GOOGLE_APPLICATION_CREDENTIALS env var");
    CredentialFile::from_file(
        Path::new(&path),
        "failed to read the file named by GOOGLE_APPLICATION_CREDENTIALS",
    )
    .await
    .map(Some)
}

pub(crate) async fn from_well_known_file() -> Result<Option<CredentialFile>, Error> {
    let Some(path) = well_known_path() else {
        return Ok(None);
    };

    match tokio::fs::metadata(&path).await {
        Ok(stat) if stat.is_file() => {}
        Ok(_) => return Ok(None),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(Error::Io(
                "failed to stat application default credentials file",
                err,
            ))
        }
    }

    debug!(path = %path.display(), "loading application default credentials file");
    CredentialFile::from_file(&path, "failed to read application default credentials file")
        .await
        .map(Some)
}

fn well_known_path() -> Option<PathBuf> {
    let (base_var, rest): (&str, &[&str]) = match cfg!(windows) {
        true => ("APPDATA", &["gcloud", "application_default_credentials.json"]),
        false => (
            "HOME",
            &[".config", "gcloud", "application_default_credentials.json"],
        ),
    };

    let base = std::env::var_os(base_var).filter(|value| !value.is_empty())?;
    let mut path = PathBuf::from(base);
    path.extend(rest);
    Some(path)
}
