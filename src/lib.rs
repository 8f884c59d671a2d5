//! Google Cloud authentication for Rust
//!
//! `gauth` resolves [Application Default Credentials] and serves fresh
//! request headers, access tokens, ID tokens and signatures on demand. Once
//! resolved, a credential is cached and refreshed cooperatively; callers
//! never need to cache tokens themselves.
//!
//! The resolver tries the following sources, in order:
//!
//! 1. A credential supplied directly through [`AuthOptions`] (a pre-built
//!    client, inline JSON, a key file path, or an API key).
//! 2. The file named by the `GOOGLE_APPLICATION_CREDENTIALS` environment
//!    variable.
//! 3. The well-known file written by `gcloud auth application-default login`.
//! 4. The GCP instance metadata server, when running on Google Cloud.
//!
//! Credential files dispatch by their `type` tag to one of the supported
//! variants: service account keys, authorized users, external accounts
//! (workload and workforce identity federation), workforce authorized users
//! and service account impersonation.
//!
//! [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials
//!
//! ## Simple usage
//!
//! ```rust,no_run
//! # async fn get_token() -> Result<(), gauth::Error> {
//! use gauth::{Auth, AuthOptions};
//!
//! let auth = Auth::new(AuthOptions {
//!     scopes: vec!["https://www.googleapis.com/auth/cloud-platform".into()],
//!     ..AuthOptions::default()
//! })?;
//! let token = auth.access_token().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sharing an `Auth` across tasks
//!
//! Using a `OnceCell` makes it easy to reuse the same instance (and
//! therefore the same cached credential) across async tasks:
//!
//! ```rust,no_run
//! use gauth::{Auth, AuthOptions};
//! use tokio::sync::OnceCell;
//!
//! static AUTH: OnceCell<Auth> = OnceCell::const_new();
//!
//! async fn auth() -> &'static Auth {
//!     AUTH.get_or_init(|| async {
//!         Auth::new(AuthOptions::default()).expect("unable to configure auth")
//!     })
//!     .await
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::pedantic)]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::HeaderMap;

mod api_key;
mod auth;
mod authorized_user;
mod credentials;
mod environment;
mod error;
mod external_account;
mod external_account_authorized_user;
mod gcloud;
mod id_token;
mod impersonated;
mod jwt;
mod metadata;
mod service_account_key;
mod subject_token;
mod token_cache;
mod types;

pub use auth::{Auth, AuthOptions, ClientOptions};
pub use api_key::ApiKeyCredential;
pub use authorized_user::AuthorizedUser;
pub use credentials::ClientConfig;
pub use environment::{detect_environment, reset_environment, Environment};
pub use error::Error;
pub use external_account::ExternalAccount;
pub use external_account_authorized_user::ExternalAccountAuthorizedUser;
pub use id_token::IdTokenCredential;
pub use impersonated::ImpersonatedServiceAccount;
pub use metadata::{is_on_gce, reset_gce_probe, MetadataServiceAccount};
pub use service_account_key::ServiceAccountKey;
pub use types::{Signer, Token};

/// Common contract shared by every credential variant
///
/// All token reads go through the owning client's refresh engine; the other
/// methods expose the capabilities a variant may or may not have (a local
/// signing key, a service account identity, a quota project).
#[async_trait]
pub trait Credential: fmt::Debug + Send + Sync {
    /// Fetch a bearer token, reusing the cached one while it is fresh
    async fn access_token(&self) -> Result<Arc<Token>, Error>;

    /// Mint an ID token for the given audience
    async fn id_token(&self, audience: &str) -> Result<Arc<Token>, Error> {
        let _ = audience;
        Err(Error::IdTokenUnsupported(self.kind()))
    }

    /// Whether [`id_token`](Self::id_token) can succeed for this variant
    fn supports_id_tokens(&self) -> bool {
        false
    }

    /// Request headers carrying this credential
    async fn headers(&self) -> Result<HeaderMap, Error> {
        let token = self.access_token().await?;
        types::bearer_headers(&token, self.quota_project_id().as_deref())
    }

    /// Project id derivable from this credential
    async fn project_id(&self) -> Result<Arc<str>, Error>;

    /// Email of the service account behind this credential, if any
    async fn service_account_email(&self) -> Result<Arc<str>, Error> {
        Err(Error::Str("no service account behind this credential kind"))
    }

    /// Token used to authorize IAM Credentials calls made on our behalf
    async fn signing_token(&self) -> Result<Arc<Token>, Error> {
        self.access_token().await
    }

    /// Local RS256 signer, present when the credential carries a private key
    fn signer(&self) -> Option<&Signer> {
        None
    }

    /// Project billed for quota, when one applies to this credential
    fn quota_project_id(&self) -> Option<Arc<str>> {
        None
    }

    /// Universe domain this credential is bound to
    async fn universe_domain(&self) -> Result<Arc<str>, Error>;

    /// Short name of the variant, used in error messages
    fn kind(&self) -> &'static str;
}
