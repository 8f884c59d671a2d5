use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::ClientConfig;
use crate::token_cache::TokenCache;
use crate::types::Token;
use crate::{Credential, Error};

/// Wrapper credential that serves ID tokens for one audience
///
/// Delegates minting to the wrapped provider and caches the result until the
/// `exp` claim of the returned JWT comes up.
pub struct IdTokenCredential {
    provider: Arc<dyn Credential>,
    audience: String,
    cache: TokenCache,
}

impl IdTokenCredential {
    pub(crate) fn new(
        provider: Arc<dyn Credential>,
        audience: String,
        config: &ClientConfig,
    ) -> Self {
        Self {
            provider,
            audience,
            cache: config.token_cache(),
        }
    }

    /// The audience every token from this credential is minted for
    pub fn audience(&self) -> &str {
        &self.audience
    }
}

#[async_trait]
impl Credential for IdTokenCredential {
    async fn access_token(&self) -> Result<Arc<Token>, Error> {
        self.cache
            .get_or_refresh(|| async {
                self.provider
                    .id_token(&self.audience)
                    .await
                    .map(|token| (*token).clone())
            })
            .await
    }

    async fn id_token(&self, audience: &str) -> Result<Arc<Token>, Error> {
        self.provider.id_token(audience).await
    }

    fn supports_id_tokens(&self) -> bool {
        self.provider.supports_id_tokens()
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        self.provider.project_id().await
    }

    async fn service_account_email(&self) -> Result<Arc<str>, Error> {
        self.provider.service_account_email().await
    }

    fn quota_project_id(&self) -> Option<Arc<str>> {
        self.provider.quota_project_id()
    }

    async fn universe_domain(&self) -> Result<Arc<str>, Error> {
        self.provider.universe_domain().await
    }

    fn kind(&self) -> &'static str {
        "ID token"
    }
}

impl fmt::Debug for IdTokenCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdTokenCredential")
            .field("audience", &self.audience)
            .field("provider", &self.provider.kind())
            .finish()
    }
}
