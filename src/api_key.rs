use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::types::{Token, API_KEY_HEADER, DEFAULT_UNIVERSE_DOMAIN};
use crate::{Credential, Error};

/// Credential carrying a plain API key
///
/// Sends `x-goog-api-key` instead of an `Authorization` header; there is no
/// token to refresh and no identity behind it.
pub struct ApiKeyCredential {
    key: String,
    universe_domain: Arc<str>,
}

impl ApiKeyCredential {
    pub(crate) fn new(key: String, universe_domain: Option<Arc<str>>) -> Self {
        Self {
            key,
            universe_domain: universe_domain
                .unwrap_or_else(|| Arc::from(DEFAULT_UNIVERSE_DOMAIN)),
        }
    }
}

#[async_trait]
impl Credential for ApiKeyCredential {
    async fn access_token(&self) -> Result<Arc<Token>, Error> {
        Err(Error::Str("API key credentials do not issue access tokens"))
    }

    async fn headers(&self) -> Result<HeaderMap, Error> {
        let mut value = HeaderValue::from_str(&self.key)
            .map_err(|_| Error::Str("API key contains characters invalid in headers"))?;
        value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
        Ok(headers)
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        Err(Error::Str("no project id behind an API key"))
    }

    async fn universe_domain(&self) -> Result<Arc<str>, Error> {
        Ok(self.universe_domain.clone())
    }

    fn kind(&self) -> &'static str {
        "API key"
    }
}

impl fmt::Debug for ApiKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyCredential").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::AUTHORIZATION;

    #[tokio::test]
    async fn api_key_header_without_authorization() {
        let credential = ApiKeyCredential::new("key-value".into(), None);
        let headers = credential.headers().await.unwrap();

        assert_eq!(headers[API_KEY_HEADER], "key-value");
        assert!(!headers.contains_key(AUTHORIZATION));
        assert!(credential.access_token().await.is_err());
    }
}
