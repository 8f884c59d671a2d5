use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ring::rand::SystemRandom;
use ring::signature::RsaKeyPair;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::Error;

/// The universe every endpoint defaults to
pub(crate) const DEFAULT_UNIVERSE_DOMAIN: &str = "googleapis.com";

/// Header naming the project billed for quota
pub(crate) const USER_PROJECT_HEADER: &str = "x-goog-user-project";

/// Header carrying an API key instead of a bearer token
pub(crate) const API_KEY_HEADER: &str = "x-goog-api-key";

/// Represents an access token or ID token and its absolute expiry.
///
/// Tokens should not be cached by callers; the owning credential keeps a
/// token fresh and hands out shared references.
#[derive(Clone, Debug, Deserialize)]
pub struct Token {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(
        default,
        rename(deserialize = "expires_in"),
        deserialize_with = "deserialize_expiry"
    )]
    expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub(crate) fn new(access_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token,
            token_type: default_token_type(),
            expires_at: Some(expires_at),
        }
    }

    pub(crate) fn from_string(access_token: String, expires_in: Duration) -> Self {
        Self {
            access_token,
            token_type: default_token_type(),
            expires_at: Some(Utc::now() + chrono::Duration::from_std(expires_in).unwrap_or(chrono::Duration::hours(1))),
        }
    }

    /// Build a token from a serialized JWT, reading expiry from the `exp` claim
    pub(crate) fn from_jwt(jwt: String) -> Result<Self, Error> {
        #[derive(Deserialize)]
        struct ExpClaim {
            exp: i64,
        }

        let payload = jwt
            .split('.')
            .nth(1)
            .ok_or(Error::Str("JWT is not three dot-separated segments"))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::Str("JWT payload is not valid base64url"))?;
        let claims = serde_json::from_slice::<ExpClaim>(&payload)
            .map_err(|err| Error::Json("failed to read `exp` claim from JWT", err))?;

        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(Error::Str("JWT `exp` claim out of range"))?;
        Ok(Self::new(jwt, expires_at))
    }

    /// Whether the token expires within the given window from now
    ///
    /// Tokens without an expiry never expire.
    pub(crate) fn expires_within(&self, window: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
                expires_at - window <= Utc::now()
            }
            None => false,
        }
    }

    /// Get str representation of the token
    pub fn as_str(&self) -> &str {
        &self.access_token
    }

    /// The token's type, `Bearer` unless the server said otherwise
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Get expiry of token, if available
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

fn default_token_type() -> String {
    "Bearer".to_owned()
}

fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds_from_now = Option::<i64>::deserialize(deserializer)?;
    Ok(seconds_from_now.map(|seconds| Utc::now() + chrono::Duration::seconds(seconds)))
}

/// Assemble the outgoing auth headers for a bearer token
pub(crate) fn bearer_headers(
    token: &Token,
    quota_project: Option<&str>,
) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    let mut value =
        HeaderValue::from_str(&format!("{} {}", token.token_type(), token.as_str()))
            .map_err(|_| Error::Str("token contains characters invalid in headers"))?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);

    if let Some(project) = quota_project {
        headers.insert(
            HeaderName::from_static(USER_PROJECT_HEADER),
            HeaderValue::from_str(project)
                .map_err(|_| Error::Str("quota project contains characters invalid in headers"))?,
        );
    }

    Ok(headers)
}

/// How many times to attempt to fetch a token from a token endpoint.
const RETRY_COUNT: u8 = 5;

/// Deadline applied to every outbound request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP transport for every credential kind
#[derive(Clone)]
pub(crate) struct HttpClient {
    inner: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClient {
    pub(crate) fn new() -> Result<Self, Error> {
        #[cfg(feature = "webpki-roots")]
        let builder = HttpsConnectorBuilder::new().with_webpki_roots();
        #[cfg(not(feature = "webpki-roots"))]
        let builder = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| Error::Io("failed to load native TLS roots", err))?;

        let connector = builder.https_or_http().enable_all_versions().build();
        Ok(Self {
            inner: Client::builder(TokioExecutor::new()).build(connector),
        })
    }

    /// Send a request, enforce the deadline and collect the response body
    ///
    /// Non-success statuses become [`Error::RequestFailed`] with the body
    /// passed through.
    pub(crate) async fn request(
        &self,
        request: Request<Full<Bytes>>,
        ctx: &'static str,
    ) -> Result<Bytes, Error> {
        debug!(url = %request.uri(), ctx, "sending HTTP request");
        let response = match tokio::time::timeout(REQUEST_TIMEOUT, self.inner.request(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(Error::Network(ctx, err)),
            Err(_) => return Err(Error::NetworkTimeout(ctx)),
        };

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| Error::Http(ctx, err))?
            .to_bytes();

        if !parts.status.is_success() {
            return Err(Error::RequestFailed {
                context: ctx,
                status: parts.status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(body)
    }

    /// Fetch a token, retrying transient failures a bounded number of times
    pub(crate) async fn token<F>(
        &self,
        request: &F,
        ctx: &'static str,
    ) -> Result<Token, Error>
    where
        F: Fn() -> Request<Full<Bytes>>,
    {
        let mut retries = 0;
        let body = loop {
            let err = match self.request(request(), ctx).await {
                Ok(body) => break body,
                Err(err) => err,
            };

            retries += 1;
            if !err.is_retryable() || retries >= RETRY_COUNT {
                return Err(err.into_refresh_failure());
            }

            warn!(ctx, error = %err, "failed to fetch token, trying again");
        };

        serde_json::from_slice(&body)
            .map_err(|err| Error::Json("failed to deserialize token response", err))
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient").finish()
    }
}

/// RS256 signer backed by a service account private key
pub struct Signer {
    key: RsaKeyPair,
    rng: SystemRandom,
}

impl Signer {
    /// Parse a PEM private key (PKCS#8 or PKCS#1) into a signing key
    pub(crate) fn new(pem: &str) -> Result<Self, Error> {
        let key = match PrivateKeyDer::from_pem_slice(pem.as_bytes()) {
            Ok(PrivateKeyDer::Pkcs8(der)) => RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()),
            Ok(PrivateKeyDer::Pkcs1(der)) => RsaKeyPair::from_der(der.secret_pkcs1_der()),
            _ => return Err(Error::SignerInit),
        };

        Ok(Self {
            key: key.map_err(|_| Error::SignerInit)?,
            rng: SystemRandom::new(),
        })
    }

    /// Sign the input with RSASSA-PKCS1-v1_5 over SHA-256
    pub fn sign(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut signature = vec![0; self.key.public().modulus_len()];
        self.key
            .sign(
                &ring::signature::RSA_PKCS1_SHA256,
                &self.rng,
                input,
                &mut signature,
            )
            .map_err(|_| Error::Str("failed to produce RS256 signature"))?;
        Ok(signature)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expiry_from_expires_in() {
        let token =
            serde_json::from_str::<Token>(r#"{"access_token": "abc123", "expires_in": 100}"#)
                .unwrap();
        assert_eq!(token.as_str(), "abc123");
        assert_eq!(token.token_type(), "Bearer");
        assert!(!token.expires_within(Duration::from_secs(30)));
        assert!(token.expires_within(Duration::from_secs(300)));
    }

    #[test]
    fn token_without_expiry_never_expires() {
        let token = serde_json::from_str::<Token>(r#"{"access_token": "abc123"}"#).unwrap();
        assert!(!token.expires_within(Duration::from_secs(u64::MAX / 4)));
    }

    #[test]
    fn token_from_jwt_reads_exp_claim() {
        // {"aud":"a","exp":4102444800}, signature irrelevant for parsing
        let payload = URL_SAFE_NO_PAD.encode(r#"{"aud":"a","exp":4102444800}"#);
        let jwt = format!("e30.{payload}.sig");
        let token = Token::from_jwt(jwt.clone()).unwrap();
        assert_eq!(token.as_str(), jwt);
        assert_eq!(token.expires_at().unwrap().timestamp(), 4102444800);
    }

    #[test]
    fn bearer_headers_shape() {
        let token = Token::from_string("abc123".into(), Duration::from_secs(3600));
        let headers = bearer_headers(&token, Some("quota-project")).unwrap();
        assert_eq!(headers[AUTHORIZATION.as_str()], "Bearer abc123");
        assert_eq!(headers[USER_PROJECT_HEADER], "quota-project");

        let headers = bearer_headers(&token, None).unwrap();
        assert!(!headers.contains_key(USER_PROJECT_HEADER));
    }
}
