use thiserror::Error;

/// Enumerates all possible errors returned by this library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Mutually exclusive configuration options were combined
    ///
    /// An API key cannot be used together with credential material; only one of
    /// the two may be configured on an [`Auth`](crate::Auth) instance.
    #[error("conflicting auth configuration: {0}")]
    ConfigConflict(&'static str),

    /// A credential file was readable but its contents could not be used
    ///
    /// Covers JSON that does not parse as well as JSON missing fields the
    /// declared credential type requires.
    #[error("invalid credential file: {0}")]
    CredentialFile(&'static str, #[source] serde_json::Error),

    /// The `type` field of a credential file named an unknown variant
    ///
    /// Also returned when an `impersonated_service_account` file nests another
    /// impersonated credential as its source.
    #[error("unrecognized credential type `{0}`")]
    UnrecognizedCredentialType(String),

    /// No application default credentials were discovered
    ///
    /// None of the discovery strategies produced a credential. See
    /// <https://cloud.google.com/docs/authentication/application-default-credentials>
    /// for ways to make credentials available to the process.
    #[error(
        "application default credentials not found; see \
         https://cloud.google.com/docs/authentication/application-default-credentials"
    )]
    AdcNotFound,

    /// Every project id source was exhausted without a hit
    #[error("unable to detect a project id")]
    ProjectIdUndetectable,

    /// A token endpoint answered with a non-success status
    ///
    /// The response body is passed through untouched to aid debugging.
    #[error("token request for {context} failed with status {status}: {body}")]
    TokenRefreshFailed {
        /// Which flow issued the request
        context: &'static str,
        /// HTTP status code returned by the endpoint
        status: u16,
        /// Raw response body
        body: String,
    },

    /// A non-token endpoint answered with a non-success status
    #[error("{context} request failed with status {status}: {body}")]
    RequestFailed {
        /// Which flow issued the request
        context: &'static str,
        /// HTTP status code returned by the endpoint
        status: u16,
        /// Raw response body
        body: String,
    },

    /// Both metadata server addresses refused the connection
    ///
    /// Non-fatal while probing for Google Compute Engine; fatal once the probe
    /// succeeded and an actual token or metadata value is required.
    #[error("metadata server unreachable on both addresses")]
    MetadataUnavailable,

    /// The resolved credential kind cannot mint ID tokens
    #[error("ID tokens are not supported by {0} credentials")]
    IdTokenUnsupported(&'static str),

    /// The resolved credential kind can neither sign locally nor via IAM
    #[error("signing is not supported by {0} credentials")]
    SignUnsupported(&'static str),

    /// A credential is bound to a different universe than the configuration
    #[error("universe domain mismatch: credential is bound to `{credential}` but `{configured}` was configured")]
    UniverseMismatch {
        /// Universe the credential is pinned to
        credential: String,
        /// Universe requested through configuration
        configured: String,
    },

    /// The private key could not be parsed into an RS256 signing key
    #[error("failed to initialize signer from private key")]
    SignerInit,

    /// Connection-level transport failure
    #[error("{0}")]
    Network(&'static str, #[source] hyper_util::client::legacy::Error),

    /// The request did not complete within the transport deadline
    #[error("{0} request timed out")]
    NetworkTimeout(&'static str),

    /// Failure while streaming a response body
    #[error("{0}")]
    Http(&'static str, #[source] hyper::Error),

    /// JSON (de)serialization failure outside of credential files
    #[error("{0}")]
    Json(&'static str, #[source] serde_json::Error),

    /// Filesystem or subprocess I/O failure
    #[error("{0}")]
    Io(&'static str, #[source] std::io::Error),

    /// Catch-all for conditions that carry no underlying error
    #[error("{0}")]
    Str(&'static str),
}

impl Error {
    /// Whether retrying the operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(..) | Error::NetworkTimeout(..) | Error::Http(..) => true,
            Error::TokenRefreshFailed { status, .. } | Error::RequestFailed { status, .. } => {
                matches!(*status, 408 | 429 | 500..=599)
            }
            _ => false,
        }
    }

    /// Reclassify an upstream status failure as a token refresh failure
    pub(crate) fn into_refresh_failure(self) -> Self {
        match self {
            Error::RequestFailed {
                context,
                status,
                body,
            } => Error::TokenRefreshFailed {
                context,
                status,
                body,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        let server_side = Error::RequestFailed {
            context: "test",
            status: 503,
            body: String::new(),
        };
        assert!(server_side.is_retryable());

        let client_side = Error::TokenRefreshFailed {
            context: "test",
            status: 403,
            body: String::new(),
        };
        assert!(!client_side.is_retryable());
        assert!(!Error::AdcNotFound.is_retryable());
    }

    #[test]
    fn refresh_failure_reclassification() {
        let err = Error::RequestFailed {
            context: "test",
            status: 401,
            body: "denied".into(),
        };
        assert!(matches!(
            err.into_refresh_failure(),
            Error::TokenRefreshFailed { status: 401, .. }
        ));
    }
}
