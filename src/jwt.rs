use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::Serialize;

use crate::error::Error;
use crate::types::Signer;

pub(crate) const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const RS256_HEAD: &str = r#"{"alg":"RS256","typ":"JWT"}"#;

/// Claim set for a service-account JWT.
/// See https://developers.google.com/identity/protocols/OAuth2ServiceAccount#authorizingrequests.
#[derive(Serialize, Debug)]
pub(crate) struct Claims<'a> {
    iss: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    aud: Option<&'a str>,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_audience: Option<&'a str>,
}

impl<'a> Claims<'a> {
    pub(crate) fn new(iss: &'a str, aud: &'a str, scopes: &[&str], sub: Option<&'a str>) -> Self {
        let iat = Utc::now().timestamp();
        Claims {
            iss,
            aud: Some(aud),
            exp: iat + 3600 - 5, // Max validity is 1h
            iat,
            sub,
            scope: Some(join_scopes(scopes)),
            target_audience: None,
        }
    }

    /// Claim set for a self-signed JWT used directly as the bearer token
    ///
    /// Carries the scope list and no audience; `sub` equals the issuer.
    pub(crate) fn self_signed(iss: &'a str, scopes: &[&str]) -> Self {
        let iat = Utc::now().timestamp();
        Claims {
            iss,
            aud: None,
            exp: iat + 3600 - 5,
            iat,
            sub: Some(iss),
            scope: Some(join_scopes(scopes)),
            target_audience: None,
        }
    }

    /// Claim set for minting an ID token instead of an access token
    pub(crate) fn for_id_token(
        iss: &'a str,
        aud: &'a str,
        target_audience: &'a str,
        sub: Option<&'a str>,
    ) -> Self {
        let iat = Utc::now().timestamp();
        Claims {
            iss,
            aud: Some(aud),
            exp: iat + 3600 - 5,
            iat,
            sub,
            scope: None,
            target_audience: Some(target_audience),
        }
    }

    pub(crate) fn to_jwt(&self, signer: &Signer) -> Result<String, Error> {
        let mut jwt = String::new();
        URL_SAFE_NO_PAD.encode_string(RS256_HEAD, &mut jwt);
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(serde_json::to_string(self).unwrap(), &mut jwt);

        let signature = signer.sign(jwt.as_bytes())?;
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(&signature, &mut jwt);
        Ok(jwt)
    }
}

fn join_scopes(scopes: &[&str]) -> String {
    let mut joined = String::with_capacity(16);
    for (i, scope) in scopes.iter().enumerate() {
        if i != 0 {
            joined.push(' ');
        }

        joined.push_str(scope);
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_join_scopes() {
        let claims = Claims::new(
            "robot@test.iam.gserviceaccount.com",
            "https://oauth2.googleapis.com/token",
            &["scope-one", "scope-two"],
            None,
        );
        let serialized = serde_json::to_value(&claims).unwrap();
        assert_eq!(serialized["scope"], "scope-one scope-two");
        assert_eq!(serialized.get("sub"), None);
        assert_eq!(serialized.get("target_audience"), None);
    }

    #[test]
    fn claims_with_subject_and_audience() {
        let claims = Claims::for_id_token(
            "robot@test.iam.gserviceaccount.com",
            "https://oauth2.googleapis.com/token",
            "https://service.example.com",
            Some("user@example.com"),
        );
        let serialized = serde_json::to_value(&claims).unwrap();
        assert_eq!(serialized["sub"], "user@example.com");
        assert_eq!(serialized["target_audience"], "https://service.example.com");
        assert_eq!(serialized.get("scope"), None);
    }
}
