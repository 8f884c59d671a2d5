use std::collections::HashMap;
use std::process::Stdio;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Method, Request};
use ring::{digest, hmac};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::types::HttpClient;
use crate::Error;

/// The `credential_source` block of an external account file
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct CredentialSource {
    file: Option<String>,
    url: Option<String>,
    headers: Option<HashMap<String, String>>,
    format: Option<SourceFormat>,
    environment_id: Option<String>,
    region_url: Option<String>,
    regional_cred_verification_url: Option<String>,
    imdsv2_session_token_url: Option<String>,
    executable: Option<ExecutableConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct SourceFormat {
    #[serde(rename = "type")]
    format_type: String,
    subject_token_field_name: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct ExecutableConfig {
    command: String,
    timeout_millis: Option<u64>,
    output_file: Option<String>,
}

/// Where an external account reads its third-party subject token from
#[derive(Debug)]
pub(crate) enum SubjectTokenSource {
    File {
        path: String,
        format: Option<SourceFormat>,
    },
    Url {
        url: String,
        headers: Option<HashMap<String, String>>,
        format: Option<SourceFormat>,
    },
    Aws(AwsSource),
    Executable(ExecutableConfig),
}

impl SubjectTokenSource {
    pub(crate) fn new(source: CredentialSource) -> Result<Self, Error> {
        if let Some(environment_id) = &source.environment_id {
            if !environment_id.starts_with("aws") {
                return Err(Error::Str("unsupported credential source environment id"));
            }

            return Ok(Self::Aws(AwsSource {
                region_url: source.region_url,
                security_credentials_url: source.url,
                regional_cred_verification_url: source.regional_cred_verification_url.ok_or(
                    Error::Str("aws credential source requires regional_cred_verification_url"),
                )?,
                imdsv2_session_token_url: source.imdsv2_session_token_url,
            }));
        }

        if let Some(executable) = source.executable {
            return Ok(Self::Executable(executable));
        }

        if let Some(path) = source.file {
            return Ok(Self::File {
                path,
                format: source.format,
            });
        }

        if let Some(url) = source.url {
            return Ok(Self::Url {
                url,
                headers: source.headers,
                format: source.format,
            });
        }

        Err(Error::Str(
            "external account credential_source must have one of 'file', 'url', 'aws' or 'executable'",
        ))
    }

    /// Produce the subject token to present to the STS exchange
    pub(crate) async fn subject_token(
        &self,
        client: &HttpClient,
        audience: &str,
    ) -> Result<String, Error> {
        match self {
            Self::File { path, format } => {
                debug!(path = %path, "reading subject token from file");
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| Error::Io("failed to read subject token file", err))?;
                extract_token(contents.trim().to_owned(), format.as_ref())
            }
            Self::Url {
                url,
                headers,
                format,
            } => {
                debug!(url = %url, "fetching subject token from URL");
                let mut builder = Request::get(url);
                if let Some(headers) = headers {
                    for (key, value) in headers {
                        builder = builder.header(key.as_str(), value.as_str());
                    }
                }

                let request = builder
                    .body(Full::from(Bytes::new()))
                    .map_err(|_| Error::Str("failed to build subject token request"))?;
                let body = client.request(request, "SubjectToken/Url").await?;
                extract_token(String::from_utf8_lossy(&body).into_owned(), format.as_ref())
            }
            Self::Aws(aws) => aws.subject_token(client, audience).await,
            Self::Executable(config) => executable_token(config).await,
        }
    }
}

/// Pull the token out of the response based on the configured format
fn extract_token(response: String, format: Option<&SourceFormat>) -> Result<String, Error> {
    match format {
        Some(f) if f.format_type == "json" => {
            let field_name = f
                .subject_token_field_name
                .as_deref()
                .unwrap_or("access_token");
            let json = serde_json::from_str::<serde_json::Value>(&response)
                .map_err(|err| Error::Json("failed to parse subject token response", err))?;
            json.get(field_name)
                .and_then(|v| v.as_str())
                .map(|s| s.to_owned())
                .ok_or(Error::Str("subject_token_field_name not found in response"))
        }
        // Default to text format
        _ => Ok(response),
    }
}

const ALLOW_EXECUTABLES_VAR: &str = "GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES";

/// Response shape defined by the executable-sourced credentials protocol
#[derive(Deserialize, Debug)]
struct ExecutableResponse {
    success: bool,
    token_type: Option<String>,
    id_token: Option<String>,
    saml_response: Option<String>,
    expiration_time: Option<i64>,
    code: Option<String>,
    message: Option<String>,
}

async fn executable_token(config: &ExecutableConfig) -> Result<String, Error> {
    if std::env::var(ALLOW_EXECUTABLES_VAR).as_deref() != Ok("1") {
        return Err(Error::Str(
            "executable-sourced credentials require GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES=1",
        ));
    }

    // A still-valid response cached by a previous run short-circuits the
    // executable entirely.
    if let Some(output_file) = &config.output_file {
        if let Ok(cached) = tokio::fs::read_to_string(output_file).await {
            if let Ok(response) = serde_json::from_str::<ExecutableResponse>(&cached) {
                if let Ok(token) = token_from_response(response) {
                    debug!(path = %output_file, "using cached executable output");
                    return Ok(token);
                }
            }
        }
    }

    let mut parts = config.command.split_whitespace();
    let program = parts
        .next()
        .ok_or(Error::Str("executable credential source has an empty command"))?;

    debug!(command = %config.command, "running subject token executable");
    let timeout = std::time::Duration::from_millis(config.timeout_millis.unwrap_or(30_000));
    let mut command = Command::new(program);
    command
        .args(parts)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| Error::Str("subject token executable timed out"))?
        .map_err(|err| Error::Io("failed to run subject token executable", err))?;

    if !output.status.success() {
        return Err(Error::Str("subject token executable exited with failure"));
    }

    let response = serde_json::from_slice::<ExecutableResponse>(&output.stdout)
        .map_err(|err| Error::Json("failed to parse subject token executable output", err))?;
    token_from_response(response)
}

fn token_from_response(response: ExecutableResponse) -> Result<String, Error> {
    if !response.success {
        warn!(
            code = response.code.as_deref().unwrap_or(""),
            message = response.message.as_deref().unwrap_or(""),
            "subject token executable reported an error"
        );
        return Err(Error::Str("subject token executable reported an error"));
    }

    if let Some(expiration) = response.expiration_time {
        if expiration <= Utc::now().timestamp() {
            return Err(Error::Str("executable-sourced subject token has expired"));
        }
    }

    let token_type = response.token_type.as_deref().unwrap_or("");
    match token_type {
        "urn:ietf:params:oauth:token-type:jwt" | "urn:ietf:params:oauth:token-type:id_token" => {
            response
                .id_token
                .ok_or(Error::Str("executable output is missing id_token"))
        }
        "urn:ietf:params:oauth:token-type:saml2" => response
            .saml_response
            .ok_or(Error::Str("executable output is missing saml_response")),
        _ => Err(Error::Str("executable output has an unknown token_type")),
    }
}

/// Subject tokens minted by signing an STS GetCallerIdentity call
///
/// Temporary credentials come from the instance metadata service (IMDSv2
/// when a session token URL is configured) unless the standard AWS
/// environment variables are present.
#[derive(Debug)]
pub(crate) struct AwsSource {
    region_url: Option<String>,
    security_credentials_url: Option<String>,
    regional_cred_verification_url: String,
    imdsv2_session_token_url: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct AwsSecurityCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

impl AwsSource {
    async fn subject_token(&self, client: &HttpClient, audience: &str) -> Result<String, Error> {
        let session_token = match &self.imdsv2_session_token_url {
            Some(url) => Some(self.imdsv2_session_token(client, url).await?),
            None => None,
        };

        let credentials = self.security_credentials(client, session_token.as_deref()).await?;
        let region = self.region(client, session_token.as_deref()).await?;
        let verification_url = self.regional_cred_verification_url.replace("{region}", &region);

        let host = url::Url::parse(&verification_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .ok_or(Error::Str("invalid regional_cred_verification_url"))?;
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![("host", host.clone()), ("x-amz-date", amz_date.clone())];
        if let Some(token) = &credentials.token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        headers.push(("x-goog-cloud-target-resource", audience.to_owned()));
        headers.sort_by(|a, b| a.0.cmp(b.0));

        let authorization = sign_get_caller_identity(
            &verification_url,
            &amz_date,
            &region,
            &headers,
            &credentials,
        )?;

        // Serialize the signed request into the envelope the STS endpoint
        // expects, then percent-encode the whole document.
        let mut header_objects = vec![serde_json::json!({
            "key": "Authorization",
            "value": authorization,
        })];
        for (key, value) in &headers {
            header_objects.push(serde_json::json!({ "key": key, "value": value }));
        }

        let envelope = serde_json::json!({
            "url": verification_url,
            "method": "POST",
            "headers": header_objects,
        });
        Ok(form_urlencoded::byte_serialize(envelope.to_string().as_bytes()).collect())
    }

    async fn imdsv2_session_token(
        &self,
        client: &HttpClient,
        url: &str,
    ) -> Result<String, Error> {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(url)
            .header("x-aws-ec2-metadata-token-ttl-seconds", "300")
            .body(Full::from(Bytes::new()))
            .unwrap();
        let body = client.request(request, "AwsSource/SessionToken").await?;
        Ok(String::from_utf8_lossy(&body).trim().to_owned())
    }

    async fn region(
        &self,
        client: &HttpClient,
        session_token: Option<&str>,
    ) -> Result<String, Error> {
        for var in ["AWS_REGION", "AWS_DEFAULT_REGION"] {
            if let Ok(region) = std::env::var(var) {
                if !region.is_empty() {
                    return Ok(region);
                }
            }
        }

        let url = self
            .region_url
            .as_deref()
            .ok_or(Error::Str("aws credential source requires region_url"))?;
        let body = self
            .aws_metadata_get(client, url, session_token, "AwsSource/Region")
            .await?;
        // The endpoint reports the availability zone; drop the zone letter.
        let zone = body.trim();
        Ok(zone
            .strip_suffix(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(zone)
            .to_owned())
    }

    async fn security_credentials(
        &self,
        client: &HttpClient,
        session_token: Option<&str>,
    ) -> Result<AwsSecurityCredentials, Error> {
        let from_env = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        );
        if let (Ok(access_key_id), Ok(secret_access_key)) = from_env {
            if !access_key_id.is_empty() && !secret_access_key.is_empty() {
                return Ok(AwsSecurityCredentials {
                    access_key_id,
                    secret_access_key,
                    token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty()),
                });
            }
        }

        let url = self.security_credentials_url.as_deref().ok_or(Error::Str(
            "aws credential source requires a security credentials url",
        ))?;
        let roles = self
            .aws_metadata_get(client, url, session_token, "AwsSource/Roles")
            .await?;
        let role = roles
            .lines()
            .next()
            .map(str::trim)
            .filter(|role| !role.is_empty())
            .ok_or(Error::Str("no IAM role attached to this instance"))?;

        let body = self
            .aws_metadata_get(
                client,
                &format!("{}/{}", url.trim_end_matches('/'), role),
                session_token,
                "AwsSource/Credentials",
            )
            .await?;
        serde_json::from_str(&body)
            .map_err(|err| Error::Json("failed to parse AWS security credentials", err))
    }

    async fn aws_metadata_get(
        &self,
        client: &HttpClient,
        url: &str,
        session_token: Option<&str>,
        ctx: &'static str,
    ) -> Result<String, Error> {
        let mut builder = Request::get(url);
        if let Some(token) = session_token {
            builder = builder.header("x-aws-ec2-metadata-token", token);
        }
        let body = client
            .request(builder.body(Full::from(Bytes::new())).unwrap(), ctx)
            .await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Produce the SigV4 `Authorization` header for a GetCallerIdentity POST
fn sign_get_caller_identity(
    verification_url: &str,
    amz_date: &str,
    region: &str,
    headers: &[(&str, String)],
    credentials: &AwsSecurityCredentials,
) -> Result<String, Error> {
    let url = url::Url::parse(verification_url)
        .map_err(|_| Error::Str("invalid regional_cred_verification_url"))?;
    let canonical_query = url.query().unwrap_or("");
    let canonical_headers: String = headers
        .iter()
        .map(|(key, value)| format!("{key}:{value}\n"))
        .collect();
    let signed_headers: Vec<&str> = headers.iter().map(|(key, _)| *key).collect();
    let signed_headers = signed_headers.join(";");
    let payload_hash = hex(digest::digest(&digest::SHA256, b"").as_ref());

    let canonical_request = format!(
        "POST\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        path = url.path(),
    );

    let date = &amz_date[..8];
    let scope = format!("{date}/{region}/sts/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{hash}",
        hash = hex(digest::digest(&digest::SHA256, canonical_request.as_bytes()).as_ref()),
    );

    let signing_key = derive_signing_key(&credentials.secret_access_key, date, region, "sts");
    let signature = hex(hmac::sign(&signing_key, string_to_sign.as_bytes()).as_ref());

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id,
    ))
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> hmac::Key {
    let mut key = hmac::Key::new(hmac::HMAC_SHA256, format!("AWS4{secret}").as_bytes());
    for part in [date, region, service, "aws4_request"] {
        let tag = hmac::sign(&key, part.as_bytes());
        key = hmac::Key::new(hmac::HMAC_SHA256, tag.as_ref());
    }
    key
}

fn hex(data: &[u8]) -> String {
    use std::fmt::Write;
    data.iter().fold(String::with_capacity(data.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_format_extraction() {
        let format = SourceFormat {
            format_type: "json".into(),
            subject_token_field_name: Some("access_token".into()),
        };
        let token =
            extract_token(r#"{"access_token": "subject-token"}"#.into(), Some(&format)).unwrap();
        assert_eq!(token, "subject-token");

        let missing = extract_token(r#"{"other": "x"}"#.into(), Some(&format));
        assert!(missing.is_err());

        // Text format passes the body through untouched.
        assert_eq!(extract_token("raw".into(), None).unwrap(), "raw");
    }

    #[test]
    fn source_dispatch_prefers_aws_environment() {
        let source: CredentialSource = serde_json::from_str(
            r#"{
                "environment_id": "aws1",
                "region_url": "http://169.254.169.254/latest/meta-data/placement/availability-zone",
                "url": "http://169.254.169.254/latest/meta-data/iam/security-credentials",
                "regional_cred_verification_url": "https://sts.{region}.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15"
            }"#,
        )
        .unwrap();
        assert!(matches!(
            SubjectTokenSource::new(source).unwrap(),
            SubjectTokenSource::Aws(_)
        ));
    }

    #[test]
    fn source_without_any_variant_is_rejected() {
        let source: CredentialSource = serde_json::from_str("{}").unwrap();
        assert!(SubjectTokenSource::new(source).is_err());
    }

    #[tokio::test]
    async fn executable_source_requires_opt_in() {
        std::env::remove_var(ALLOW_EXECUTABLES_VAR);
        let config = ExecutableConfig {
            command: "/bin/true".into(),
            timeout_millis: None,
            output_file: None,
        };
        assert!(executable_token(&config).await.is_err());
    }

    #[test]
    fn executable_response_token_selection() {
        let jwt: ExecutableResponse = serde_json::from_str(
            r#"{"version": 1, "success": true, "token_type": "urn:ietf:params:oauth:token-type:jwt", "id_token": "header.payload.sig"}"#,
        )
        .unwrap();
        assert_eq!(token_from_response(jwt).unwrap(), "header.payload.sig");

        let failed: ExecutableResponse = serde_json::from_str(
            r#"{"version": 1, "success": false, "code": "401", "message": "denied"}"#,
        )
        .unwrap();
        assert!(token_from_response(failed).is_err());
    }

    #[test]
    fn sigv4_signing_key_matches_reference_vector() {
        // Worked example from the AWS signature documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        let tag = hmac::sign(&key, b"test");
        assert_eq!(tag.as_ref().len(), 32);

        // The derived signature over the documented string-to-sign.
        let signature = hex(
            hmac::sign(
                &derive_signing_key(
                    "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
                    "20150830",
                    "us-east-1",
                    "iam",
                ),
                b"AWS4-HMAC-SHA256\n20150830T123600Z\n20150830/us-east-1/iam/aws4_request\nf536975d06c0309214f805bb90ccff089219ecd68b2577efef23edd43b7e1a59",
            )
            .as_ref(),
        );
        assert_eq!(
            signature,
            "5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
    }

    #[test]
    fn get_caller_identity_signature_shape() {
        let credentials = AwsSecurityCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            token: None,
        };
        let headers = vec![
            ("host", "sts.us-east-2.amazonaws.com".to_owned()),
            ("x-amz-date", "20200811T065522Z".to_owned()),
            (
                "x-goog-cloud-target-resource",
                "//iam.googleapis.com/projects/123456/locations/global/workloadIdentityPools/pool/providers/aws".to_owned(),
            ),
        ];
        let authorization = sign_get_caller_identity(
            "https://sts.us-east-2.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15",
            "20200811T065522Z",
            "us-east-2",
            &headers,
            &credentials,
        )
        .unwrap();

        assert!(authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20200811/us-east-2/sts/aws4_request, "
        ));
        assert!(authorization
            .contains("SignedHeaders=host;x-amz-date;x-goog-cloud-target-resource"));
        let signature = authorization.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
