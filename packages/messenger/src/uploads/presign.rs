//! AWS Signature V4 query-string presigning for S3-compatible storage.
//!
//! Only what the upload flow needs: a time-limited URL for one object and
//! one method, optionally binding the `Content-Type` the client must send.

use axum::http::Method;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

use crate::config::UploadsConfig;

type HmacSha256 = Hmac<Sha256>;

/// Everything except RFC 3986 unreserved characters is escaped.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');
/// Object keys keep their `/` separators in the path.
const PATH_SEGMENT: &AsciiSet = &QUERY_VALUE.remove(b'/');

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
/// S3's upper bound for presigned URL lifetime
const MAX_EXPIRES: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum PresignError {
    #[error("invalid storage endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("storage endpoint has no host")]
    MissingHost,
    #[error("signing key rejected: {0}")]
    Key(#[from] hmac::digest::InvalidLength),
}

#[derive(Clone)]
pub struct Presigner {
    scheme: String,
    /// `host[:port]`, as sent in the Host header
    host: String,
    /// Path prefix in front of the object key, with a leading `/`
    prefix: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl std::fmt::Debug for Presigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presigner")
            .field("host", &self.host)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl Presigner {
    pub fn new(config: &UploadsConfig) -> Result<Self, PresignError> {
        let endpoint = Url::parse(&config.endpoint)?;
        let host = endpoint.host_str().ok_or(PresignError::MissingHost)?;
        let host = match endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let base_path = endpoint.path().trim_end_matches('/');

        let (host, prefix) = if config.path_style {
            (host, format!("{base_path}/{}", config.bucket))
        } else {
            (format!("{}.{host}", config.bucket), base_path.to_string())
        };

        Ok(Self {
            scheme: endpoint.scheme().to_string(),
            host,
            prefix,
            region: config.region.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    /// A URL allowing `method` on `key` until `now + expires`.
    ///
    /// With `content_type`, the header is signed and the client must send
    /// exactly that value.
    pub fn presign(
        &self,
        method: &Method,
        key: &str,
        content_type: Option<&str>,
        expires: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, PresignError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let expires = expires.clamp(Duration::from_secs(1), MAX_EXPIRES).as_secs();

        let path = format!(
            "{}/{}",
            self.prefix,
            utf8_percent_encode(key.trim_start_matches('/'), PATH_SEGMENT)
        );

        let (canonical_headers, signed_headers) = match content_type {
            Some(ct) => (
                format!("content-type:{}\nhost:{}\n", ct.trim(), self.host),
                "content-type;host",
            ),
            None => (format!("host:{}\n", self.host), "host"),
        };

        // Already in byte order of parameter name
        let query = [
            ("X-Amz-Algorithm", ALGORITHM.to_string()),
            ("X-Amz-Credential", format!("{}/{scope}", self.access_key)),
            ("X-Amz-Date", amz_date.clone()),
            ("X-Amz-Expires", expires.to_string()),
            ("X-Amz-SignedHeaders", signed_headers.to_string()),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", utf8_percent_encode(v, QUERY_VALUE)))
        .collect::<Vec<_>>()
        .join("&");

        let canonical_request = format!(
            "{}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\nUNSIGNED-PAYLOAD",
            method.as_str()
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac(format!("AWS4{}", self.secret_key).as_bytes(), &date)?;
        let k_region = hmac(&k_date, &self.region)?;
        let k_service = hmac(&k_region, SERVICE)?;
        let k_signing = hmac(&k_service, "aws4_request")?;
        let signature = hex::encode(hmac(&k_signing, &string_to_sign)?);

        Ok(format!(
            "{}://{}{path}?{query}&X-Amz-Signature={signature}",
            self.scheme, self.host
        ))
    }
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>, PresignError> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}
