//! AWS Signature Version 4 for the signaling control plane and the
//! presigned WebSocket connect URL.

use std::fmt::{self, Write as _};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const DEFAULT_SERVICE: &str = "kinesisvideo";
/// Lifetime of a presigned connect URL. The service rejects anything at or
/// above five minutes.
pub const PRESIGN_EXPIRES_SECS: u32 = 299;

const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Static access credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: Option<String>) -> Self {
        self.session_token = token.filter(|value| !value.is_empty());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SigV4Signer {
    credentials: Credentials,
    region: String,
    service: String,
    clock_offset: time::Duration,
}

impl SigV4Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: DEFAULT_SERVICE.to_string(),
            clock_offset: time::Duration::ZERO,
        }
    }

    /// Shift every signing timestamp by `offset` to compensate for local
    /// clock skew.
    pub fn with_clock_offset(mut self, offset: time::Duration) -> Self {
        self.clock_offset = offset;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + self.clock_offset
    }

    /// Returns the headers to attach to the request: `x-amz-date`, the
    /// optional `x-amz-security-token` and `authorization`. `headers` are
    /// the caller's own headers, which are signed alongside `host`.
    pub fn sign_request(
        &self,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
        payload: &[u8],
        now: OffsetDateTime,
    ) -> Vec<(String, String)> {
        let amz_date = amz_date(now);
        let mut extra = vec![("x-amz-date".to_string(), amz_date.clone())];
        if let Some(token) = &self.credentials.session_token {
            extra.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let mut signed: Vec<(String, String)> = headers
            .iter()
            .chain(extra.iter())
            .map(|(name, value)| (name.to_ascii_lowercase(), normalize_header_value(value)))
            .collect();
        signed.push(("host".to_string(), host_header(url)));
        signed.sort();

        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let canonical = canonical_request(
            method,
            canonical_path(url),
            &canonical_query_string(&query),
            &signed,
            &hex::encode(Sha256::digest(payload)),
        );
        let scope = self.scope(now);
        let signature = self.signature(&amz_date, &scope, now, &canonical);
        let signed_names = signed_header_names(&signed);

        extra.push((
            "authorization".to_string(),
            format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_names}, Signature={signature}",
                self.credentials.access_key_id
            ),
        ));
        extra
    }

    /// Presign a `GET` of `url` (typically the `wss://` signaling endpoint
    /// with its channel query already attached). Only `host` is signed and
    /// the signature is the last query parameter.
    pub fn presign_url(&self, url: &Url, now: OffsetDateTime, expires_secs: u32) -> Url {
        let amz_date = amz_date(now);
        let scope = self.scope(now);

        let mut params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        params.push(("X-Amz-Algorithm".into(), ALGORITHM.into()));
        params.push((
            "X-Amz-Credential".into(),
            format!("{}/{scope}", self.credentials.access_key_id),
        ));
        params.push(("X-Amz-Date".into(), amz_date.clone()));
        params.push(("X-Amz-Expires".into(), expires_secs.to_string()));
        if let Some(token) = &self.credentials.session_token {
            params.push(("X-Amz-Security-Token".into(), token.clone()));
        }
        params.push(("X-Amz-SignedHeaders".into(), "host".into()));

        let query = canonical_query_string(&params);
        let headers = vec![("host".to_string(), host_header(url))];
        let canonical = canonical_request(
            "GET",
            canonical_path(url),
            &query,
            &headers,
            EMPTY_PAYLOAD_SHA256,
        );
        let signature = self.signature(&amz_date, &scope, now, &canonical);

        let mut presigned = url.clone();
        presigned.set_query(Some(&format!("{query}&X-Amz-Signature={signature}")));
        presigned
    }

    fn scope(&self, now: OffsetDateTime) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            short_date(now),
            self.region,
            self.service
        )
    }

    fn signature(
        &self,
        amz_date: &str,
        scope: &str,
        now: OffsetDateTime,
        canonical_request: &str,
    ) -> String {
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(
            &self.credentials.secret_access_key,
            &short_date(now),
            &self.region,
            &self.service,
        );
        hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()))
    }
}

pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts arbitrary key lengths"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(String, String)],
    payload_hash: &str,
) -> String {
    let mut canonical_headers = String::new();
    for (name, value) in headers {
        let _ = writeln!(canonical_headers, "{name}:{value}");
    }
    format!(
        "{method}\n{path}\n{query}\n{canonical_headers}\n{}\n{payload_hash}",
        signed_header_names(headers)
    )
}

fn signed_header_names(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";")
}

fn canonical_path(url: &Url) -> &str {
    match url.path() {
        "" => "/",
        path => path,
    }
}

pub(crate) fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (uri_encode(key), uri_encode(value)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// RFC 3986 encoding as SigV4 expects it: only unreserved characters pass
/// through, everything else is `%XX` with upper-case hex.
pub(crate) fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn amz_date(now: OffsetDateTime) -> String {
    format!(
        "{}T{:02}{:02}{:02}Z",
        short_date(now),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn short_date(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    )
}
