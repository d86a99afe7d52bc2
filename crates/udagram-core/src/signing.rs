use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

use crate::errors::SignError;

/// Unreserved characters stay literal inside a key segment.
const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Issues a read URL for a stored object. Called synchronously while the
/// notification payload is built; a failure aborts the whole broadcast cycle.
pub trait UrlSigner: Send + Sync {
    fn sign(&self, bucket: &str, key: &str) -> Result<String, SignError>;
}

/// Plain public URL, for buckets served without authorization.
#[derive(Clone, Debug)]
pub struct PublicUrlSigner {
    base_url: String,
}

impl PublicUrlSigner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl UrlSigner for PublicUrlSigner {
    fn sign(&self, _bucket: &str, key: &str) -> Result<String, SignError> {
        object_url(&self.base_url, key)
    }
}

/// Time-limited URL carrying an expiry and a SHA-256 digest over
/// `secret`, bucket, key and expiry.
#[derive(Clone)]
pub struct PresignedUrlSigner {
    base_url: String,
    secret: String,
    expires_in: Duration,
}

impl std::fmt::Debug for PresignedUrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresignedUrlSigner")
            .field("base_url", &self.base_url)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

impl PresignedUrlSigner {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            secret: secret.into(),
            expires_in,
        }
    }

    fn signature(&self, bucket: &str, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(bucket.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Check a signature previously issued by this signer. Expired URLs fail.
    pub fn verify(&self, bucket: &str, key: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        self.signature(bucket, key, expires) == signature
    }
}

impl UrlSigner for PresignedUrlSigner {
    fn sign(&self, bucket: &str, key: &str) -> Result<String, SignError> {
        if self.secret.is_empty() {
            return Err(SignError::KeyUnavailable("empty signing secret".into()));
        }
        let ttl = i64::try_from(self.expires_in.as_secs())
            .map_err(|_| SignError::Clock(format!("expiry out of range: {:?}", self.expires_in)))?;
        let expires = Utc::now()
            .timestamp()
            .checked_add(ttl)
            .ok_or_else(|| SignError::Clock("expiry overflow".into()))?;

        let url = object_url(&self.base_url, key)?;
        let signature = self.signature(bucket, key, expires);
        Ok(format!("{url}?expires={expires}&signature={signature}"))
    }
}

fn object_url(base_url: &str, key: &str) -> Result<String, SignError> {
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(SignError::InvalidLocation("empty object key".into()));
    }
    let path = key
        .split('/')
        .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/");
    Ok(format!("{}/{}", base_url.trim_end_matches('/'), path))
}
