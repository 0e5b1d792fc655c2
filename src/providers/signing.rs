//! HMAC-signed URLs for backends without native presigning.
//!
//! A signed URL carries `expires` (unix seconds) and `signature`
//! (hex HMAC-SHA256 over `"{key}\n{expires}"`) as query parameters.

use super::{ProviderError, ProviderResult, join_url, validate_expiry};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{fmt, time::Duration};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signed URL has expired")]
    Expired,
    #[error("signature does not match")]
    Invalid,
}

#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
    base_url: String,
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSigner")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, base_url: impl Into<String>) -> ProviderResult<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(ProviderError::Configuration(
                "signing secret must not be empty".into(),
            ));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|err| ProviderError::Configuration(format!("signing secret: {err}")))?;
        Ok(Self {
            mac,
            base_url: base_url.into(),
        })
    }

    fn signature(&self, key: &str, expires: i64) -> String {
        let mut mac = self.mac.clone();
        mac.update(format!("{key}\n{expires}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build a URL for `key` valid until `expires` (unix seconds).
    pub fn sign_until(&self, key: &str, expires: i64) -> String {
        format!(
            "{}?expires={}&signature={}",
            join_url(&self.base_url, key),
            expires,
            self.signature(key, expires)
        )
    }

    /// Build a URL for `key` valid for `expires_in` from now.
    pub fn sign(&self, key: &str, expires_in: Duration) -> ProviderResult<String> {
        validate_expiry(expires_in)?;
        let seconds = i64::try_from(expires_in.as_secs())
            .map_err(|_| ProviderError::InvalidRequest("signed URL expiry is too large".into()))?;
        let expires = Utc::now().timestamp().saturating_add(seconds.max(1));
        Ok(self.sign_until(key, expires))
    }

    /// Check a signature presented for `key` at time `now` (unix seconds).
    pub fn verify(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: i64,
    ) -> Result<(), SignatureError> {
        let provided = hex::decode(signature).map_err(|_| SignatureError::Invalid)?;
        let mut mac = self.mac.clone();
        mac.update(format!("{key}\n{expires}").as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| SignatureError::Invalid)?;
        if now > expires {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }
}

/// Extract `expires` from a signed URL's query string.
#[cfg(test)]
pub fn expires_param(url: &str) -> Option<i64> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "expires")
        .and_then(|(_, value)| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_url_round_trips() {
        let signer = UrlSigner::new("secret", "https://files.example.com").unwrap();
        let url = signer.sign_until("a/b c.png", 2_000);
        assert!(url.starts_with("https://files.example.com/a/b%20c.png?expires=2000&signature="));

        let signature = url.rsplit("signature=").next().unwrap();
        assert_eq!(signer.verify("a/b c.png", 2_000, signature, 1_000), Ok(()));
        assert_eq!(
            signer.verify("a/b c.png", 2_000, signature, 2_001),
            Err(SignatureError::Expired)
        );
        assert_eq!(
            signer.verify("a/other.png", 2_000, signature, 1_000),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            signer.verify("a/b c.png", 9_000, signature, 1_000),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn sign_encodes_future_expiry() {
        let signer = UrlSigner::new("secret", "/files").unwrap();
        let before = Utc::now().timestamp();
        let url = signer.sign("k.txt", Duration::from_secs(3600)).unwrap();
        let expires = expires_param(&url).unwrap();
        assert!(expires >= before + 3600);
    }

    #[test]
    fn rejects_empty_secret_and_zero_expiry() {
        assert!(UrlSigner::new("", "/files").is_err());
        let signer = UrlSigner::new("s", "/files").unwrap();
        assert!(signer.sign("k", Duration::ZERO).is_err());
    }
}
