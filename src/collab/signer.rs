//! Signed, time-limited references to stored objects.
//!
//! A reference is `{public_base}/{key}?expires=<unix>&signature=<token>`,
//! where the token is the URL-safe base64 HMAC-SHA256 of `key|expires`
//! under the signing secret.
//! Whoever serves `public_base` checks it with [`UrlSigner::verify`].

use crate::error::Book2PdfError;
use crate::model::DownloadLink;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct UrlSigner {
    public_base: String,
    secret: String,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("public_base", &self.public_base)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(public_base: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            public_base: public_base.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    pub fn from_config(config: &crate::config::PipelineConfig) -> Self {
        Self::new(&config.public_base_url, &config.signing_secret)
    }

    /// Mint a reference to `key` valid for `ttl` from `now`.
    pub fn sign(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<DownloadLink, Book2PdfError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Book2PdfError::Internal(format!("link lifetime out of range: {e}")))?;
        let expires_at = now + ttl;
        let expires = expires_at.timestamp();

        let mut url = url::Url::parse(&format!("{}/{}", self.public_base, key)).map_err(|e| {
            Book2PdfError::Internal(format!(
                "cannot build a link under '{}': {e}",
                self.public_base
            ))
        })?;
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &self.token(key, expires));

        Ok(DownloadLink {
            download_link: url.to_string(),
            expires_at,
        })
    }

    /// `true` when `signature` was minted for `key` and `expires` is still ahead of `now`.
    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        if now.timestamp() > expires {
            return false;
        }
        let expected = self.token(key, expires);
        // Length and content compared without an early exit.
        expected.len() == signature.len()
            && expected
                .bytes()
                .zip(signature.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    fn token(&self, key: &str, expires: i64) -> String {
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            unreachable!("HMAC accepts every key length")
        };
        mac.update(key.as_bytes());
        mac.update(b"|");
        mac.update(expires.to_string().as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}
