//! Content-addressed cache keys.
//!
//! `hash = SHA-256(normalized(text) || 0x1f || model_id || 0x1f || model_version)`
//!
//! Normalization is NFC plus trailing-whitespace trim. Case is preserved:
//! embeddings are case-sensitive. The 0x1f separators keep
//! `("ab", "c")` and `("a", "bc")` from colliding.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// A content key: the 32-byte hash plus the inputs needed to re-verify a
/// hash-equal row on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub hash: [u8; 32],
    pub text: String,
    pub model_id: String,
    pub model_version: String,
}

impl CacheKey {
    /// Compute the key for a text/model pair.
    pub fn compute(text: &str, model_id: &str, model_version: &str) -> Self {
        let normalized = normalize(text);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0x1f]);
        hasher.update(model_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(model_version.as_bytes());
        Self {
            hash: hasher.finalize().into(),
            text: normalized,
            model_id: model_id.to_string(),
            model_version: model_version.to_string(),
        }
    }

    /// Hex rendering of the hash for logs.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// NFC-normalize and trim trailing whitespace. Lowercasing is
/// deliberately absent.
pub fn normalize(text: &str) -> String {
    text.nfc().collect::<String>().trim_end().to_string()
}
