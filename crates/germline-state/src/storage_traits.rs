//! Storage trait definitions for germline
//!
//! These traits define the storage abstractions the orchestrator relies on:
//! - `CasStore`: Content-addressed blob storage (put/get by digest)
//! - `KvStore`: Keyed record storage for lifecycle state
//!
//! All traits are async and backend-agnostic. In-memory fakes live in the
//! `fakes` module, filesystem backends in `fs`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CasStore: content-addressed storage
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_parts([data])
    }

    /// Compute one digest over several byte slices, in order.
    pub fn from_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed blob store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;

    /// Delete content by digest. No-op if absent.
    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// KvStore: keyed records
// ---------------------------------------------------------------------------

/// Keyed record store.
///
/// Keys are `/`-separated paths of non-empty segments made of ASCII
/// alphanumerics, `-`, `_` and `.` (never `.` or `..` alone).
///
/// Guarantees:
/// - `put` replaces any previous value atomically: readers see the old or the
///   new value, never a torn write.
/// - `list(prefix)` returns matching keys in ascending order.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or replace the value stored under `key`.
    async fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Fetch the value for `key`, `None` if absent.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Remove `key`. No-op if absent.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Validate a `KvStore` key, shared by every backend.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    for segment in key.split('/') {
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }
        if segment == "." || segment == ".." {
            return Err(invalid("relative path segments are not allowed"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("unsupported character"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_from_parts_matches_concatenation() {
        let joined = ContentDigest::from_bytes(b"hello world");
        let parts = ContentDigest::from_parts([b"hello ".as_slice(), b"world".as_slice()]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn digest_try_from_rejects_short_hex() {
        assert!(ContentDigest::try_from("abcd".to_string()).is_err());
    }

    #[test]
    fn digest_serde_validates() {
        let digest = ContentDigest::from_bytes(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);

        let bad: Result<ContentDigest, _> = serde_json::from_str("\"nothex\"");
        assert!(bad.is_err());
    }

    #[test]
    fn short_is_twelve_chars() {
        assert_eq!(ContentDigest::from_bytes(b"x").short().len(), 12);
    }

    #[test]
    fn validate_key_accepts_nested_paths() {
        assert!(validate_key("candidates/3").is_ok());
        assert!(validate_key("registry.json").is_ok());
    }

    #[test]
    fn validate_key_rejects_escapes() {
        assert!(validate_key("").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("../etc").is_err());
        assert!(validate_key("a/b c").is_err());
    }
}
