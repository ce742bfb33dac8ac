//! Error types for germline-state

use thiserror::Error;

/// Errors produced by the storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Blob not present in a content-addressed store
    #[error("content not found: {digest}")]
    NotFound { digest: String },

    /// Digest string is not 64-char hex
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Key rejected by a key-value backend
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Underlying filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
