//! Object store port (C1) — byte blob get/put/delete/sign-url, keyed by an
//! opaque string. `local` and `s3`-compatible backends share this trait so
//! the rest of the system never branches on which one is configured.

use async_trait::async_trait;
use std::time::Duration;

pub mod local;

#[cfg(feature = "storage-s3")]
pub mod s3;

/// Failure classification the orchestrator uses to decide whether a retry
/// makes sense — only transient failures are worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("permanent storage error: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()>;
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Returns a URL usable by a client to fetch the object directly.
    /// The local backend returns a path-based URL with no real expiry; only
    /// genuine remote backends enforce `ttl`.
    async fn signed_url(&self, key: &str, ttl: Duration) -> StorageResult<String>;
}

/// Validates that `key` is a well-formed object-store key: no `..` traversal
/// segments, no absolute paths, no empty segments. Every backend must call
/// this before touching the filesystem/network so a malicious key (however
/// it got constructed) can never escape the configured root.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::Permanent("empty storage key".into()));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::Permanent(format!(
            "storage key must be relative: {key}"
        )));
    }
    if key.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(StorageError::Permanent(format!(
            "storage key must not contain '..': {key}"
        )));
    }
    Ok(())
}

/// Builds the canonical key for a given image id and variant/source kind.
pub fn object_key(image_id: &str, suffix: &str) -> String {
    format!("images/{image_id}/{suffix}")
}
