//! Filesystem-backed `ObjectStore`. Used for local development and for
//! single-node deployments that don't need an S3-compatible backend.
//!
//! Writes are atomic-on-success: bytes are written to a sibling temp file and
//! renamed into place, so a reader never observes a partially-written file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use super::{validate_key, ObjectStore, StorageError, StorageResult};

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalObjectStore { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn classify_io_error(e: &std::io::Error, key: &str) -> StorageError {
        match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                StorageError::Permanent(format!("permission denied for {key}: {e}"))
            }
            _ => StorageError::Transient(format!("io error for {key}: {e}")),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        let dest = self.resolve(key);
        let dir = dest.parent().unwrap_or(Path::new("."));
        let dir = dir.to_path_buf();
        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = dir.join(temp_name);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::classify_io_error(&e, key))?;
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| Self::classify_io_error(&e, key))?;
        tokio::fs::rename(&temp_path, &dest).await.map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            Self::classify_io_error(&e, key)
        })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        tokio::fs::read(self.resolve(key))
            .await
            .map_err(|e| Self::classify_io_error(&e, key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.resolve(key)).await {
            // Idempotent: deleting an already-absent key is not an error.
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::classify_io_error(&e, key)),
        }
    }

    async fn signed_url(&self, key: &str, _ttl: Duration) -> StorageResult<String> {
        validate_key(key)?;
        Ok(format!("/uploads/{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("images/a/source", b"hello".to_vec()).await.unwrap();
        let got = store.get("images/a/source").await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store.put("images/../../etc/passwd", b"x".to_vec()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.delete("images/a/source").await.unwrap();
        store.delete("images/a/source").await.unwrap();
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store.get("images/missing/source").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
