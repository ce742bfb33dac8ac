//! Filesystem-backed storage.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

const RECORD_SUFFIX: &str = ".rec";

/// Write `data` to `path` atomically: temp file in the same directory, then rename.
fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = path.parent().ok_or_else(|| {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        ))
    })?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Filesystem-backed content-addressed store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
pub struct FsCasStore {
    objects_dir: PathBuf,
}

impl FsCasStore {
    /// Create a new `FsCasStore` rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.as_str();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

#[async_trait]
impl CasStore for FsCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let path = self.blob_path(&digest);

        if path.exists() {
            return Ok(digest);
        }

        write_atomic(&path, data)?;
        debug!(digest = %digest.short(), bytes = data.len(), "blob stored");
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    digest: digest.as_str().to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(self.blob_path(digest).exists())
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Filesystem-backed key-value store.
///
/// Layout: `<root>/records/<key>.rec`, where `/` in the key maps to a
/// directory boundary.
pub struct FsKvStore {
    records_dir: PathBuf,
}

impl FsKvStore {
    /// Create a new `FsKvStore` rooted at `root`. Creates `root/records/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let records_dir = root.as_ref().join("records");
        fs::create_dir_all(&records_dir)?;
        Ok(Self { records_dir })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let mut path = self.records_dir.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        let mut name = path.into_os_string();
        name.push(RECORD_SUFFIX);
        PathBuf::from(name)
    }

    fn collect_keys(dir: &Path, prefix: &str, out: &mut Vec<String>) -> StorageResult<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let nested = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                Self::collect_keys(&entry.path(), &nested, out)?;
            } else if let Some(stem) = name.strip_suffix(RECORD_SUFFIX) {
                // Temp files left by an interrupted write never carry the suffix.
                if prefix.is_empty() {
                    out.push(stem.to_string());
                } else {
                    out.push(format!("{prefix}/{stem}"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FsKvStore {
    async fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        write_atomic(&self.record_path(key), value)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.record_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        Self::collect_keys(&self.records_dir, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cas() -> (tempfile::TempDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCasStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn dedupe_invariant() {
        let (dir, store) = make_cas();
        let d1 = store.put(b"duplicate me").await.unwrap();
        let d2 = store.put(b"duplicate me").await.unwrap();
        assert_eq!(d1, d2);

        let shard = dir.path().join("objects").join(&d1.as_str()[..2]);
        let entries: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let (_dir, store) = make_cas();
        let digest = store.put(b"weights").await.unwrap();
        store.delete(&digest).await.unwrap();
        assert!(!store.contains(&digest).await.unwrap());
        assert!(matches!(
            store.get(&digest).await,
            Err(StorageError::NotFound { .. })
        ));
        // second delete is a no-op
        store.delete(&digest).await.unwrap();
    }

    #[tokio::test]
    async fn kv_keys_do_not_collide_with_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKvStore::new(dir.path()).unwrap();
        store.put("candidates", b"index").await.unwrap();
        store.put("candidates/0", b"zero").await.unwrap();

        assert_eq!(store.get("candidates").await.unwrap().unwrap(), b"index");
        assert_eq!(store.get("candidates/0").await.unwrap().unwrap(), b"zero");
        assert_eq!(
            store.list("candidates/").await.unwrap(),
            vec!["candidates/0".to_string()]
        );
    }

    #[tokio::test]
    async fn kv_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsKvStore::new(dir.path()).unwrap();
            store.put("registry", b"{}").await.unwrap();
        }
        let reopened = FsKvStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get("registry").await.unwrap().unwrap(), b"{}");
    }
}
