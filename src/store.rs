// src/store.rs

//! Blob storage for artifacts, lookaside sources and repository files
//!
//! Keys are free-form relative paths. RPMs live under
//! `<parent-task-id>/<basename>`, signed variants under
//! `<dir>/<gpg-id>/<basename>` and lookaside sources under their sha256 hex.

use crate::config::{StorageBackend, StorageSection};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Content store used by every workflow
pub trait BlobStore: Send + Sync {
    fn exists(&self, key: &str) -> Result<bool>;

    fn put(&self, key: &str, content: &[u8]) -> Result<()>;

    /// Store a file from disk under `key`
    fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let content = fs::read(path)?;
        self.put(key, &content)
    }

    /// Fetch a blob; missing keys are [`Error::NotFound`]
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Fetch a blob into a local file
    fn download(&self, key: &str, dest: &Path) -> Result<()> {
        let content = self.get(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, content)?;
        Ok(())
    }
}

/// Open the backend selected in configuration
pub fn open(config: &StorageSection) -> Result<Arc<dyn BlobStore>> {
    Ok(match config.backend {
        StorageBackend::Fs => Arc::new(FsStore::new(&config.root)?),
        StorageBackend::Memory => Arc::new(MemoryStore::default()),
    })
}

/// Blob store rooted at a local directory
#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
            debug!("Created blob store root: {:?}", root);
        }
        Ok(Self { root })
    }

    /// Map a key to its path, refusing keys that escape the root
    pub fn key_path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key.trim_start_matches('/'));
        if key.is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(Error::InvalidArgument(format!("invalid blob key: {}", key)));
        }
        Ok(self.root.join(rel))
    }
}

impl BlobStore for FsStore {
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_path(key)?.is_file())
    }

    fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to temp then rename so readers never see partial blobs
        let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        debug!("Stored blob {} ({} bytes)", key, content.len());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.key_path(key)?;
        match fs::read(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local blob store for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl BlobStore for MemoryStore {
    fn exists(&self, key: &str) -> Result<bool> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| Error::InternalError("blob store lock poisoned".to_string()))?;
        Ok(blobs.contains_key(key))
    }

    fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| Error::InternalError("blob store lock poisoned".to_string()))?;
        blobs.insert(key.to_string(), content.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| Error::InternalError("blob store lock poisoned".to_string()))?;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fs_store_put_get() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::new(temp.path().join("objects")).unwrap();

        assert!(!store.exists("task/foo-1.0-1.src.rpm").unwrap());
        store.put("task/foo-1.0-1.src.rpm", b"payload").unwrap();
        assert!(store.exists("task/foo-1.0-1.src.rpm").unwrap());
        assert_eq!(store.get("task/foo-1.0-1.src.rpm").unwrap(), b"payload");
    }

    #[test]
    fn test_fs_store_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::new(temp.path()).unwrap();
        assert!(store.put("../evil", b"x").is_err());
        assert!(store.put("", b"x").is_err());
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let store = MemoryStore::default();
        assert!(matches!(store.get("nope"), Err(Error::NotFound(_))));
        store.put("a/b", b"1").unwrap();
        assert_eq!(store.keys(), vec!["a/b"]);
    }
}
