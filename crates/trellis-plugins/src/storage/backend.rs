//! Physical key-value backends
//!
//! The storage manager only needs string keys mapped to string values.
//! Hosts plug in whatever medium they have; two backends ship here.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::{PluginError, PluginResult};

/// Persistence medium behind a [`StorageManager`](super::StorageManager)
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> PluginResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> PluginResult<()>;

    /// Removing an absent key is not an error
    async fn remove(&self, key: &str) -> PluginResult<()>;

    async fn keys(&self) -> PluginResult<Vec<String>>;
}

/// Process-local backend, mostly for tests and ephemeral hosts
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored value, bypassing decryption
    pub async fn raw(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> PluginResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> PluginResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> PluginResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> PluginResult<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// One file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Create the backend, creating `dir` if needed
    pub async fn open(dir: impl Into<PathBuf>) -> PluginResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| PluginError::FileSystem {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PluginResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

/// Keys become file names and must not escape the directory
fn validate_key(key: &str) -> PluginResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PluginError::Storage(format!("Invalid storage key '{key}'")))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> PluginError {
    PluginError::Storage(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl KeyValueBackend for FileBackend {
    async fn get(&self, key: &str) -> PluginResult<Option<String>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn set(&self, key: &str, value: String) -> PluginResult<()> {
        let path = self.path_for(key)?;
        // Write-then-rename so a crash never leaves a half-written record
        let tmp = self.dir.join(format!(".{key}.tmp"));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn remove(&self, key: &str) -> PluginResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn keys(&self) -> PluginResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if validate_key(name).is_ok() {
                    keys.push(name.to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_backend() {
        let backend = InMemoryBackend::new();
        backend.set("ns-config-a", "1".to_string()).await.unwrap();

        assert_eq!(backend.get("ns-config-a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(backend.keys().await.unwrap(), vec!["ns-config-a".to_string()]);

        backend.remove("ns-config-a").await.unwrap();
        backend.remove("ns-config-a").await.unwrap();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_file_backend_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::open(temp.path().join("store")).await.unwrap();
        backend
            .set("trellis-license-did-key", "{}".to_string())
            .await
            .unwrap();

        let reopened = FileBackend::open(temp.path().join("store")).await.unwrap();
        assert_eq!(
            reopened.get("trellis-license-did-key").await.unwrap().as_deref(),
            Some("{}")
        );
        assert_eq!(
            reopened.keys().await.unwrap(),
            vec!["trellis-license-did-key".to_string()]
        );
    }

    #[tokio::test]
    async fn test_file_backend_missing_key() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::open(temp.path()).await.unwrap();
        assert!(backend.get("absent").await.unwrap().is_none());
        assert!(backend.remove("absent").await.is_ok());
    }

    #[tokio::test]
    async fn test_file_backend_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::open(temp.path()).await.unwrap();

        for key in ["../evil", "a/b", ".hidden", ""] {
            assert!(
                matches!(backend.set(key, "x".to_string()).await, Err(PluginError::Storage(_))),
                "key {key:?} should be rejected"
            );
        }
    }
}
