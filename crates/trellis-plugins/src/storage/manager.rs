use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_core::config::StorageConfig;

use super::backend::{InMemoryBackend, KeyValueBackend};
use super::cipher::{StorageCipher, StorageKey};
use super::RecordKind;
use crate::verification::CachedLicense;
use crate::{PluginError, PluginResult};

/// Config map persisted for a plugin
pub type PluginConfig = serde_json::Map<String, serde_json::Value>;

/// Owns one namespace of a key-value backend.
///
/// Reads never fail: a missing, unreadable or undecryptable record is
/// reported as absent and logged. Writes return errors so callers that need
/// durability can act on them.
#[derive(Clone)]
pub struct StorageManager {
    backend: Arc<dyn KeyValueBackend>,
    namespace: String,
    cipher: Option<StorageCipher>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("namespace", &self.namespace)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl StorageManager {
    pub fn new(backend: Arc<dyn KeyValueBackend>, namespace: impl Into<String>) -> PluginResult<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self {
            backend,
            namespace,
            cipher: None,
        })
    }

    /// Unencrypted manager over a fresh in-memory backend
    pub fn in_memory(namespace: impl Into<String>) -> PluginResult<Self> {
        Self::new(Arc::new(InMemoryBackend::new()), namespace)
    }

    /// Build from configuration; the key, if any, comes from the environment
    pub fn from_config(config: &StorageConfig, backend: Arc<dyn KeyValueBackend>) -> PluginResult<Self> {
        let manager = Self::new(backend, config.namespace.trim())?;
        let encoded = config
            .resolved_encryption_key()
            .map_err(|e| PluginError::Storage(e.to_string()))?;
        match encoded {
            Some(encoded) => Ok(manager.with_key(StorageKey::parse(&encoded)?)),
            None => {
                warn!(
                    namespace = %manager.namespace,
                    "No storage key configured; plugin records are stored unencrypted"
                );
                Ok(manager)
            }
        }
    }

    pub fn with_key(mut self, key: StorageKey) -> Self {
        self.cipher = Some(StorageCipher::new(key));
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn key_for(&self, kind: RecordKind, plugin_id: &str) -> String {
        format!("{}{}", self.prefix(kind), plugin_id)
    }

    fn prefix(&self, kind: RecordKind) -> String {
        format!("{}-{}-", self.namespace, kind.as_str())
    }

    pub async fn store<T: Serialize + Sync>(
        &self,
        kind: RecordKind,
        plugin_id: &str,
        value: &T,
    ) -> PluginResult<()> {
        let key = self.key_for(kind, plugin_id);
        let json = serde_json::to_vec(value)
            .map_err(|e| PluginError::Storage(format!("Failed to serialize '{key}': {e}")))?;

        let encoded = match &self.cipher {
            Some(cipher) => cipher.seal(&json)?,
            None => String::from_utf8(json)
                .map_err(|e| PluginError::Storage(format!("Failed to encode '{key}': {e}")))?,
        };

        self.backend.set(&key, encoded).await.inspect_err(|e| {
            warn!(storage_key = %key, error = %e, "Storage write failed");
        })?;
        debug!(storage_key = %key, encrypted = self.cipher.is_some(), "Stored record");
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, kind: RecordKind, plugin_id: &str) -> Option<T> {
        let key = self.key_for(kind, plugin_id);
        let raw = match self.backend.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(storage_key = %key, error = %e, "Storage read failed; treating as absent");
                return None;
            }
        };

        let decoded = match &self.cipher {
            Some(cipher) => cipher.open(&raw),
            None if StorageCipher::is_sealed(&raw) => {
                warn!(storage_key = %key, "Encrypted record but no storage key configured; treating as absent");
                return None;
            }
            None => Ok(raw.into_bytes()),
        };
        let bytes = match decoded {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(storage_key = %key, error = %e, "Could not decrypt record; treating as absent");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(storage_key = %key, error = %e, "Corrupt record; treating as absent");
                None
            }
        }
    }

    pub async fn delete(&self, kind: RecordKind, plugin_id: &str) -> PluginResult<()> {
        let key = self.key_for(kind, plugin_id);
        self.backend.remove(&key).await.inspect_err(|e| {
            warn!(storage_key = %key, error = %e, "Storage delete failed");
        })
    }

    /// Plugin ids holding a record of `kind`, sorted
    pub async fn list(&self, kind: RecordKind) -> Vec<String> {
        let prefix = self.prefix(kind);
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Storage listing failed; treating as empty");
                return Vec::new();
            }
        };

        let mut ids: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
        ids.sort();
        ids
    }

    /// Remove every record in this namespace; returns how many were removed
    pub async fn clear(&self) -> PluginResult<usize> {
        let prefixes: Vec<String> = RecordKind::all().iter().map(|k| self.prefix(*k)).collect();
        let keys = self.backend.keys().await?;

        let mut removed = 0;
        for key in keys
            .iter()
            .filter(|k| prefixes.iter().any(|p| k.starts_with(p.as_str())))
        {
            self.backend.remove(key).await?;
            removed += 1;
        }
        debug!(namespace = %self.namespace, removed, "Cleared storage namespace");
        Ok(removed)
    }

    pub async fn store_config(&self, plugin_id: &str, config: &PluginConfig) -> PluginResult<()> {
        self.store(RecordKind::Config, plugin_id, config).await
    }

    pub async fn get_config(&self, plugin_id: &str) -> Option<PluginConfig> {
        self.get(RecordKind::Config, plugin_id).await
    }

    pub async fn store_license(&self, plugin_id: &str, license: &CachedLicense) -> PluginResult<()> {
        self.store(RecordKind::License, plugin_id, license).await
    }

    pub async fn get_license(&self, plugin_id: &str) -> Option<CachedLicense> {
        self.get(RecordKind::License, plugin_id).await
    }

    pub async fn delete_license(&self, plugin_id: &str) -> PluginResult<()> {
        self.delete(RecordKind::License, plugin_id).await
    }
}

/// `-` separates key segments, so it cannot appear in the namespace
fn validate_namespace(namespace: &str) -> PluginResult<()> {
    if namespace.is_empty()
        || !namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(PluginError::Storage(format!(
            "Invalid storage namespace '{namespace}'"
        )));
    }
    Ok(())
}
