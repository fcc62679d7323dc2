//! Namespaced, optionally encrypted plugin storage
//!
//! Records live under `<namespace>-<kind>-<plugin id>`. Without a key the
//! records are written in plaintext; set `TRELLIS_STORAGE_KEY` (or pass a
//! [`StorageKey`]) to encrypt them with AES-256-GCM.

mod backend;
mod cipher;
mod manager;

pub use backend::{FileBackend, InMemoryBackend, KeyValueBackend};
pub use cipher::{StorageCipher, StorageKey};
pub use manager::{PluginConfig, StorageManager};

use serde::{Deserialize, Serialize};

/// Kind of record held for a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Config,
    License,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::License => "license",
        }
    }

    pub fn all() -> [RecordKind; 2] {
        [Self::Config, Self::License]
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
