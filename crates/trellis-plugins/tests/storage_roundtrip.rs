//! Config and license records survive a store/get cycle on every backend

use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use trellis_plugins::RecordKind;
use trellis_plugins::storage::{FileBackend, InMemoryBackend, PluginConfig, StorageKey, StorageManager};

fn config() -> PluginConfig {
    let mut config = PluginConfig::new();
    config.insert("endpoint".to_string(), json!("https://resolver.example/1.0"));
    config.insert("retries".to_string(), json!(3));
    config.insert("methods".to_string(), json!(["did:web", "did:key"]));
    config.insert("tls".to_string(), json!({ "verify": true, "pins": [] }));
    config
}

#[tokio::test]
async fn test_plaintext_config_round_trip() {
    let storage = StorageManager::in_memory("agent").unwrap();
    storage.store_config("did-web", &config()).await.unwrap();
    assert_eq!(storage.get_config("did-web").await, Some(config()));
}

#[tokio::test]
async fn test_encrypted_config_round_trip() {
    let backend = Arc::new(InMemoryBackend::new());
    let storage = StorageManager::new(backend.clone(), "agent")
        .unwrap()
        .with_key(StorageKey::generate());

    storage.store_config("did-web", &config()).await.unwrap();
    assert_eq!(storage.get_config("did-web").await, Some(config()));

    let raw = backend.raw("agent-config-did-web").await.unwrap();
    assert!(!raw.contains("resolver.example"));
}

#[tokio::test]
async fn test_encrypted_file_backend_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let key = StorageKey::from_passphrase("correct horse battery staple");

    {
        let backend = Arc::new(FileBackend::open(dir.path()).await.unwrap());
        let storage = StorageManager::new(backend, "agent").unwrap().with_key(key.clone());
        storage.store_config("did-web", &config()).await.unwrap();
        storage.store_config("did-key", &PluginConfig::new()).await.unwrap();
    }

    let backend = Arc::new(FileBackend::open(dir.path()).await.unwrap());
    let storage = StorageManager::new(backend.clone(), "agent").unwrap().with_key(key);
    assert_eq!(storage.get_config("did-web").await, Some(config()));
    assert_eq!(
        storage.list(RecordKind::Config).await,
        vec!["did-key".to_string(), "did-web".to_string()]
    );

    // A different key sees nothing usable
    let stranger = StorageManager::new(backend, "agent")
        .unwrap()
        .with_key(StorageKey::generate());
    assert_eq!(stranger.get_config("did-web").await, None);
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let backend = Arc::new(InMemoryBackend::new());
    let a = StorageManager::new(backend.clone(), "alpha").unwrap();
    let b = StorageManager::new(backend, "beta").unwrap();

    a.store_config("did-web", &config()).await.unwrap();
    assert!(b.get_config("did-web").await.is_none());
    assert_eq!(b.clear().await.unwrap(), 0);
    assert_eq!(a.clear().await.unwrap(), 1);
    assert!(a.get_config("did-web").await.is_none());
}
