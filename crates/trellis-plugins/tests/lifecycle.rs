//! End-to-end flows across the license, verification and registry layers

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use trellis_core::config::{LicenseConfig, RegistryConfig, VerificationConfig};
use trellis_core::events::{InMemoryEventStore, PluginEventType};
use trellis_plugins::license::{
    Ed25519LicenseIssuer, LicenseIssuer, LicenseRequest, LicenseState, PaymentDetails,
    PaymentProcessor, PaymentReceipt, PaymentRequest, TransactionStatus,
};
use trellis_plugins::manager::DescriptorPlugin;
use trellis_plugins::verification::{
    Ed25519ProofVerifier, Ed25519Signer, IdentityDocument, InMemoryIdentityResolver,
    StatusListFetcher, VerificationMethod,
};
use trellis_plugins::{
    CachedLicense, InstallOptions, LicenseManager, LicenseType, MonetizationPolicy, PluginCategory,
    PluginDependency, PluginDescriptor, PluginError, PluginManager, PluginResult,
    SourceIdentityDeriver, StorageManager, VerifiableSource, VerificationEngine,
};

const MARKET: &str = "did:example:market";
const ALICE: &str = "did:example:alice";

struct Processor {
    status: TransactionStatus,
    calls: AtomicUsize,
}

#[async_trait]
impl PaymentProcessor for Processor {
    async fn process_payment(&self, request: &PaymentRequest) -> PluginResult<PaymentReceipt> {
        assert_eq!(request.payer_identity, ALICE);
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentReceipt {
            transaction_id: format!("tx-{n}"),
            status: self.status,
        })
    }
}

struct Offline;

#[async_trait]
impl StatusListFetcher for Offline {
    async fn fetch(&self, url: &str) -> PluginResult<String> {
        Err(PluginError::Verification(format!("{url} unreachable")))
    }
}

struct Host {
    storage: StorageManager,
    engine: Arc<VerificationEngine>,
    licenses: Arc<LicenseManager>,
    issuer: Arc<Ed25519LicenseIssuer>,
    processor: Arc<Processor>,
}

async fn host(status: TransactionStatus) -> Host {
    let signer = Ed25519Signer::generate(format!("{MARKET}#key-1"));
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    resolver
        .insert(IdentityDocument::new(MARKET).with_key(signer.verification_key(MARKET)))
        .await;

    let storage = StorageManager::in_memory("host").unwrap();
    let engine = Arc::new(VerificationEngine::new(
        VerificationConfig::default(),
        storage.clone(),
        Arc::new(Ed25519ProofVerifier::new(resolver)),
        Arc::new(Offline),
    ));
    let issuer = Arc::new(Ed25519LicenseIssuer::new(MARKET, signer));
    let processor = Arc::new(Processor {
        status,
        calls: AtomicUsize::new(0),
    });
    let licenses = Arc::new(
        LicenseManager::new(
            LicenseConfig::default(),
            storage.clone(),
            engine.clone(),
            issuer.clone(),
        )
        .with_payment_processor(processor.clone()),
    );

    Host {
        storage,
        engine,
        licenses,
        issuer,
        processor,
    }
}

fn descriptor(id: &str) -> PluginDescriptor {
    PluginDescriptor::new(id, id, "1.0.0", PluginCategory::DidMethod, "did:example:dev")
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn test_paid_install_completes() {
    let host = host(TransactionStatus::Completed).await;
    host.licenses
        .set_policy("did-web", MonetizationPolicy::paid(10.0, "USD"))
        .await
        .unwrap();

    let result = host
        .licenses
        .install_plugin("did-web", PaymentDetails::new(ALICE), InstallOptions::default())
        .await;

    assert!(result.success);
    assert!(result.errors.is_empty());
    assert!(result.license.is_some());
    assert_eq!(host.processor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.licenses.license_state("did-web").await, LicenseState::Active);
}

#[tokio::test]
async fn test_offline_ceiling_falls_back_online() {
    let host = host(TransactionStatus::Completed).await;
    host.licenses
        .set_policy("did-web", MonetizationPolicy::paid(10.0, "USD"))
        .await
        .unwrap();
    let installed = host
        .licenses
        .install_plugin("did-web", PaymentDetails::new(ALICE), InstallOptions::default().cached(false))
        .await;
    let credential = installed.license.unwrap();

    host.licenses
        .cache_license("did-web", &credential, Some(2))
        .await
        .unwrap();
    host.licenses.increment_offline_usage("did-web").await.unwrap();
    host.licenses.increment_offline_usage("did-web").await.unwrap();

    assert!(!host.licenses.check_offline_execution("did-web").await);
    let verified = host.licenses.verify_license("did-web").await;
    assert_eq!(verified.method, VerificationMethod::Online);
    assert!(verified.valid);

    // The counter survives in storage
    let cached: CachedLicense = host.storage.get_license("did-web").await.unwrap();
    assert_eq!(cached.usage_count, 2);
    assert_eq!(cached.remaining_uses(), 0);
}

#[tokio::test]
async fn test_expired_credential_invalid_online_and_cached() {
    let host = host(TransactionStatus::Completed).await;
    let credential = host
        .issuer
        .issue(&LicenseRequest {
            plugin_id: "did-web".to_string(),
            subject: ALICE.to_string(),
            license_type: LicenseType::Subscription,
            expires_at: Some(Utc::now() - Duration::minutes(1)),
            transaction_id: None,
        })
        .await
        .unwrap();

    let online = host.engine.verify_license_credential(&credential).await;
    assert!(!online.valid);

    let cached = CachedLicense::from_credential(&credential, 100);
    assert!(!host.engine.verify_cached_license(&cached).valid);
}

#[tokio::test]
async fn test_dependency_gating() {
    let events = Arc::new(InMemoryEventStore::new());
    let manager = PluginManager::new(
        RegistryConfig::default(),
        StorageManager::in_memory("host").unwrap(),
        events.clone(),
    );
    let b = DescriptorPlugin::shared(descriptor("b").with_dependency(PluginDependency::required("a", "*")));

    let early = manager.register_plugin(b.clone(), None).await;
    assert!(!early.success);
    assert_eq!(early.dependencies_missing, vec!["a".to_string()]);

    assert!(manager.register_plugin(DescriptorPlugin::shared(descriptor("a")), None).await.success);
    assert!(manager.register_plugin(b, None).await.success);
    assert_eq!(events.events_by_type(PluginEventType::Registered).len(), 2);
}

#[tokio::test]
async fn test_duplicate_leaves_first_registration_untouched() {
    let manager = PluginManager::new(
        RegistryConfig::default(),
        StorageManager::in_memory("host").unwrap(),
        Arc::new(InMemoryEventStore::new()),
    );
    let original = descriptor("did-key").with_capability("resolve");
    manager
        .register_plugin(DescriptorPlugin::shared(original.clone()), None)
        .await;

    let mut impostor = descriptor("did-key");
    impostor.version = "9.9.9".to_string();
    let result = manager.register_plugin(DescriptorPlugin::shared(impostor), None).await;

    assert!(!result.success);
    assert_eq!(manager.get_plugin("did-key").await, Some(original));
}

#[tokio::test]
async fn test_verifiable_plugin_registration() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "plugin.json", r#"{"name":"did-peer"}"#);
    write(tree.path(), "src/lib.rs", "pub fn resolve() {}");
    let identity = SourceIdentityDeriver::new()
        .snapshot(tree.path())
        .unwrap()
        .derived_identity;

    let host = host(TransactionStatus::Completed).await;
    let manager = PluginManager::new(
        RegistryConfig::default(),
        host.storage.clone(),
        Arc::new(InMemoryEventStore::new()),
    )
    .with_verification(host.engine.clone());

    let genuine = descriptor("did-peer").with_verification(VerifiableSource {
        source_path: tree.path().to_path_buf(),
        expected_identity: identity.clone(),
    });
    let result = manager.register_plugin(DescriptorPlugin::shared(genuine), None).await;
    assert!(result.success, "{:?}", result.errors);
    // No ledger or resolver configured
    assert!(!result.warnings.is_empty());
    let record = manager.source_record("did-peer").await.unwrap();
    assert_eq!(record.derived_identity, identity);
    assert_eq!(manager.get_statistics().await.verified_sources, 1);

    let forged = descriptor("did-peer-fork").with_verification(VerifiableSource {
        source_path: tree.path().to_path_buf(),
        expected_identity: "did:trellis:src:forged".to_string(),
    });
    let rejected = manager.register_plugin(DescriptorPlugin::shared(forged), None).await;
    assert!(!rejected.success);
    assert!(rejected.errors[0].contains("mismatch"));
}

#[tokio::test]
async fn test_monetized_plugin_registers_with_policy() {
    let host = host(TransactionStatus::Completed).await;
    let manager = PluginManager::new(
        RegistryConfig::default(),
        host.storage.clone(),
        Arc::new(InMemoryEventStore::new()),
    )
    .with_license_manager(host.licenses.clone());

    let paid = descriptor("did-ion").with_monetization(MonetizationPolicy::paid(5.0, "EUR"));
    let result = manager.register_plugin(DescriptorPlugin::shared(paid), None).await;
    assert!(result.success);
    assert!(result.warnings.iter().any(|w| w.contains("not licensed")));
    assert_eq!(
        host.licenses.policy("did-ion").await,
        Some(MonetizationPolicy::paid(5.0, "EUR"))
    );

    let installed = host
        .licenses
        .install_plugin("did-ion", PaymentDetails::new(ALICE), InstallOptions::default())
        .await;
    assert!(installed.success);
    assert!(host.licenses.check_offline_execution("did-ion").await);
}
