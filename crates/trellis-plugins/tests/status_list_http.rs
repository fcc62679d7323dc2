//! Revocation lookups against a real HTTP status list endpoint

use std::sync::Arc;
use trellis_core::config::{RevocationFailurePolicy, VerificationConfig};
use trellis_plugins::StorageManager;
use trellis_plugins::verification::{
    HttpStatusListFetcher, LicenseCredential, ProofVerifier, StatusBits, StatusListEntry,
    encode_status_list,
};
use trellis_plugins::{PluginResult, VerificationEngine};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TrustEverything;

#[async_trait::async_trait]
impl ProofVerifier for TrustEverything {
    async fn verify(&self, _credential: &LicenseCredential) -> PluginResult<()> {
        Ok(())
    }
}

fn engine(policy: RevocationFailurePolicy) -> VerificationEngine {
    let config = VerificationConfig {
        revocation_failure_policy: policy,
        ..VerificationConfig::default()
    };
    VerificationEngine::new(
        config,
        StorageManager::in_memory("test").unwrap(),
        Arc::new(TrustEverything),
        Arc::new(HttpStatusListFetcher::new().unwrap()),
    )
}

/// Index 3 and index 9 revoked
fn status_list_document() -> serde_json::Value {
    let bits = StatusBits::from_bytes(vec![0b0001_0000, 0b0100_0000]);
    serde_json::json!({
        "type": ["VerifiableCredential", "BitstringStatusListCredential"],
        "credentialSubject": {
            "type": "BitstringStatusList",
            "statusPurpose": "revocation",
            "encodedList": encode_status_list(&bits).unwrap(),
        }
    })
}

#[tokio::test]
async fn test_revoked_and_active_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_list_document()))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine(RevocationFailurePolicy::FailOpen);
    let url = format!("{}/status/1", server.uri());

    let revoked = engine
        .verify_status_list(&StatusListEntry::new(url.clone(), 3))
        .await
        .unwrap();
    assert!(revoked.revoked);
    assert!(revoked.warning.is_none());

    // Served from the status list cache; the mock expects a single request
    let later = engine
        .verify_status_list(&StatusListEntry::new(url.clone(), 9))
        .await
        .unwrap();
    assert!(later.revoked);
    let active = engine
        .verify_status_list(&StatusListEntry::new(url.clone(), 4))
        .await
        .unwrap();
    assert!(!active.revoked);

    assert!(
        engine
            .verify_status_list(&StatusListEntry::new(url, 16))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_unreachable_list_fail_open() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let engine = engine(RevocationFailurePolicy::FailOpen);
    let check = engine
        .verify_status_list(&StatusListEntry::new(format!("{}/status/gone", server.uri()), 0))
        .await
        .unwrap();

    assert!(!check.revoked);
    assert!(check.warning.unwrap().contains("404"));
}

#[tokio::test]
async fn test_unreachable_list_fail_closed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let engine = engine(RevocationFailurePolicy::FailClosed);
    let result = engine
        .verify_status_list(&StatusListEntry::new(format!("{}/status/down", server.uri()), 0))
        .await;

    assert!(result.is_err());
}
