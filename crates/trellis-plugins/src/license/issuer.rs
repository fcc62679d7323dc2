use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::PluginResult;
use crate::verification::{Ed25519Signer, LicenseCredential, LicenseType, StatusListEntry};

/// What a license is being issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRequest {
    pub plugin_id: String,
    /// Payer identity the license is bound to
    pub subject: String,
    pub license_type: LicenseType,
    pub expires_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
}

/// Produces signed license credentials
#[async_trait]
pub trait LicenseIssuer: Send + Sync {
    async fn issue(&self, request: &LicenseRequest) -> PluginResult<LicenseCredential>;
}

/// Issues credentials signed with a local Ed25519 key
pub struct Ed25519LicenseIssuer {
    issuer: String,
    signer: Ed25519Signer,
    status_list_url: Option<String>,
    next_status_index: AtomicUsize,
}

impl Ed25519LicenseIssuer {
    pub fn new(issuer: impl Into<String>, signer: Ed25519Signer) -> Self {
        Self {
            issuer: issuer.into(),
            signer,
            status_list_url: None,
            next_status_index: AtomicUsize::new(0),
        }
    }

    /// Assign each issued credential the next index in this status list
    pub fn with_status_list(mut self, url: impl Into<String>) -> Self {
        self.status_list_url = Some(url.into());
        self
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn signer(&self) -> &Ed25519Signer {
        &self.signer
    }
}

#[async_trait]
impl LicenseIssuer for Ed25519LicenseIssuer {
    async fn issue(&self, request: &LicenseRequest) -> PluginResult<LicenseCredential> {
        let credential_status = self.status_list_url.as_ref().map(|url| {
            StatusListEntry::new(url.clone(), self.next_status_index.fetch_add(1, Ordering::SeqCst))
        });

        let mut credential = LicenseCredential {
            id: format!("urn:uuid:{}", Uuid::new_v4()),
            plugin_id: request.plugin_id.clone(),
            issuer: self.issuer.clone(),
            subject: request.subject.clone(),
            license_type: request.license_type,
            issued_at: Utc::now(),
            expires_at: request.expires_at,
            credential_status,
            proof: None,
        };
        self.signer.sign(&mut credential)?;
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LicenseRequest {
        LicenseRequest {
            plugin_id: "did-web".to_string(),
            subject: "did:example:alice".to_string(),
            license_type: LicenseType::Paid,
            expires_at: None,
            transaction_id: Some("tx-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_issued_credentials_are_signed_and_unique() {
        let issuer = Ed25519LicenseIssuer::new(
            "did:example:issuer",
            Ed25519Signer::generate("did:example:issuer#key-1"),
        );

        let a = issuer.issue(&request()).await.unwrap();
        let b = issuer.issue(&request()).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.subject, "did:example:alice");
        assert_eq!(a.issuer, "did:example:issuer");
        assert!(a.proof.is_some());
        assert!(a.credential_status.is_none());
    }

    #[tokio::test]
    async fn test_status_indices_increase() {
        let issuer = Ed25519LicenseIssuer::new(
            "did:example:issuer",
            Ed25519Signer::generate("did:example:issuer#key-1"),
        )
        .with_status_list("https://status.example/1");

        let first = issuer.issue(&request()).await.unwrap();
        let second = issuer.issue(&request()).await.unwrap();
        assert_eq!(first.credential_status.unwrap().status_list_index, 0);
        assert_eq!(second.credential_status.unwrap().status_list_index, 1);
    }
}
