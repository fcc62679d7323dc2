//! External services the verification engine consults
//!
//! The host agent supplies these. Each trait is the narrowest interface the
//! engine needs; reference implementations are provided where the protocol
//! is standard (HTTP status lists, an in-memory resolver for tests and
//! embedded hosts).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::types::{LicenseCredential, ReleaseRecord};
use crate::source::SourceHash;
use crate::{PluginError, PluginResult};

/// Checks the cryptographic proof on a license credential.
///
/// `Ok(())` means the proof is valid. Any `Err` is reported as the reason the
/// credential failed verification.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(&self, credential: &LicenseCredential) -> PluginResult<()>;
}

/// Public key published in an identity document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationKey {
    pub id: String,
    pub controller: String,
    /// Base64 Ed25519 public key
    pub public_key_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDocument {
    pub id: String,
    #[serde(default)]
    pub verification_method: Vec<VerificationKey>,
    /// Identities this one is linked to
    #[serde(default)]
    pub also_known_as: Vec<String>,
}

impl IdentityDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: VerificationKey) -> Self {
        self.verification_method.push(key);
        self
    }

    pub fn find_key(&self, method_id: &str) -> Option<&VerificationKey> {
        self.verification_method.iter().find(|k| k.id == method_id)
    }
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` when the identity is unknown
    async fn resolve(&self, identity: &str) -> PluginResult<Option<IdentityDocument>>;
}

/// Resolver over a fixed set of documents
#[derive(Debug, Default)]
pub struct InMemoryIdentityResolver {
    documents: RwLock<HashMap<String, IdentityDocument>>,
}

impl InMemoryIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, document: IdentityDocument) {
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document);
    }
}

#[async_trait]
impl IdentityResolver for InMemoryIdentityResolver {
    async fn resolve(&self, identity: &str) -> PluginResult<Option<IdentityDocument>> {
        Ok(self.documents.read().await.get(identity).cloned())
    }
}

/// Ledger holding anchored plugin release records
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn query_credential_existence(
        &self,
        plugin_id: &str,
        source_hash: &SourceHash,
    ) -> PluginResult<bool>;

    /// Anchor a release; returns a locator for the record
    async fn publish_release_record(&self, record: &ReleaseRecord) -> PluginResult<String>;
}

/// Retrieves an encoded revocation list. Non-success responses are errors.
#[async_trait]
pub trait StatusListFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> PluginResult<String>;
}

/// Fetches status lists over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpStatusListFetcher {
    client: reqwest::Client,
}

impl HttpStatusListFetcher {
    pub fn new() -> PluginResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PluginError::Verification(format!("Cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusListFetcher for HttpStatusListFetcher {
    async fn fetch(&self, url: &str) -> PluginResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PluginError::Verification(format!("Status list request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PluginError::Verification(format!(
                "Status list fetch from {url} returned {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|e| PluginError::Verification(format!("Cannot read status list body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_resolver() {
        let resolver = InMemoryIdentityResolver::new();
        resolver
            .insert(IdentityDocument::new("did:example:issuer").with_key(VerificationKey {
                id: "did:example:issuer#key-1".to_string(),
                controller: "did:example:issuer".to_string(),
                public_key_base64: "AAAA".to_string(),
            }))
            .await;

        let doc = resolver.resolve("did:example:issuer").await.unwrap().unwrap();
        assert!(doc.find_key("did:example:issuer#key-1").is_some());
        assert!(doc.find_key("did:example:issuer#key-2").is_none());
        assert!(resolver.resolve("did:example:nobody").await.unwrap().is_none());
    }
}
