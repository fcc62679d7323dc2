//! License and verification data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source::SourceHash;
use crate::{PluginError, PluginResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseType {
    Free,
    Paid,
    Subscription,
}

impl LicenseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
            Self::Subscription => "subscription",
        }
    }
}

/// Position of a credential in a published revocation bitstring
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusListEntry {
    /// Where the status list is published
    pub status_list_url: String,
    pub status_list_index: usize,
}

impl StatusListEntry {
    pub fn new(url: impl Into<String>, index: usize) -> Self {
        Self {
            status_list_url: url.into(),
            status_list_index: index,
        }
    }
}

/// Signature over a credential's signing payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseProof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub created: DateTime<Utc>,
    /// Verification method id in the issuer's identity document
    pub verification_method: String,
    /// Base64 signature bytes
    pub proof_value: String,
}

/// Signed assertion that `subject` may use `plugin_id` until `expires_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseCredential {
    pub id: String,
    pub plugin_id: String,
    pub issuer: String,
    pub subject: String,
    pub license_type: LicenseType,
    pub issued_at: DateTime<Utc>,
    /// `None` for perpetual licenses
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_status: Option<StatusListEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<LicenseProof>,
}

/// Everything in a credential except its proof, in a fixed field order
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    id: &'a str,
    plugin_id: &'a str,
    issuer: &'a str,
    subject: &'a str,
    license_type: LicenseType,
    issued_at: &'a DateTime<Utc>,
    expires_at: &'a Option<DateTime<Utc>>,
    credential_status: &'a Option<StatusListEntry>,
}

impl LicenseCredential {
    /// Canonical bytes the proof signs
    pub fn signing_payload(&self) -> PluginResult<Vec<u8>> {
        let payload = SigningPayload {
            id: &self.id,
            plugin_id: &self.plugin_id,
            issuer: &self.issuer,
            subject: &self.subject,
            license_type: self.license_type,
            issued_at: &self.issued_at,
            expires_at: &self.expires_at,
            credential_status: &self.credential_status,
        };
        serde_json::to_vec(&payload)
            .map_err(|e| PluginError::Verification(format!("Cannot encode credential: {e}")))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Verified license held locally for offline execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedLicense {
    pub credential_id: String,
    pub plugin_id: String,
    pub issuer: String,
    pub subject: String,
    pub license_type: LicenseType,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credential_status: Option<StatusListEntry>,
    /// Copy of the proof as it was when verified
    pub proof: Option<LicenseProof>,
    pub cached_at: DateTime<Utc>,
    pub usage_count: u32,
    pub max_offline_usage: u32,
}

impl CachedLicense {
    pub fn from_credential(credential: &LicenseCredential, max_offline_usage: u32) -> Self {
        Self {
            credential_id: credential.id.clone(),
            plugin_id: credential.plugin_id.clone(),
            issuer: credential.issuer.clone(),
            subject: credential.subject.clone(),
            license_type: credential.license_type,
            issued_at: credential.issued_at,
            expires_at: credential.expires_at,
            credential_status: credential.credential_status.clone(),
            proof: credential.proof.clone(),
            cached_at: Utc::now(),
            usage_count: 0,
            max_offline_usage,
        }
    }

    /// Rebuild the credential this record was cached from
    pub fn to_credential(&self) -> LicenseCredential {
        LicenseCredential {
            id: self.credential_id.clone(),
            plugin_id: self.plugin_id.clone(),
            issuer: self.issuer.clone(),
            subject: self.subject.clone(),
            license_type: self.license_type,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            credential_status: self.credential_status.clone(),
            proof: self.proof.clone(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn has_headroom(&self) -> bool {
        self.usage_count < self.max_offline_usage
    }

    pub fn remaining_uses(&self) -> u32 {
        self.max_offline_usage.saturating_sub(self.usage_count)
    }

    /// Usable offline right now
    pub fn is_usable(&self) -> bool {
        !self.is_expired() && self.has_headroom()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    Online,
    Cached,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Expired,
    Revoked,
    Unknown,
}

/// Last check an attempt passed. Checks run strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStage {
    NotStarted,
    ProofChecked,
    ExpiryChecked,
    RevocationChecked,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub method: VerificationMethod,
    pub timestamp: DateTime<Utc>,
    pub status: LicenseStatus,
    pub stage: VerificationStage,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl VerificationResult {
    pub fn valid(method: VerificationMethod, warnings: Vec<String>) -> Self {
        Self {
            valid: true,
            method,
            timestamp: Utc::now(),
            status: LicenseStatus::Active,
            stage: VerificationStage::Complete,
            errors: Vec::new(),
            warnings,
        }
    }

    pub fn invalid(
        method: VerificationMethod,
        status: LicenseStatus,
        stage: VerificationStage,
        error: impl Into<String>,
    ) -> Self {
        Self {
            valid: false,
            method,
            timestamp: Utc::now(),
            status,
            stage,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// Provenance facts for one build snapshot of a plugin's source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceVerificationRecord {
    pub plugin_id: String,
    pub source_hash: SourceHash,
    pub derived_identity: String,
    pub bundle_hash: Option<SourceHash>,
    /// A ledger holds a release record for this source hash
    pub blockchain_verified: bool,
    /// The identity resolver knows the derived identity
    pub identity_aggregated: bool,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVerificationResult {
    pub valid: bool,
    pub record: Option<SourceVerificationRecord>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SourceVerificationResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            record: None,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}

/// What a ledger anchors for a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub plugin_id: String,
    pub source_hash: SourceHash,
    pub derived_identity: String,
    pub bundle_hash: Option<SourceHash>,
    pub published_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(expires_at: Option<DateTime<Utc>>) -> LicenseCredential {
        LicenseCredential {
            id: "urn:uuid:1".to_string(),
            plugin_id: "did-web".to_string(),
            issuer: "did:example:issuer".to_string(),
            subject: "did:example:alice".to_string(),
            license_type: LicenseType::Paid,
            issued_at: Utc::now(),
            expires_at,
            credential_status: None,
            proof: None,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let cred = credential(Some(now));
        assert!(cred.is_expired_at(now));
        assert!(!cred.is_expired_at(now - Duration::seconds(1)));
        assert!(!credential(None).is_expired());
    }

    #[test]
    fn test_signing_payload_ignores_proof() {
        let mut cred = credential(None);
        let before = cred.signing_payload().unwrap();
        cred.proof = Some(LicenseProof {
            proof_type: "Ed25519Signature2020".to_string(),
            created: Utc::now(),
            verification_method: "did:example:issuer#key-1".to_string(),
            proof_value: "sig".to_string(),
        });
        assert_eq!(before, cred.signing_payload().unwrap());

        cred.subject = "did:example:mallory".to_string();
        assert_ne!(before, cred.signing_payload().unwrap());
    }

    #[test]
    fn test_cached_license_headroom() {
        let mut cached = CachedLicense::from_credential(&credential(None), 2);
        assert!(cached.is_usable());
        assert_eq!(cached.remaining_uses(), 2);

        cached.usage_count = 2;
        assert!(!cached.has_headroom());
        assert!(!cached.is_usable());
        assert_eq!(cached.remaining_uses(), 0);
    }

    #[test]
    fn test_cached_license_roundtrips_to_credential() {
        let cred = credential(Some(Utc::now() + Duration::days(30)));
        let cached = CachedLicense::from_credential(&cred, 5);
        assert_eq!(cached.to_credential(), cred);
    }

    #[test]
    fn test_stage_ordering() {
        assert!(VerificationStage::NotStarted < VerificationStage::ProofChecked);
        assert!(VerificationStage::RevocationChecked < VerificationStage::Complete);
    }
}
