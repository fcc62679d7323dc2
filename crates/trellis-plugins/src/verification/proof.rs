//! Ed25519 proofs over license credentials

use aes_gcm::aead::{OsRng, rand_core::RngCore};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::sync::Arc;

use super::collaborators::{IdentityResolver, ProofVerifier, VerificationKey};
use super::types::{LicenseCredential, LicenseProof};
use crate::{PluginError, PluginResult};

pub const ED25519_PROOF_TYPE: &str = "Ed25519Signature2020";

/// Signs credentials on behalf of an issuer identity
pub struct Ed25519Signer {
    signing_key: SigningKey,
    verification_method: String,
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("verification_method", &self.verification_method)
            .finish_non_exhaustive()
    }
}

impl Ed25519Signer {
    pub fn generate(verification_method: impl Into<String>) -> Self {
        let mut secret_bytes = [0u8; ed25519_dalek::SECRET_KEY_LENGTH];
        OsRng.fill_bytes(&mut secret_bytes);
        Self {
            signing_key: SigningKey::from_bytes(&secret_bytes),
            verification_method: verification_method.into(),
        }
    }

    pub fn from_bytes(bytes: &[u8], verification_method: impl Into<String>) -> PluginResult<Self> {
        let key_bytes: [u8; ed25519_dalek::SECRET_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            PluginError::Validation(format!(
                "Signing key must be {} bytes, got {}",
                ed25519_dalek::SECRET_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
            verification_method: verification_method.into(),
        })
    }

    pub fn verification_method(&self) -> &str {
        &self.verification_method
    }

    /// Key entry to publish in the issuer's identity document
    pub fn verification_key(&self, controller: impl Into<String>) -> VerificationKey {
        VerificationKey {
            id: self.verification_method.clone(),
            controller: controller.into(),
            public_key_base64: BASE64_STANDARD.encode(self.signing_key.verifying_key().to_bytes()),
        }
    }

    /// Replace the credential's proof with a fresh signature
    pub fn sign(&self, credential: &mut LicenseCredential) -> PluginResult<()> {
        let payload = credential.signing_payload()?;
        let signature = self.signing_key.sign(&payload);
        credential.proof = Some(LicenseProof {
            proof_type: ED25519_PROOF_TYPE.to_string(),
            created: Utc::now(),
            verification_method: self.verification_method.clone(),
            proof_value: BASE64_STANDARD.encode(signature.to_bytes()),
        });
        Ok(())
    }
}

/// Verifies Ed25519 proofs against keys in the issuer's identity document
#[derive(Clone)]
pub struct Ed25519ProofVerifier {
    resolver: Arc<dyn IdentityResolver>,
}

impl Ed25519ProofVerifier {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl ProofVerifier for Ed25519ProofVerifier {
    async fn verify(&self, credential: &LicenseCredential) -> PluginResult<()> {
        let proof = credential
            .proof
            .as_ref()
            .ok_or_else(|| PluginError::Verification("Credential has no proof".to_string()))?;

        if proof.proof_type != ED25519_PROOF_TYPE {
            return Err(PluginError::Verification(format!(
                "Unsupported proof type '{}'",
                proof.proof_type
            )));
        }

        let document = self.resolver.resolve(&credential.issuer).await?.ok_or_else(|| {
            PluginError::Verification(format!("Issuer '{}' could not be resolved", credential.issuer))
        })?;

        let key = document.find_key(&proof.verification_method).ok_or_else(|| {
            PluginError::Verification(format!(
                "Verification method '{}' not found for issuer '{}'",
                proof.verification_method, credential.issuer
            ))
        })?;

        let verifying_key = decode_verifying_key(key)?;
        let signature_bytes = BASE64_STANDARD
            .decode(&proof.proof_value)
            .map_err(|e| PluginError::Verification(format!("Invalid proof encoding: {e}")))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| PluginError::Verification(format!("Invalid signature: {e}")))?;

        verifying_key
            .verify(&credential.signing_payload()?, &signature)
            .map_err(|_| PluginError::Verification("Signature does not match credential".to_string()))
    }
}

fn decode_verifying_key(key: &VerificationKey) -> PluginResult<VerifyingKey> {
    let key_bytes = BASE64_STANDARD
        .decode(&key.public_key_base64)
        .map_err(|e| PluginError::Verification(format!("Invalid issuer key encoding: {e}")))?;

    let key_array: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = key_bytes
        .try_into()
        .map_err(|_| PluginError::Verification("Issuer key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&key_array)
        .map_err(|e| PluginError::Verification(format!("Invalid issuer key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::collaborators::{IdentityDocument, InMemoryIdentityResolver};
    use crate::verification::types::LicenseType;

    const ISSUER: &str = "did:example:issuer";

    fn credential() -> LicenseCredential {
        LicenseCredential {
            id: "urn:uuid:42".to_string(),
            plugin_id: "bbs-suite".to_string(),
            issuer: ISSUER.to_string(),
            subject: "did:example:alice".to_string(),
            license_type: LicenseType::Subscription,
            issued_at: Utc::now(),
            expires_at: None,
            credential_status: None,
            proof: None,
        }
    }

    async fn setup() -> (Ed25519Signer, Ed25519ProofVerifier) {
        let signer = Ed25519Signer::generate(format!("{ISSUER}#key-1"));
        let resolver = Arc::new(InMemoryIdentityResolver::new());
        resolver
            .insert(IdentityDocument::new(ISSUER).with_key(signer.verification_key(ISSUER)))
            .await;
        (signer, Ed25519ProofVerifier::new(resolver))
    }

    #[tokio::test]
    async fn test_signed_credential_verifies() {
        let (signer, verifier) = setup().await;
        let mut cred = credential();
        signer.sign(&mut cred).unwrap();
        assert!(verifier.verify(&cred).await.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_credential_fails() {
        let (signer, verifier) = setup().await;
        let mut cred = credential();
        signer.sign(&mut cred).unwrap();
        cred.subject = "did:example:mallory".to_string();

        let err = verifier.verify(&cred).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[tokio::test]
    async fn test_unsigned_credential_fails() {
        let (_, verifier) = setup().await;
        assert!(verifier.verify(&credential()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_signer_fails() {
        let (_, verifier) = setup().await;
        let rogue = Ed25519Signer::generate(format!("{ISSUER}#key-1"));
        let mut cred = credential();
        rogue.sign(&mut cred).unwrap();
        assert!(verifier.verify(&cred).await.is_err());
    }

    #[tokio::test]
    async fn test_unresolvable_issuer_fails() {
        let (signer, verifier) = setup().await;
        let mut cred = credential();
        cred.issuer = "did:example:stranger".to_string();
        signer.sign(&mut cred).unwrap();

        let err = verifier.verify(&cred).await.unwrap_err();
        assert!(err.to_string().contains("could not be resolved"));
    }

    #[test]
    fn test_signer_from_bytes_checks_length() {
        assert!(Ed25519Signer::from_bytes(&[0u8; 31], "k").is_err());
        assert!(Ed25519Signer::from_bytes(&[0u8; 32], "k").is_ok());
    }

    #[test]
    fn test_generated_signers_differ() {
        let a = Ed25519Signer::generate("did:example:a#key-1").verification_key("did:example:a");
        let b = Ed25519Signer::generate("did:example:a#key-1").verification_key("did:example:a");
        assert_ne!(a.public_key_base64, b.public_key_base64);
    }
}
