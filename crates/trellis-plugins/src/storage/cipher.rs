//! AES-256-GCM encryption of stored records

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{PluginError, PluginResult};

/// Size of AES-256 key in bytes
const KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes
const NONCE_SIZE: usize = 12;

const ENVELOPE_VERSION: u8 = 1;

/// Symmetric key for one storage namespace, zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StorageKey {
    bytes: [u8; KEY_SIZE],
}

impl StorageKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> PluginResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(PluginError::Storage(format!(
                "Invalid key length: expected {}, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    pub fn from_hex(hex_str: &str) -> PluginResult<Self> {
        let mut bytes = hex::decode(hex_str.trim())
            .map_err(|e| PluginError::Storage(format!("Invalid hex key: {e}")))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    pub fn from_base64(b64: &str) -> PluginResult<Self> {
        let mut bytes = STANDARD
            .decode(b64.trim())
            .map_err(|e| PluginError::Storage(format!("Invalid base64 key: {e}")))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Accepts the formats allowed in the environment: 64 hex chars or base64
    pub fn parse(encoded: &str) -> PluginResult<Self> {
        let trimmed = encoded.trim();
        if trimmed.len() == KEY_SIZE * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            Self::from_hex(trimmed)
        } else {
            Self::from_base64(trimmed)
        }
    }

    /// Stretch a passphrase with SHA-256. Low-entropy input yields a weak key.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&digest);
        Self { bytes }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// On-disk form of an encrypted record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    v: u8,
    nonce: String,
    ciphertext: String,
}

#[derive(Clone)]
pub struct StorageCipher {
    key: StorageKey,
}

impl std::fmt::Debug for StorageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCipher").finish_non_exhaustive()
    }
}

impl StorageCipher {
    pub fn new(key: StorageKey) -> Self {
        Self { key }
    }

    /// Encrypt under a fresh random nonce and wrap in a JSON envelope
    pub fn seal(&self, plaintext: &[u8]) -> PluginResult<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key.bytes)
            .map_err(|e| PluginError::Storage(format!("Encryption failed: {e}")))?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| PluginError::Storage(format!("Encryption failed: {e}")))?;

        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            nonce: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(&ciphertext),
        };
        serde_json::to_string(&envelope).map_err(|e| PluginError::Storage(e.to_string()))
    }

    /// Whether `raw` has the shape of a record written by [`seal`](Self::seal)
    pub fn is_sealed(raw: &str) -> bool {
        serde_json::from_str::<Envelope>(raw).is_ok_and(|e| e.v == ENVELOPE_VERSION)
    }

    pub fn open(&self, sealed: &str) -> PluginResult<Vec<u8>> {
        let envelope: Envelope = serde_json::from_str(sealed)
            .map_err(|e| PluginError::Storage(format!("Not an encrypted record: {e}")))?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(PluginError::Storage(format!(
                "Unsupported envelope version {}",
                envelope.v
            )));
        }

        let nonce_bytes = STANDARD
            .decode(&envelope.nonce)
            .map_err(|e| PluginError::Storage(format!("Invalid nonce: {e}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(PluginError::Storage(format!(
                "Invalid nonce length: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|e| PluginError::Storage(format!("Invalid ciphertext: {e}")))?;

        let cipher = Aes256Gcm::new_from_slice(&self.key.bytes)
            .map_err(|e| PluginError::Storage(format!("Decryption failed: {e}")))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| {
                PluginError::Storage("Decryption failed (invalid key or corrupted data)".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let cipher = StorageCipher::new(StorageKey::generate());
        let sealed = cipher.seal(b"{\"endpoint\":\"https://resolver\"}").unwrap();

        assert!(!sealed.contains("resolver"));
        assert_eq!(
            cipher.open(&sealed).unwrap(),
            b"{\"endpoint\":\"https://resolver\"}"
        );
    }

    #[test]
    fn test_nonce_differs_per_write() {
        let cipher = StorageCipher::new(StorageKey::generate());
        assert_ne!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = StorageCipher::new(StorageKey::generate()).seal(b"secret").unwrap();
        let other = StorageCipher::new(StorageKey::generate());
        assert!(matches!(other.open(&sealed), Err(PluginError::Storage(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = StorageCipher::new(StorageKey::generate());
        let sealed = cipher.seal(b"secret").unwrap();
        let mut envelope: Envelope = serde_json::from_str(&sealed).unwrap();
        let mut raw = STANDARD.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0x01;
        envelope.ciphertext = STANDARD.encode(raw);

        let tampered = serde_json::to_string(&envelope).unwrap();
        assert!(cipher.open(&tampered).is_err());
    }

    #[test]
    fn test_key_parsing() {
        let key = StorageKey::generate();
        let b64 = key.to_base64();
        let hex_key = hex::encode(STANDARD.decode(&b64).unwrap());

        let from_b64 = StorageCipher::new(StorageKey::parse(&b64).unwrap());
        let from_hex = StorageCipher::new(StorageKey::parse(&hex_key).unwrap());
        let sealed = StorageCipher::new(key).seal(b"x").unwrap();

        assert_eq!(from_b64.open(&sealed).unwrap(), b"x");
        assert_eq!(from_hex.open(&sealed).unwrap(), b"x");
        assert!(StorageKey::parse("too-short").is_err());
    }

    #[test]
    fn test_passphrase_key_is_stable() {
        let sealed = StorageCipher::new(StorageKey::from_passphrase("correct horse"))
            .seal(b"x")
            .unwrap();
        let again = StorageCipher::new(StorageKey::from_passphrase("correct horse"));
        assert_eq!(again.open(&sealed).unwrap(), b"x");
    }

    #[test]
    fn test_sealed_records_are_recognised() {
        let sealed = StorageCipher::new(StorageKey::generate()).seal(b"{}").unwrap();
        assert!(StorageCipher::is_sealed(&sealed));
        assert!(!StorageCipher::is_sealed(r#"{"endpoint":"https://resolver"}"#));
        assert!(!StorageCipher::is_sealed(r#"{"v":1,"nonce":"a","ciphertext":"b","retries":3}"#));
        assert!(!StorageCipher::is_sealed("{not json"));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(StorageKey::generate().to_base64(), StorageKey::generate().to_base64());
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", StorageKey::generate());
        assert!(debug.contains("REDACTED"));
    }
}
