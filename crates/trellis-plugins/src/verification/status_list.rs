//! Revocation bitstrings
//!
//! A status list is a (usually gzipped) bitstring published at a URL; bit
//! `i` set means the credential at index `i` is revoked. Lists are fetched
//! once per URL and cached for a TTL.

use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{PluginError, PluginResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decoded revocation bitstring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBits {
    bytes: Vec<u8>,
}

impl StatusBits {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Number of indexable entries
    pub fn len(&self) -> usize {
        self.bytes.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bit at `index`, most significant bit of each byte first
    pub fn get(&self, index: usize) -> PluginResult<bool> {
        let byte = self.bytes.get(index / 8).ok_or_else(|| {
            PluginError::Verification(format!(
                "Status list index {} out of range (list holds {} entries)",
                index,
                self.len()
            ))
        })?;
        Ok(byte & (0x80 >> (index % 8)) != 0)
    }
}

/// Decode a published list.
///
/// Accepts either a bare encoded list or a status list credential whose
/// `credentialSubject.encodedList` carries it. The encoding is base64url
/// (padding optional, multibase `u` prefix optional), optionally gzipped.
pub fn decode_status_list(body: &str) -> PluginResult<StatusBits> {
    let encoded = extract_encoded_list(body)?;
    // A multibase prefix is tried first; a bare list may also begin with 'u'
    let raw = match encoded.strip_prefix('u') {
        Some(unprefixed) => decode_base64url(unprefixed).or_else(|_| decode_base64url(&encoded)),
        None => decode_base64url(&encoded),
    }?;

    if raw.starts_with(&GZIP_MAGIC) {
        let mut decompressed = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decompressed)
            .map_err(|e| PluginError::Verification(format!("Invalid gzip status list: {e}")))?;
        Ok(StatusBits::from_bytes(decompressed))
    } else {
        Ok(StatusBits::from_bytes(raw))
    }
}

fn decode_base64url(encoded: &str) -> PluginResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(encoded))
        .map_err(|e| PluginError::Verification(format!("Invalid status list encoding: {e}")))
}

fn extract_encoded_list(body: &str) -> PluginResult<String> {
    let body = body.trim();
    if !body.starts_with('{') {
        return Ok(body.to_string());
    }

    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| PluginError::Verification(format!("Invalid status list document: {e}")))?;
    value
        .pointer("/credentialSubject/encodedList")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| {
            PluginError::Verification("Status list document has no encodedList".to_string())
        })
}

#[derive(Debug)]
struct CacheEntry {
    bits: Arc<StatusBits>,
    expires_at: Instant,
}

/// Per-URL cache of decoded lists; last write wins
#[derive(Debug)]
pub struct StatusListCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl StatusListCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, url: &str) -> Option<Arc<StatusBits>> {
        let mut entries = self.entries.lock().await;
        match entries.get(url) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.bits.clone()),
            Some(_) => {
                entries.remove(url);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, url: &str, bits: StatusBits) -> Arc<StatusBits> {
        let bits = Arc::new(bits);
        self.entries.lock().await.insert(
            url.to_string(),
            CacheEntry {
                bits: bits.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        bits
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Encode a bitstring the way issuers publish it (gzip then base64url, `u` prefix)
pub fn encode_status_list(bits: &StatusBits) -> PluginResult<String> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&bits.bytes)
        .map_err(|e| PluginError::Verification(format!("Cannot encode status list: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| PluginError::Verification(format!("Cannot encode status list: {e}")))?;
    Ok(format!("u{}", URL_SAFE_NO_PAD.encode(compressed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_with_revoked(indices: &[usize], size_bytes: usize) -> StatusBits {
        let mut bytes = vec![0u8; size_bytes];
        for &i in indices {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
        StatusBits::from_bytes(bytes)
    }

    #[test]
    fn test_bit_order_is_msb_first() {
        let bits = StatusBits::from_bytes(vec![0b1000_0001]);
        assert!(bits.get(0).unwrap());
        assert!(!bits.get(1).unwrap());
        assert!(bits.get(7).unwrap());
    }

    #[test]
    fn test_index_out_of_range_is_error() {
        let bits = StatusBits::from_bytes(vec![0u8; 2]);
        assert_eq!(bits.len(), 16);
        assert!(matches!(bits.get(16), Err(PluginError::Verification(_))));
    }

    #[test]
    fn test_gzipped_list_roundtrip() {
        let bits = list_with_revoked(&[3, 1000], 16 * 1024);
        let encoded = encode_status_list(&bits).unwrap();
        assert!(encoded.starts_with('u'));

        let decoded = decode_status_list(&encoded).unwrap();
        assert!(decoded.get(3).unwrap());
        assert!(decoded.get(1000).unwrap());
        assert!(!decoded.get(4).unwrap());
    }

    #[test]
    fn test_plain_padded_list() {
        let encoded = URL_SAFE.encode([0x40u8]);
        assert!(encoded.ends_with('='));
        let decoded = decode_status_list(&encoded).unwrap();
        assert!(decoded.get(1).unwrap());
    }

    #[test]
    fn test_list_inside_credential_document() {
        let bits = list_with_revoked(&[5], 8);
        let doc = serde_json::json!({
            "type": ["VerifiableCredential", "BitstringStatusListCredential"],
            "credentialSubject": {"encodedList": encode_status_list(&bits).unwrap()}
        });
        let decoded = decode_status_list(&doc.to_string()).unwrap();
        assert!(decoded.get(5).unwrap());

        let missing = serde_json::json!({"credentialSubject": {}});
        assert!(decode_status_list(&missing.to_string()).is_err());
    }

    #[test]
    fn test_garbage_is_error() {
        assert!(decode_status_list("!!not base64!!").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let cache = StatusListCache::new(Duration::from_secs(60));
        cache
            .insert("https://status.example/1", StatusBits::from_bytes(vec![0]))
            .await;
        assert!(cache.get("https://status.example/1").await.is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("https://status.example/1").await.is_none());
        assert!(cache.is_empty().await);
    }
}
