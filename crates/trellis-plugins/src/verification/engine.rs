use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trellis_core::config::{RevocationFailurePolicy, VerificationConfig};

use super::collaborators::{IdentityResolver, LedgerClient, ProofVerifier, StatusListFetcher};
use super::status_list::{StatusBits, StatusListCache, decode_status_list};
use super::types::{
    CachedLicense, LicenseCredential, LicenseStatus, ReleaseRecord, SourceVerificationRecord,
    SourceVerificationResult, StatusListEntry, VerificationMethod, VerificationResult,
    VerificationStage,
};
use crate::source::SourceIdentityDeriver;
use crate::storage::StorageManager;
use crate::{PluginError, PluginResult};

/// Outcome of a revocation lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCheck {
    pub revoked: bool,
    /// Set when the list was unavailable and the failure policy let the check pass
    pub warning: Option<String>,
}

type SourceCacheKey = (String, PathBuf);

#[derive(Debug, Clone)]
struct CachedSource {
    result: SourceVerificationResult,
    expires_at: Instant,
}

/// Decides whether license credentials and plugin sources can be trusted.
///
/// Never returns raw errors for verification outcomes: every failure becomes
/// a negative result carrying a displayable reason.
pub struct VerificationEngine {
    config: VerificationConfig,
    storage: StorageManager,
    deriver: SourceIdentityDeriver,
    proof_verifier: Arc<dyn ProofVerifier>,
    status_fetcher: Arc<dyn StatusListFetcher>,
    ledger: Option<Arc<dyn LedgerClient>>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    status_cache: StatusListCache,
    source_cache: Mutex<HashMap<SourceCacheKey, CachedSource>>,
}

impl VerificationEngine {
    pub fn new(
        config: VerificationConfig,
        storage: StorageManager,
        proof_verifier: Arc<dyn ProofVerifier>,
        status_fetcher: Arc<dyn StatusListFetcher>,
    ) -> Self {
        let status_cache = StatusListCache::new(Duration::from_secs(config.status_list_ttl_secs));
        Self {
            config,
            storage,
            deriver: SourceIdentityDeriver::default(),
            proof_verifier,
            status_fetcher,
            ledger: None,
            resolver: None,
            status_cache,
            source_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_deriver(mut self, deriver: SourceIdentityDeriver) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Online verification: proof, then expiry, then revocation
    pub async fn verify_license_credential(&self, credential: &LicenseCredential) -> VerificationResult {
        let method = VerificationMethod::Online;

        if let Err(e) = self.proof_verifier.verify(credential).await {
            debug!(plugin_id = %credential.plugin_id, error = %e, "Proof check failed");
            return VerificationResult::invalid(
                method,
                LicenseStatus::Unknown,
                VerificationStage::NotStarted,
                format!("Invalid proof: {e}"),
            );
        }

        if credential.is_expired() {
            return VerificationResult::invalid(
                method,
                LicenseStatus::Expired,
                VerificationStage::ProofChecked,
                expired_reason(credential.expires_at),
            );
        }

        let mut warnings = Vec::new();
        if let Some(entry) = &credential.credential_status {
            match self.verify_status_list(entry).await {
                Ok(check) if check.revoked => {
                    return VerificationResult::invalid(
                        method,
                        LicenseStatus::Revoked,
                        VerificationStage::ExpiryChecked,
                        format!("Credential '{}' has been revoked", credential.id),
                    );
                }
                Ok(check) => warnings.extend(check.warning),
                Err(e) => {
                    return VerificationResult::invalid(
                        method,
                        LicenseStatus::Unknown,
                        VerificationStage::ExpiryChecked,
                        format!("Revocation check failed: {e}"),
                    );
                }
            }
        }

        debug!(plugin_id = %credential.plugin_id, credential_id = %credential.id, "License credential verified");
        VerificationResult::valid(method, warnings)
    }

    /// Cached verification: expiry and usage ceiling only.
    ///
    /// The proof was checked when the license was cached and is not checked again.
    pub fn verify_cached_license(&self, cached: &CachedLicense) -> VerificationResult {
        let method = VerificationMethod::Cached;

        if cached.is_expired() {
            return VerificationResult::invalid(
                method,
                LicenseStatus::Expired,
                VerificationStage::ProofChecked,
                expired_reason(cached.expires_at),
            );
        }
        if !cached.has_headroom() {
            return VerificationResult::invalid(
                method,
                LicenseStatus::Unknown,
                VerificationStage::ExpiryChecked,
                format!(
                    "Offline usage limit reached ({}/{})",
                    cached.usage_count, cached.max_offline_usage
                ),
            );
        }
        VerificationResult::valid(method, Vec::new())
    }

    /// Cached verification of the license stored for `plugin_id`
    pub async fn verify_stored_license(&self, plugin_id: &str) -> VerificationResult {
        match self.storage.get_license(plugin_id).await {
            Some(cached) => self.verify_cached_license(&cached),
            None => VerificationResult::invalid(
                VerificationMethod::Cached,
                LicenseStatus::Unknown,
                VerificationStage::NotStarted,
                format!("No cached license for plugin '{plugin_id}'"),
            ),
        }
    }

    /// Look up the credential's bit in its status list.
    ///
    /// An unreachable or undecodable list is handled by the configured
    /// [`RevocationFailurePolicy`]. An index outside the list is always an error.
    pub async fn verify_status_list(&self, entry: &StatusListEntry) -> PluginResult<StatusCheck> {
        let bits = match self.status_bits(&entry.status_list_url).await {
            Ok(bits) => bits,
            Err(e) => {
                return match self.config.revocation_failure_policy {
                    RevocationFailurePolicy::FailOpen => {
                        warn!(
                            url = %entry.status_list_url,
                            error = %e,
                            "Status list unavailable; assuming not revoked"
                        );
                        Ok(StatusCheck {
                            revoked: false,
                            warning: Some(format!(
                                "Revocation status unavailable ({e}); assumed not revoked"
                            )),
                        })
                    }
                    RevocationFailurePolicy::FailClosed => {
                        warn!(url = %entry.status_list_url, error = %e, "Status list unavailable; failing closed");
                        Err(e)
                    }
                };
            }
        };

        Ok(StatusCheck {
            revoked: bits.get(entry.status_list_index)?,
            warning: None,
        })
    }

    async fn status_bits(&self, url: &str) -> PluginResult<Arc<StatusBits>> {
        if let Some(bits) = self.status_cache.get(url).await {
            return Ok(bits);
        }
        let body = self.status_fetcher.fetch(url).await?;
        let bits = decode_status_list(&body)?;
        debug!(url = %url, entries = bits.len(), "Fetched status list");
        Ok(self.status_cache.insert(url, bits).await)
    }

    /// Recompute the source identity at `path` and compare it to `expected_identity`.
    ///
    /// A mismatch is always fatal. The ledger anchor is fatal only when
    /// `require_ledger_anchor` is set; a missing aggregation claim is a warning.
    pub async fn verify_plugin_source(
        &self,
        plugin_id: &str,
        path: &Path,
        expected_identity: &str,
    ) -> SourceVerificationResult {
        let cache_key = (plugin_id.to_string(), path.to_path_buf());
        if let Some(hit) = self.cached_source(&cache_key, expected_identity).await {
            debug!(plugin_id = %plugin_id, "Source verification served from cache");
            return hit;
        }

        let snapshot = match self.deriver.snapshot_async(path).await {
            Ok(snapshot) => snapshot,
            Err(e) => return SourceVerificationResult::failed(format!("Cannot hash source: {e}")),
        };

        if snapshot.derived_identity != expected_identity {
            warn!(
                plugin_id = %plugin_id,
                expected = %expected_identity,
                computed = %snapshot.derived_identity,
                "Source identity mismatch"
            );
            return SourceVerificationResult::failed(format!(
                "Source identity mismatch: expected '{}', computed '{}'",
                expected_identity, snapshot.derived_identity
            ));
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let blockchain_verified = match &self.ledger {
            Some(ledger) => match ledger
                .query_credential_existence(plugin_id, &snapshot.source_hash)
                .await
            {
                Ok(true) => true,
                Ok(false) => {
                    let reason = format!("No ledger release record for source {}", snapshot.source_hash);
                    self.anchor_problem(reason, &mut errors, &mut warnings);
                    false
                }
                Err(e) => {
                    self.anchor_problem(format!("Ledger query failed: {e}"), &mut errors, &mut warnings);
                    false
                }
            },
            None => {
                self.anchor_problem(
                    "No ledger configured; release anchor not checked".to_string(),
                    &mut errors,
                    &mut warnings,
                );
                false
            }
        };

        let identity_aggregated = match &self.resolver {
            Some(resolver) => match resolver.resolve(expected_identity).await {
                Ok(Some(_)) => true,
                Ok(None) => {
                    warnings.push(format!("No identity aggregation claim for '{expected_identity}'"));
                    false
                }
                Err(e) => {
                    warnings.push(format!("Identity aggregation lookup failed: {e}"));
                    false
                }
            },
            None => {
                warnings.push("No identity resolver configured; aggregation claim not checked".to_string());
                false
            }
        };

        let result = SourceVerificationResult {
            valid: errors.is_empty(),
            record: Some(SourceVerificationRecord {
                plugin_id: plugin_id.to_string(),
                source_hash: snapshot.source_hash,
                derived_identity: snapshot.derived_identity,
                bundle_hash: snapshot.bundle_hash,
                blockchain_verified,
                identity_aggregated,
                verified_at: Utc::now(),
            }),
            errors,
            warnings,
        };

        if result.valid {
            let expires_at = Instant::now() + Duration::from_secs(self.config.source_cache_ttl_secs);
            self.source_cache.lock().await.insert(
                cache_key,
                CachedSource {
                    result: result.clone(),
                    expires_at,
                },
            );
        }
        result
    }

    fn anchor_problem(&self, reason: String, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        if self.config.require_ledger_anchor {
            errors.push(reason);
        } else {
            warnings.push(reason);
        }
    }

    async fn cached_source(
        &self,
        key: &SourceCacheKey,
        expected_identity: &str,
    ) -> Option<SourceVerificationResult> {
        let mut cache = self.source_cache.lock().await;
        let fresh = cache.get(key).is_some_and(|entry| entry.expires_at > Instant::now());
        if !fresh {
            cache.remove(key);
            return None;
        }
        cache
            .get(key)
            .filter(|entry| {
                entry
                    .result
                    .record
                    .as_ref()
                    .is_some_and(|r| r.derived_identity == expected_identity)
            })
            .map(|entry| entry.result.clone())
    }

    /// Drop cached source results for a plugin
    pub async fn invalidate_source(&self, plugin_id: &str) {
        self.source_cache
            .lock()
            .await
            .retain(|(id, _), _| id != plugin_id);
    }

    pub async fn clear_caches(&self) {
        self.status_cache.clear().await;
        self.source_cache.lock().await.clear();
    }

    /// Hash the source at `root` and anchor it on the ledger; returns the record locator
    pub async fn publish_release(&self, plugin_id: &str, root: &Path) -> PluginResult<String> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| PluginError::Verification("No ledger configured".to_string()))?;

        let snapshot = self.deriver.snapshot_async(root).await?;
        let record = ReleaseRecord {
            plugin_id: plugin_id.to_string(),
            source_hash: snapshot.source_hash,
            derived_identity: snapshot.derived_identity,
            bundle_hash: snapshot.bundle_hash,
            published_at: Utc::now(),
        };

        let locator = ledger.publish_release_record(&record).await?;
        info!(
            plugin_id = %plugin_id,
            source_hash = %record.source_hash,
            locator = %locator,
            "Published release record"
        );
        Ok(locator)
    }
}

fn expired_reason(expires_at: Option<chrono::DateTime<Utc>>) -> String {
    match expires_at {
        Some(at) => format!("License expired at {}", at.to_rfc3339()),
        None => "License expired".to_string(),
    }
}
