use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use trellis_core::config::LicenseConfig;
use trellis_core::locking::KeyedMutex;

use super::issuer::{LicenseIssuer, LicenseRequest};
use super::payment::{
    PaymentDetails, PaymentProcessor, PaymentRequest, TransactionRecord, TransactionStatus,
};
use super::policy::MonetizationPolicy;
use crate::storage::StorageManager;
use crate::verification::{
    CachedLicense, LicenseCredential, LicenseStatus, VerificationEngine, VerificationMethod,
    VerificationResult, VerificationStage,
};
use crate::{PluginError, PluginResult};

/// Per-install overrides of the host's license defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOptions {
    /// Cache the issued license for offline use
    pub cache_license: Option<bool>,
    /// Verify the issued license online before reporting success
    pub verify_after_install: Option<bool>,
    /// Overrides the policy's offline usage ceiling
    pub max_offline_usage: Option<u32>,
}

impl InstallOptions {
    pub fn cached(mut self, cache: bool) -> Self {
        self.cache_license = Some(cache);
        self
    }

    pub fn verified(mut self, verify: bool) -> Self {
        self.verify_after_install = Some(verify);
        self
    }

    pub fn with_max_offline_usage(mut self, max: u32) -> Self {
        self.max_offline_usage = Some(max);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallResult {
    pub success: bool,
    pub plugin_id: String,
    pub license: Option<LicenseCredential>,
    pub transaction: Option<TransactionRecord>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl InstallResult {
    fn failed(plugin_id: &str, errors: Vec<String>) -> Self {
        Self {
            success: false,
            plugin_id: plugin_id.to_string(),
            license: None,
            transaction: None,
            errors,
            warnings: Vec::new(),
        }
    }
}

/// Where a plugin's license is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseState {
    Uninstalled,
    PaymentPending,
    Active,
    Expired,
    Revoked,
    UsageExhausted,
    /// Revocation status could not be established and the failure policy denies use
    Unverified,
}

#[derive(Debug, Clone)]
struct PendingInstall {
    transaction_id: String,
    payer_identity: String,
    options: InstallOptions,
}

/// Orchestrates paid installation and offline usage accounting.
///
/// All mutations for one plugin id are serialised; distinct plugins proceed
/// concurrently.
pub struct LicenseManager {
    config: LicenseConfig,
    storage: StorageManager,
    engine: Arc<VerificationEngine>,
    issuer: Arc<dyn LicenseIssuer>,
    payments: Option<Arc<dyn PaymentProcessor>>,
    policies: RwLock<HashMap<String, MonetizationPolicy>>,
    credentials: RwLock<HashMap<String, LicenseCredential>>,
    transactions: RwLock<HashMap<String, Vec<TransactionRecord>>>,
    pending: RwLock<HashMap<String, PendingInstall>>,
    locks: KeyedMutex,
}

impl LicenseManager {
    pub fn new(
        config: LicenseConfig,
        storage: StorageManager,
        engine: Arc<VerificationEngine>,
        issuer: Arc<dyn LicenseIssuer>,
    ) -> Self {
        Self {
            config,
            storage,
            engine,
            issuer,
            payments: None,
            policies: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            locks: KeyedMutex::new(),
        }
    }

    pub fn with_payment_processor(mut self, processor: Arc<dyn PaymentProcessor>) -> Self {
        self.payments = Some(processor);
        self
    }

    pub fn engine(&self) -> &Arc<VerificationEngine> {
        &self.engine
    }

    /// Attach a validated monetization policy to a plugin
    pub async fn set_policy(&self, plugin_id: &str, policy: MonetizationPolicy) -> PluginResult<()> {
        let errors = policy.validate();
        if !errors.is_empty() {
            return Err(PluginError::Validation(errors.join("; ")));
        }
        self.policies
            .write()
            .await
            .insert(plugin_id.to_string(), policy);
        Ok(())
    }

    pub async fn policy(&self, plugin_id: &str) -> Option<MonetizationPolicy> {
        self.policies.read().await.get(plugin_id).cloned()
    }

    pub async fn get_license(&self, plugin_id: &str) -> Option<LicenseCredential> {
        self.credentials.read().await.get(plugin_id).cloned()
    }

    pub async fn transactions(&self, plugin_id: &str) -> Vec<TransactionRecord> {
        self.transactions
            .read()
            .await
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pay for (if needed), issue, and optionally cache and verify a license.
    ///
    /// A pending payment is reported as success with a warning and no license;
    /// call [`confirm_payment`](Self::confirm_payment) once it clears.
    pub async fn install_plugin(
        &self,
        plugin_id: &str,
        payment: PaymentDetails,
        options: InstallOptions,
    ) -> InstallResult {
        let _guard = self.locks.lock(plugin_id).await;

        let Some(policy) = self.policy(plugin_id).await else {
            return InstallResult::failed(
                plugin_id,
                vec![format!("No monetization policy registered for plugin '{plugin_id}'")],
            );
        };
        let policy_errors = policy.validate();
        if !policy_errors.is_empty() {
            return InstallResult::failed(plugin_id, policy_errors);
        }

        if let Some(existing) = self.get_license(plugin_id).await {
            if !existing.is_expired() {
                return InstallResult {
                    success: true,
                    plugin_id: plugin_id.to_string(),
                    license: Some(existing),
                    transaction: None,
                    errors: Vec::new(),
                    warnings: vec![format!("Plugin '{plugin_id}' is already licensed")],
                };
            }
        }

        let pending = self.pending.read().await.get(plugin_id).cloned();
        if let Some(pending) = pending {
            let transaction = self
                .transactions(plugin_id)
                .await
                .into_iter()
                .find(|t| t.transaction_id == pending.transaction_id);
            return InstallResult {
                success: true,
                plugin_id: plugin_id.to_string(),
                license: None,
                transaction,
                errors: Vec::new(),
                warnings: vec![format!(
                    "Payment {} is already pending for plugin '{plugin_id}'; confirm it instead of paying again",
                    pending.transaction_id
                )],
            };
        }

        if payment.payer_identity.trim().is_empty() {
            return InstallResult::failed(plugin_id, vec!["Payer identity is required".to_string()]);
        }

        let transaction = if policy.requires_payment() {
            match self.take_payment(plugin_id, &policy, &payment).await {
                Ok(record) => Some(record),
                Err(e) => return InstallResult::failed(plugin_id, vec![e.to_string()]),
            }
        } else {
            None
        };

        if let Some(record) = &transaction {
            match record.status {
                TransactionStatus::Completed => {}
                TransactionStatus::Pending => {
                    self.pending.write().await.insert(
                        plugin_id.to_string(),
                        PendingInstall {
                            transaction_id: record.transaction_id.clone(),
                            payer_identity: payment.payer_identity.clone(),
                            options,
                        },
                    );
                    info!(plugin_id = %plugin_id, transaction_id = %record.transaction_id, "Payment pending");
                    return InstallResult {
                        success: true,
                        plugin_id: plugin_id.to_string(),
                        license: None,
                        transaction: transaction.clone(),
                        errors: Vec::new(),
                        warnings: vec![format!(
                            "Payment {} is pending; the license will be issued once it completes",
                            record.transaction_id
                        )],
                    };
                }
                TransactionStatus::Failed => {
                    let mut result = InstallResult::failed(
                        plugin_id,
                        vec![format!("Payment {} failed", record.transaction_id)],
                    );
                    result.transaction = transaction.clone();
                    return result;
                }
            }
        }

        self.complete_install(plugin_id, &policy, &payment.payer_identity, transaction, &options)
            .await
    }

    /// Finish an installation whose payment was pending
    pub async fn confirm_payment(&self, plugin_id: &str, transaction_id: &str) -> InstallResult {
        let _guard = self.locks.lock(plugin_id).await;

        let pending = self.pending.read().await.get(plugin_id).cloned();
        let Some(pending) = pending.filter(|p| p.transaction_id == transaction_id) else {
            return InstallResult::failed(
                plugin_id,
                vec![format!("No pending payment {transaction_id} for plugin '{plugin_id}'")],
            );
        };
        let Some(policy) = self.policy(plugin_id).await else {
            return InstallResult::failed(
                plugin_id,
                vec![format!("No monetization policy registered for plugin '{plugin_id}'")],
            );
        };

        let record = self
            .update_transaction(plugin_id, transaction_id, TransactionStatus::Completed)
            .await;
        self.pending.write().await.remove(plugin_id);
        info!(plugin_id = %plugin_id, transaction_id = %transaction_id, "Payment confirmed");

        self.complete_install(plugin_id, &policy, &pending.payer_identity, record, &pending.options)
            .await
    }

    async fn take_payment(
        &self,
        plugin_id: &str,
        policy: &MonetizationPolicy,
        payment: &PaymentDetails,
    ) -> PluginResult<TransactionRecord> {
        let processor = self
            .payments
            .as_ref()
            .ok_or_else(|| PluginError::Payment("No payment processor configured".to_string()))?;

        let mut metadata = payment.metadata.clone();
        metadata.insert("plugin_id".to_string(), serde_json::Value::from(plugin_id));
        let request = PaymentRequest {
            amount: policy.amount,
            currency: policy.currency.clone(),
            payer_identity: payment.payer_identity.clone(),
            metadata,
        };

        let receipt = processor
            .process_payment(&request)
            .await
            .map_err(|e| PluginError::Payment(e.to_string()))?;

        info!(
            plugin_id = %plugin_id,
            transaction_id = %receipt.transaction_id,
            status = receipt.status.as_str(),
            "Payment processed"
        );

        let record = TransactionRecord::new(plugin_id, &request, &receipt);
        self.transactions
            .write()
            .await
            .entry(plugin_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn update_transaction(
        &self,
        plugin_id: &str,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> Option<TransactionRecord> {
        let mut transactions = self.transactions.write().await;
        let record = transactions
            .get_mut(plugin_id)?
            .iter_mut()
            .find(|t| t.transaction_id == transaction_id)?;
        record.set_status(status);
        Some(record.clone())
    }

    /// Issue, then cache, then verify. Nothing is cached before issuance and
    /// nothing is left cached if verification rejects the license.
    async fn complete_install(
        &self,
        plugin_id: &str,
        policy: &MonetizationPolicy,
        payer_identity: &str,
        transaction: Option<TransactionRecord>,
        options: &InstallOptions,
    ) -> InstallResult {
        let expires_at = match policy.expires_at(chrono::Utc::now()) {
            Ok(expires_at) => expires_at,
            Err(e) => {
                let mut result = InstallResult::failed(plugin_id, vec![e.to_string()]);
                result.transaction = transaction;
                return result;
            }
        };
        let request = LicenseRequest {
            plugin_id: plugin_id.to_string(),
            subject: payer_identity.to_string(),
            license_type: policy.license_type,
            expires_at,
            transaction_id: transaction.as_ref().map(|t| t.transaction_id.clone()),
        };

        let credential = match self.issuer.issue(&request).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "License issuance failed");
                let mut result =
                    InstallResult::failed(plugin_id, vec![format!("License issuance failed: {e}")]);
                result.transaction = transaction;
                return result;
            }
        };

        let mut warnings = Vec::new();
        let cache = options.cache_license.unwrap_or(self.config.cache_on_install);
        let mut cached = false;
        if cache {
            let max = options
                .max_offline_usage
                .or(policy.max_offline_usage)
                .unwrap_or(self.config.default_max_offline_usage);
            match self.write_cache(plugin_id, &credential, max).await {
                Ok(_) => cached = true,
                Err(e) => warnings.push(format!("License not cached for offline use: {e}")),
            }
        }

        if options.verify_after_install.unwrap_or(self.config.verify_on_install) {
            let verification = self.engine.verify_license_credential(&credential).await;
            warnings.extend(verification.warnings.iter().cloned());
            if !verification.valid {
                if cached {
                    if let Err(e) = self.storage.delete_license(plugin_id).await {
                        warn!(plugin_id = %plugin_id, error = %e, "Could not remove rejected license from cache");
                    }
                }
                let mut result = InstallResult::failed(plugin_id, verification.errors);
                result.transaction = transaction;
                result.warnings = warnings;
                return result;
            }
        }

        self.credentials
            .write()
            .await
            .insert(plugin_id.to_string(), credential.clone());
        info!(
            plugin_id = %plugin_id,
            credential_id = %credential.id,
            license_type = credential.license_type.as_str(),
            "Plugin license installed"
        );

        InstallResult {
            success: true,
            plugin_id: plugin_id.to_string(),
            license: Some(credential),
            transaction,
            errors: Vec::new(),
            warnings,
        }
    }

    /// Offline-first: a usable cached license wins, otherwise verify online
    pub async fn verify_license(&self, plugin_id: &str) -> VerificationResult {
        let cached = self.storage.get_license(plugin_id).await;
        if let Some(cached) = &cached {
            let result = self.engine.verify_cached_license(cached);
            if result.valid {
                return result;
            }
            debug!(plugin_id = %plugin_id, reason = ?result.errors, "Cached license unusable; verifying online");
        }

        let credential = match self.get_license(plugin_id).await {
            Some(credential) => credential,
            None => match &cached {
                Some(cached) => cached.to_credential(),
                None => {
                    return VerificationResult::invalid(
                        VerificationMethod::Online,
                        LicenseStatus::Unknown,
                        VerificationStage::NotStarted,
                        format!("No license found for plugin '{plugin_id}'"),
                    );
                }
            },
        };

        self.engine.verify_license_credential(&credential).await
    }

    /// Whether the plugin may run right now without network verification
    pub async fn check_offline_execution(&self, plugin_id: &str) -> bool {
        self.storage
            .get_license(plugin_id)
            .await
            .is_some_and(|cached| cached.is_usable())
    }

    /// Cache a credential for offline use.
    ///
    /// Re-caching the same credential keeps its usage count and its original
    /// ceiling; `max_offline_usage` only applies to a credential not cached before.
    pub async fn cache_license(
        &self,
        plugin_id: &str,
        credential: &LicenseCredential,
        max_offline_usage: Option<u32>,
    ) -> PluginResult<CachedLicense> {
        let _guard = self.locks.lock(plugin_id).await;
        let max = match max_offline_usage {
            Some(max) => max,
            None => self
                .policy(plugin_id)
                .await
                .and_then(|p| p.max_offline_usage)
                .unwrap_or(self.config.default_max_offline_usage),
        };
        self.write_cache(plugin_id, credential, max).await
    }

    async fn write_cache(
        &self,
        plugin_id: &str,
        credential: &LicenseCredential,
        max_offline_usage: u32,
    ) -> PluginResult<CachedLicense> {
        if credential.plugin_id != plugin_id {
            return Err(PluginError::Validation(format!(
                "Credential is for plugin '{}', not '{}'",
                credential.plugin_id, plugin_id
            )));
        }
        if max_offline_usage == 0 {
            return Err(PluginError::Validation(
                "max_offline_usage must be positive".to_string(),
            ));
        }

        let mut cached = CachedLicense::from_credential(credential, max_offline_usage);
        if let Some(previous) = self.storage.get_license(plugin_id).await {
            if previous.credential_id == credential.id {
                if previous.max_offline_usage != max_offline_usage {
                    warn!(
                        plugin_id = %plugin_id,
                        kept = previous.max_offline_usage,
                        requested = max_offline_usage,
                        "Offline usage ceiling is fixed per credential; keeping the cached one"
                    );
                }
                cached.usage_count = previous.usage_count;
                cached.max_offline_usage = previous.max_offline_usage;
            }
        }

        self.storage.store_license(plugin_id, &cached).await?;
        debug!(
            plugin_id = %plugin_id,
            credential_id = %cached.credential_id,
            max_offline_usage = cached.max_offline_usage,
            "License cached"
        );
        Ok(cached)
    }

    /// Record one offline execution; persisted before returning.
    ///
    /// Returns the new usage count. Fails once the ceiling is reached or the
    /// license has expired.
    pub async fn increment_offline_usage(&self, plugin_id: &str) -> PluginResult<u32> {
        let _guard = self.locks.lock(plugin_id).await;

        let mut cached = self
            .storage
            .get_license(plugin_id)
            .await
            .ok_or_else(|| PluginError::NotFound(format!("No cached license for '{plugin_id}'")))?;

        if cached.is_expired() {
            return Err(PluginError::LicenseExpired(plugin_id.to_string()));
        }
        if !cached.has_headroom() {
            return Err(PluginError::Validation(format!(
                "Offline usage limit reached for '{}' ({}/{})",
                plugin_id, cached.usage_count, cached.max_offline_usage
            )));
        }

        cached.usage_count += 1;
        self.storage.store_license(plugin_id, &cached).await?;
        debug!(
            plugin_id = %plugin_id,
            usage_count = cached.usage_count,
            max_offline_usage = cached.max_offline_usage,
            "Offline usage recorded"
        );
        Ok(cached.usage_count)
    }

    pub async fn license_state(&self, plugin_id: &str) -> LicenseState {
        let credential = self.get_license(plugin_id).await;
        let cached = self.storage.get_license(plugin_id).await;

        let credential = match (credential, &cached) {
            (Some(credential), _) => credential,
            (None, Some(cached)) => cached.to_credential(),
            (None, None) => {
                return if self.pending.read().await.contains_key(plugin_id) {
                    LicenseState::PaymentPending
                } else {
                    LicenseState::Uninstalled
                };
            }
        };

        if credential.is_expired() {
            return LicenseState::Expired;
        }
        if let Some(entry) = &credential.credential_status {
            match self.engine.verify_status_list(entry).await {
                Ok(check) if check.revoked => return LicenseState::Revoked,
                Ok(_) => {}
                Err(e) => {
                    warn!(plugin_id = %plugin_id, error = %e, "Revocation status unavailable");
                    return LicenseState::Unverified;
                }
            }
        }
        if cached.is_some_and(|c| !c.has_headroom()) {
            return LicenseState::UsageExhausted;
        }
        LicenseState::Active
    }

    /// Uninstall: drop the cached record, the credential and any pending payment
    pub async fn remove_license(&self, plugin_id: &str) -> PluginResult<()> {
        let _guard = self.locks.lock(plugin_id).await;
        self.storage.delete_license(plugin_id).await?;
        self.credentials.write().await.remove(plugin_id);
        self.pending.write().await.remove(plugin_id);
        info!(plugin_id = %plugin_id, "License removed");
        Ok(())
    }
}
