use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use trellis_core::config::RegistryConfig;
use trellis_core::events::{EventBus, PluginEvent, PluginEventType};
use trellis_core::locking::KeyedMutex;

use super::dependency::DependencyGraph;
use super::plugin::{Plugin, PluginContext};
use crate::descriptor::{PluginCategory, PluginDescriptor};
use crate::license::LicenseManager;
use crate::storage::{PluginConfig, RecordKind, StorageManager};
use crate::verification::{SourceVerificationRecord, VerificationEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub success: bool,
    pub plugin_id: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Required dependencies that are not registered, all of them
    pub dependencies_missing: Vec<String>,
}

impl RegistrationResult {
    fn new(plugin_id: &str) -> Self {
        Self {
            success: false,
            plugin_id: plugin_id.to_string(),
            errors: Vec::new(),
            warnings: Vec::new(),
            dependencies_missing: Vec::new(),
        }
    }

    fn fail(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self.success = false;
        self
    }
}

/// Outcome of enable, disable, update and unregister
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub plugin_id: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl OperationResult {
    fn ok(plugin_id: &str, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            plugin_id: plugin_id.to_string(),
            errors: Vec::new(),
            warnings,
        }
    }

    fn failed(plugin_id: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            plugin_id: plugin_id.to_string(),
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    fn not_found(plugin_id: &str) -> Self {
        Self::failed(plugin_id, format!("Plugin '{plugin_id}' is not registered"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatistics {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub initialized: usize,
    pub verified_sources: usize,
    pub by_category: BTreeMap<PluginCategory, usize>,
}

/// Selects plugins in [`PluginManager::list_plugins`]; empty matches all
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginFilter {
    pub category: Option<PluginCategory>,
    pub enabled: Option<bool>,
    pub capability: Option<String>,
}

impl PluginFilter {
    pub fn category(mut self, category: PluginCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    fn matches(&self, descriptor: &PluginDescriptor) -> bool {
        self.category.is_none_or(|c| descriptor.category == c)
            && self.enabled.is_none_or(|e| descriptor.enabled == e)
            && self
                .capability
                .as_ref()
                .is_none_or(|c| descriptor.capabilities.contains(c))
    }
}

struct RegisteredPlugin {
    plugin: Arc<dyn Plugin>,
    /// Live copy; enable/disable/update mutate this, not the plugin's own
    descriptor: PluginDescriptor,
    initialized: bool,
    source: Option<SourceVerificationRecord>,
    registered_at: DateTime<Utc>,
}

/// Registry and lifecycle coordinator for the plugins of one host agent.
///
/// Registration runs validation, capacity, config, dependency, integrity and
/// initialization steps in that order and is all-or-nothing. Operations on
/// one plugin id are serialised.
pub struct PluginManager {
    config: RegistryConfig,
    plugins: RwLock<HashMap<String, RegisteredPlugin>>,
    events: Arc<dyn EventBus>,
    storage: StorageManager,
    verification: Option<Arc<VerificationEngine>>,
    licenses: Option<Arc<LicenseManager>>,
    locks: KeyedMutex,
}

impl PluginManager {
    pub fn new(config: RegistryConfig, storage: StorageManager, events: Arc<dyn EventBus>) -> Self {
        Self {
            config,
            plugins: RwLock::new(HashMap::new()),
            events,
            storage,
            verification: None,
            licenses: None,
            locks: KeyedMutex::new(),
        }
    }

    pub fn with_verification(mut self, engine: Arc<VerificationEngine>) -> Self {
        self.verification = Some(engine);
        self
    }

    /// Also uses the license manager's verification engine for source checks
    pub fn with_license_manager(mut self, licenses: Arc<LicenseManager>) -> Self {
        if self.verification.is_none() {
            self.verification = Some(licenses.engine().clone());
        }
        self.licenses = Some(licenses);
        self
    }

    pub async fn register_plugin(
        &self,
        plugin: Arc<dyn Plugin>,
        context: Option<&PluginContext>,
    ) -> RegistrationResult {
        let descriptor = plugin.descriptor().clone();
        let id = descriptor.id.clone();
        let _guard = self.locks.lock(&id).await;
        let mut result = RegistrationResult::new(&id);

        // Validating
        let structure_errors = descriptor.validate_structure();
        if !structure_errors.is_empty() {
            result.errors = structure_errors;
            return self.reject(result).await;
        }
        if self.is_registered(&id).await {
            return self
                .reject(result.fail(format!("Plugin '{id}' is already registered")))
                .await;
        }
        if self.len().await >= self.config.max_plugins {
            return self
                .reject(result.fail(format!(
                    "Plugin capacity reached ({} plugins)",
                    self.config.max_plugins
                )))
                .await;
        }
        let config_errors = plugin.validate_config(&descriptor.config);
        if !config_errors.is_empty() {
            result.errors = config_errors;
            return self.reject(result).await;
        }

        // DependencyResolving
        if !self.resolve_dependencies(&descriptor, &mut result).await {
            return self.reject(result).await;
        }

        // Verifying
        let source = match self.verify_integrity(&descriptor, &mut result).await {
            Ok(source) => source,
            Err(()) => return self.reject(result).await,
        };

        let mut initialized = false;
        if let Some(context) = context {
            let missing = context.missing_permissions(&descriptor);
            if !missing.is_empty() {
                return self
                    .reject(result.fail(format!("Permissions not granted by host: {missing:?}")))
                    .await;
            }
            if let Err(e) = plugin.initialize(context).await {
                if let Err(cleanup) = plugin.cleanup().await {
                    debug!(plugin_id = %id, error = %cleanup, "Cleanup after failed initialization failed");
                }
                return self
                    .reject(result.fail(format!("Initialization failed: {e}")))
                    .await;
            }
            initialized = true;
        }

        // Registered: recheck what other ids may have changed meanwhile
        {
            let mut plugins = self.plugins.write().await;
            let now_missing: Vec<String> = descriptor
                .required_dependencies()
                .filter(|d| !plugins.contains_key(&d.id))
                .map(|d| d.id.clone())
                .collect();
            let conflict = if plugins.contains_key(&id) {
                Some(format!("Plugin '{id}' is already registered"))
            } else if plugins.len() >= self.config.max_plugins {
                Some(format!("Plugin capacity reached ({} plugins)", self.config.max_plugins))
            } else if !now_missing.is_empty() {
                result.dependencies_missing = now_missing.clone();
                Some(format!("Missing required dependencies: {}", now_missing.join(", ")))
            } else {
                None
            };

            if let Some(conflict) = conflict {
                drop(plugins);
                if initialized {
                    if let Err(e) = plugin.cleanup().await {
                        debug!(plugin_id = %id, error = %e, "Cleanup after aborted registration failed");
                    }
                }
                return self.reject(result.fail(conflict)).await;
            }

            plugins.insert(
                id.clone(),
                RegisteredPlugin {
                    plugin: plugin.clone(),
                    descriptor: descriptor.clone(),
                    initialized,
                    source,
                    registered_at: Utc::now(),
                },
            );
        }

        if let (Some(licenses), Some(policy)) = (&self.licenses, &descriptor.monetization) {
            if let Err(e) = licenses.set_policy(&id, policy.clone()).await {
                result.warnings.push(format!("Monetization policy not applied: {e}"));
            }
        }
        if !descriptor.config.is_empty() {
            if let Err(e) = self.storage.store_config(&id, &descriptor.config).await {
                result.warnings.push(format!("Configuration not persisted: {e}"));
            }
        }

        result.success = true;
        info!(
            plugin_id = %id,
            version = %descriptor.version,
            category = %descriptor.category,
            initialized,
            "Plugin registered"
        );
        self.emit(PluginEvent::new(&id, PluginEventType::Registered).with_data(serde_json::json!({
            "version": descriptor.version,
            "category": descriptor.category,
            "initialized": initialized,
        })))
        .await;
        result
    }

    async fn reject(&self, result: RegistrationResult) -> RegistrationResult {
        warn!(plugin_id = %result.plugin_id, errors = ?result.errors, "Plugin registration rejected");
        result
    }

    /// Every required dependency present at a matching version, no forbidden cycle
    async fn resolve_dependencies(
        &self,
        descriptor: &PluginDescriptor,
        result: &mut RegistrationResult,
    ) -> bool {
        let plugins = self.plugins.read().await;

        for dependency in &descriptor.dependencies {
            match plugins.get(&dependency.id) {
                None if dependency.optional => result
                    .warnings
                    .push(format!("Optional dependency '{}' is not registered", dependency.id)),
                None => result.dependencies_missing.push(dependency.id.clone()),
                Some(registered) if !dependency.accepts(&registered.descriptor.version) => {
                    let message = format!(
                        "Dependency '{}' version {} does not satisfy '{}'",
                        dependency.id, registered.descriptor.version, dependency.version
                    );
                    if dependency.optional {
                        result.warnings.push(message);
                    } else {
                        result.errors.push(message);
                    }
                }
                Some(_) => {}
            }
        }

        if !result.dependencies_missing.is_empty() {
            result.errors.push(format!(
                "Missing required dependencies: {}",
                result.dependencies_missing.join(", ")
            ));
        }

        let mut graph = DependencyGraph::from_descriptors(plugins.values().map(|p| &p.descriptor));
        graph.add(descriptor);
        if let Some(cycle) = graph.find_cycle(&descriptor.id, self.config.allow_optional_cycles) {
            result
                .errors
                .push(format!("Dependency cycle: {}", cycle.join(" -> ")));
        }

        result.errors.is_empty()
    }

    /// Source check for verifiable plugins; license status for monetized ones
    async fn verify_integrity(
        &self,
        descriptor: &PluginDescriptor,
        result: &mut RegistrationResult,
    ) -> Result<Option<SourceVerificationRecord>, ()> {
        let mut record = None;

        if let Some(source) = &descriptor.verification {
            let Some(engine) = &self.verification else {
                result
                    .errors
                    .push("Plugin is verifiable but no verification engine is configured".to_string());
                return Err(());
            };
            let verified = engine
                .verify_plugin_source(&descriptor.id, &source.source_path, &source.expected_identity)
                .await;
            result.warnings.extend(verified.warnings);
            if !verified.valid {
                result.errors.extend(verified.errors);
                return Err(());
            }
            record = verified.record;
        }

        if let (Some(licenses), Some(policy)) = (&self.licenses, &descriptor.monetization) {
            if policy.requires_payment() && !licenses.check_offline_execution(&descriptor.id).await {
                let verification = licenses.verify_license(&descriptor.id).await;
                if !verification.valid {
                    result.warnings.push(format!(
                        "Plugin '{}' is not licensed yet; install a license before use",
                        descriptor.id
                    ));
                }
            }
        }

        Ok(record)
    }

    /// Remove a plugin. Its cleanup runs first; a failing cleanup is reported
    /// but does not keep the plugin registered.
    pub async fn unregister_plugin(&self, plugin_id: &str) -> OperationResult {
        let _guard = self.locks.lock(plugin_id).await;

        let plugin = match self.plugins.read().await.get(plugin_id) {
            Some(registered) => registered.plugin.clone(),
            None => return OperationResult::not_found(plugin_id),
        };

        let mut warnings = Vec::new();
        let dependents = self.enabled_dependents(plugin_id).await;
        if !dependents.is_empty() {
            warnings.push(format!(
                "Plugins that require '{}' remain registered: {}",
                plugin_id,
                dependents.join(", ")
            ));
        }

        if let Err(e) = plugin.cleanup().await {
            warn!(plugin_id = %plugin_id, error = %e, "Plugin cleanup failed; removing anyway");
            warnings.push(format!("Cleanup failed: {e}"));
            self.emit(PluginEvent::error(plugin_id, format!("Cleanup failed: {e}")))
                .await;
        }

        self.plugins.write().await.remove(plugin_id);
        if let Err(e) = self.storage.delete(RecordKind::Config, plugin_id).await {
            warnings.push(format!("Stored configuration not removed: {e}"));
        }

        info!(plugin_id = %plugin_id, "Plugin unregistered");
        self.emit(PluginEvent::new(plugin_id, PluginEventType::Unregistered))
            .await;
        OperationResult::ok(plugin_id, warnings)
    }

    /// Enable a plugin; its required dependencies must be enabled
    pub async fn enable_plugin(&self, plugin_id: &str) -> OperationResult {
        let _guard = self.locks.lock(plugin_id).await;
        let mut plugins = self.plugins.write().await;

        let Some(registered) = plugins.get(plugin_id) else {
            return OperationResult::not_found(plugin_id);
        };
        if registered.descriptor.enabled {
            return OperationResult::ok(plugin_id, vec![format!("Plugin '{plugin_id}' is already enabled")]);
        }

        let blocked: Vec<String> = registered
            .descriptor
            .required_dependencies()
            .filter(|d| !plugins.get(&d.id).is_some_and(|p| p.descriptor.enabled))
            .map(|d| d.id.clone())
            .collect();
        if !blocked.is_empty() {
            return OperationResult::failed(
                plugin_id,
                format!("Required dependencies are not enabled: {}", blocked.join(", ")),
            );
        }

        if let Some(registered) = plugins.get_mut(plugin_id) {
            registered.descriptor.enabled = true;
        }
        drop(plugins);

        info!(plugin_id = %plugin_id, "Plugin enabled");
        self.emit(PluginEvent::new(plugin_id, PluginEventType::Enabled))
            .await;
        OperationResult::ok(plugin_id, Vec::new())
    }

    /// Disable a plugin; enabled plugins that require it are reported as warnings
    pub async fn disable_plugin(&self, plugin_id: &str) -> OperationResult {
        let _guard = self.locks.lock(plugin_id).await;
        let dependents = self.enabled_dependents(plugin_id).await;

        let mut plugins = self.plugins.write().await;
        let Some(registered) = plugins.get_mut(plugin_id) else {
            return OperationResult::not_found(plugin_id);
        };
        if !registered.descriptor.enabled {
            return OperationResult::ok(plugin_id, vec![format!("Plugin '{plugin_id}' is already disabled")]);
        }
        registered.descriptor.enabled = false;
        drop(plugins);

        let warnings = if dependents.is_empty() {
            Vec::new()
        } else {
            vec![format!(
                "Enabled plugins require '{}': {}",
                plugin_id,
                dependents.join(", ")
            )]
        };

        info!(plugin_id = %plugin_id, "Plugin disabled");
        self.emit(PluginEvent::new(plugin_id, PluginEventType::Disabled))
            .await;
        OperationResult::ok(plugin_id, warnings)
    }

    /// Replace a plugin's configuration after the plugin accepts it
    pub async fn update_config(&self, plugin_id: &str, config: PluginConfig) -> OperationResult {
        let _guard = self.locks.lock(plugin_id).await;

        let plugin = match self.plugins.read().await.get(plugin_id) {
            Some(registered) => registered.plugin.clone(),
            None => return OperationResult::not_found(plugin_id),
        };
        let errors = plugin.validate_config(&config);
        if !errors.is_empty() {
            return OperationResult {
                success: false,
                plugin_id: plugin_id.to_string(),
                errors,
                warnings: Vec::new(),
            };
        }

        let mut warnings = Vec::new();
        if let Err(e) = self.storage.store_config(plugin_id, &config).await {
            warnings.push(format!("Configuration not persisted: {e}"));
        }

        let keys: Vec<String> = config.keys().cloned().collect();
        match self.plugins.write().await.get_mut(plugin_id) {
            Some(registered) => registered.descriptor.config = config,
            None => return OperationResult::not_found(plugin_id),
        }

        info!(plugin_id = %plugin_id, "Plugin configuration updated");
        self.emit(
            PluginEvent::new(plugin_id, PluginEventType::Updated)
                .with_data(serde_json::json!({ "config_keys": keys })),
        )
        .await;
        OperationResult::ok(plugin_id, warnings)
    }

    pub async fn get_plugin(&self, plugin_id: &str) -> Option<PluginDescriptor> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .map(|p| p.descriptor.clone())
    }

    /// Source record captured when a verifiable plugin was registered
    pub async fn source_record(&self, plugin_id: &str) -> Option<SourceVerificationRecord> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .and_then(|p| p.source.clone())
    }

    pub async fn registered_at(&self, plugin_id: &str) -> Option<DateTime<Utc>> {
        self.plugins.read().await.get(plugin_id).map(|p| p.registered_at)
    }

    /// Matching descriptors sorted by id
    pub async fn list_plugins(&self, filter: &PluginFilter) -> Vec<PluginDescriptor> {
        let mut descriptors: Vec<PluginDescriptor> = self
            .plugins
            .read()
            .await
            .values()
            .map(|p| &p.descriptor)
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub async fn is_registered(&self, plugin_id: &str) -> bool {
        self.plugins.read().await.contains_key(plugin_id)
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }

    /// Counts derived from the live registry
    pub async fn get_statistics(&self) -> PluginStatistics {
        let plugins = self.plugins.read().await;
        let mut stats = PluginStatistics {
            total: plugins.len(),
            ..PluginStatistics::default()
        };
        for registered in plugins.values() {
            if registered.descriptor.enabled {
                stats.enabled += 1;
            } else {
                stats.disabled += 1;
            }
            if registered.initialized {
                stats.initialized += 1;
            }
            if registered.source.is_some() {
                stats.verified_sources += 1;
            }
            *stats
                .by_category
                .entry(registered.descriptor.category)
                .or_insert(0) += 1;
        }
        stats
    }

    /// Register many plugins regardless of input order.
    ///
    /// Plugins that fail only because a dependency is missing are retried
    /// after the others; one failure never stops the rest. Results follow
    /// input order.
    pub async fn register_plugins(
        &self,
        plugins: Vec<Arc<dyn Plugin>>,
        context: Option<&PluginContext>,
    ) -> Vec<RegistrationResult> {
        let mut results: Vec<Option<RegistrationResult>> = vec![None; plugins.len()];
        let mut pending: Vec<usize> = (0..plugins.len()).collect();

        loop {
            let mut progressed = false;
            let mut retry = Vec::new();

            for index in pending {
                let result = self.register_plugin(plugins[index].clone(), context).await;
                if result.success {
                    progressed = true;
                } else if !result.dependencies_missing.is_empty() {
                    retry.push(index);
                }
                results[index] = Some(result);
            }

            if retry.is_empty() || !progressed {
                break;
            }
            debug!(remaining = retry.len(), "Retrying registrations with missing dependencies");
            pending = retry;
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| {
                    RegistrationResult::new(&plugins[index].descriptor().id)
                        .fail("Registration was not attempted")
                })
            })
            .collect()
    }

    /// Unregister everything, dependents before their dependencies
    pub async fn shutdown(&self) -> Vec<OperationResult> {
        let order = {
            let plugins = self.plugins.read().await;
            DependencyGraph::from_descriptors(plugins.values().map(|p| &p.descriptor)).teardown_order()
        };

        let mut results = Vec::with_capacity(order.len());
        for id in order {
            results.push(self.unregister_plugin(&id).await);
        }
        info!(count = results.len(), "Plugin manager shut down");
        results
    }

    async fn enabled_dependents(&self, plugin_id: &str) -> Vec<String> {
        let plugins = self.plugins.read().await;
        let mut dependents: Vec<String> =
            DependencyGraph::from_descriptors(plugins.values().map(|p| &p.descriptor))
                .dependents_of(plugin_id, false)
                .into_iter()
                .filter(|id| plugins.get(id).is_some_and(|p| p.descriptor.enabled))
                .collect();
        dependents.sort();
        dependents
    }

    async fn emit(&self, event: PluginEvent) {
        let event_type = event.event_type;
        let plugin_id = event.plugin_id.clone();
        if let Err(e) = self.events.publish(event).await {
            warn!(plugin_id = %plugin_id, event = %event_type, error = %e, "Lifecycle event not delivered");
        }
    }
}
