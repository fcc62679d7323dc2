//! Plugin descriptors
//!
//! A [`PluginDescriptor`] is the registry's view of a plugin: identity,
//! category, capabilities, dependencies and configuration.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use crate::license::MonetizationPolicy;

/// Longest accepted plugin id
pub const MAX_PLUGIN_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    DidMethod,
    CredentialType,
    CryptoSuite,
    Utility,
}

impl PluginCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DidMethod => "did_method",
            Self::CredentialType => "credential_type",
            Self::CryptoSuite => "crypto_suite",
            Self::Utility => "utility",
        }
    }
}

impl std::fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Host capabilities a plugin may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadStorage,
    WriteStorage,
    Network,
    KeyManagement,
    CredentialIssuance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    /// Id of the plugin depended upon
    pub id: String,
    /// semver requirement, e.g. `^1.2` or `*`
    #[serde(default = "any_version")]
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

fn any_version() -> String {
    "*".to_string()
}

impl PluginDependency {
    pub fn required(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            optional: false,
        }
    }

    pub fn optional(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            optional: true,
        }
    }

    /// Whether `version` satisfies this dependency's requirement
    pub fn accepts(&self, version: &str) -> bool {
        match (VersionReq::parse(&self.version), Version::parse(version)) {
            (Ok(req), Ok(v)) => req.matches(&v),
            _ => false,
        }
    }
}

/// Where a verifiable plugin's source lives and which identity it must hash to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableSource {
    pub source_path: PathBuf,
    pub expected_identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub category: PluginCategory,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
    /// Identity (DID) of the author
    pub author: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub verification: Option<VerifiableSource>,
    #[serde(default)]
    pub monetization: Option<MonetizationPolicy>,
}

fn enabled_by_default() -> bool {
    true
}

impl PluginDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        category: PluginCategory,
        author: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            category,
            capabilities: BTreeSet::new(),
            dependencies: Vec::new(),
            author: author.into(),
            permissions: Vec::new(),
            enabled: true,
            config: serde_json::Map::new(),
            verification: None,
            monetization: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_dependency(mut self, dependency: PluginDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_verification(mut self, source: VerifiableSource) -> Self {
        self.verification = Some(source);
        self
    }

    pub fn with_monetization(mut self, policy: MonetizationPolicy) -> Self {
        self.monetization = Some(policy);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_verifiable(&self) -> bool {
        self.verification.is_some()
    }

    pub fn required_dependencies(&self) -> impl Iterator<Item = &PluginDependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }

    /// Structural checks; returns every problem found
    pub fn validate_structure(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = validate_plugin_id(&self.id) {
            errors.push(e);
        }
        if self.name.trim().is_empty() {
            errors.push("Plugin name cannot be empty".to_string());
        }
        if Version::parse(&self.version).is_err() {
            errors.push(format!("Invalid plugin version '{}': expected semver", self.version));
        }
        if self.author.trim().is_empty() {
            errors.push("Plugin author cannot be empty".to_string());
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            errors.push("Capabilities cannot be empty strings".to_string());
        }

        let mut seen = HashSet::new();
        for dependency in &self.dependencies {
            if dependency.id.trim().is_empty() {
                errors.push("Dependency id cannot be empty".to_string());
                continue;
            }
            if dependency.id == self.id {
                errors.push(format!("Plugin '{}' cannot depend on itself", self.id));
            }
            if !seen.insert(dependency.id.as_str()) {
                errors.push(format!("Duplicate dependency '{}'", dependency.id));
            }
            if VersionReq::parse(&dependency.version).is_err() {
                errors.push(format!(
                    "Invalid version constraint '{}' for dependency '{}'",
                    dependency.version, dependency.id
                ));
            }
        }

        let mut permissions = HashSet::new();
        for permission in &self.permissions {
            if !permissions.insert(permission) {
                errors.push("Duplicate permissions are not allowed".to_string());
                break;
            }
        }

        if self
            .verification
            .as_ref()
            .is_some_and(|source| source.expected_identity.trim().is_empty())
        {
            errors.push("Verifiable plugins must declare an expected source identity".to_string());
        }

        if let Some(policy) = &self.monetization {
            errors.extend(policy.validate());
        }

        errors
    }
}

/// Plugin ids end up in storage keys and file names
pub fn validate_plugin_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Plugin id cannot be empty".to_string());
    }
    if id.len() > MAX_PLUGIN_ID_LEN {
        return Err(format!("Plugin id exceeds {} characters", MAX_PLUGIN_ID_LEN));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!(
            "Plugin id '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            id
        ));
    }
    if id.starts_with('.') {
        return Err(format!("Plugin id '{}' cannot start with '.'", id));
    }
    Ok(())
}
