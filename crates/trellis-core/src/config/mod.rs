//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable holding the storage encryption key (base64 or hex)
pub const STORAGE_KEY_ENV: &str = "TRELLIS_STORAGE_KEY";

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "TRELLIS_CONFIG_DIR";

/// Trellis configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub verification: VerificationConfig,
    pub license: LicenseConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Prefix for every persisted key (`<namespace>-<kind>-<plugin id>`)
    pub namespace: String,
    #[serde(skip)]
    pub encryption_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace: "trellis".to_string(),
            encryption_key: None,
        }
    }
}

/// What to do when a revocation status list cannot be fetched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationFailurePolicy {
    /// Treat the credential as not revoked and record a warning
    #[default]
    FailOpen,
    /// Treat the credential as invalid
    FailClosed,
}

impl RevocationFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailOpen => "fail_open",
            Self::FailClosed => "fail_closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub status_list_ttl_secs: u64,
    pub source_cache_ttl_secs: u64,
    pub revocation_failure_policy: RevocationFailurePolicy,
    /// Treat a missing ledger release record as fatal
    pub require_ledger_anchor: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            status_list_ttl_secs: 24 * 60 * 60,
            source_cache_ttl_secs: 60 * 60,
            revocation_failure_policy: RevocationFailurePolicy::FailOpen,
            require_ledger_anchor: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    pub default_max_offline_usage: u32,
    pub cache_on_install: bool,
    pub verify_on_install: bool,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            default_max_offline_usage: 100,
            cache_on_install: true,
            verify_on_install: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_plugins: usize,
    /// Permit dependency cycles as long as one edge in the cycle is optional
    pub allow_optional_cycles: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_plugins: 256,
            allow_optional_cycles: true,
        }
    }
}

impl StorageConfig {
    /// Encryption key from the environment. `None` means records are stored in plaintext.
    pub fn resolved_encryption_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env::var(STORAGE_KEY_ENV).ok().filter(|k| !k.trim().is_empty()))
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.encryption_key.is_some() {
            return Err(anyhow!(
                "Storage encryption keys must be provided via {}, not stored in configuration",
                STORAGE_KEY_ENV
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("trellis")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| {
                format!("Failed to create config directory: {}", dir.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.storage.enforce_env_only()?;

        let namespace = self.storage.namespace.trim();
        if namespace.is_empty() {
            return Err(anyhow!("storage.namespace cannot be empty"));
        }
        if !namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(anyhow!(
                "storage.namespace may only contain ASCII letters, digits, '_' and '.'"
            ));
        }
        if self.verification.status_list_ttl_secs == 0 {
            return Err(anyhow!("verification.status_list_ttl_secs must be positive"));
        }
        if self.registry.max_plugins == 0 {
            return Err(anyhow!("registry.max_plugins must be positive"));
        }
        Ok(())
    }
}
