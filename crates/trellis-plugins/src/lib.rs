//! Trellis Plugin System
//!
//! Registers third-party extension modules (DID methods, credential types,
//! crypto suites, utilities) with a host identity agent and decides whether
//! they may run:
//! - Source identity derivation (content-addressed provenance)
//! - Namespaced, optionally encrypted storage of configs and cached licenses
//! - License credential verification (online, cached, status-list revocation)
//! - Monetized installation and offline-usage accounting
//! - Registry lifecycle with dependency resolution and lifecycle events

pub mod descriptor;
pub mod license;
pub mod manager;
pub mod source;
pub mod storage;
pub mod verification;

use std::path::PathBuf;
use thiserror::Error;

pub use descriptor::{Permission, PluginCategory, PluginDependency, PluginDescriptor, VerifiableSource};
pub use license::{InstallOptions, InstallResult, LicenseManager, MonetizationPolicy};
pub use manager::{Plugin, PluginContext, PluginManager, RegistrationResult};
pub use source::{SourceHash, SourceIdentityDeriver, derive_identity};
pub use storage::{RecordKind, StorageManager};
pub use verification::{
    CachedLicense, LicenseCredential, LicenseType, VerificationEngine, VerificationResult,
};

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin validation failed: {0}")]
    Validation(String),

    #[error("Dependency resolution failed: {0}")]
    Dependency(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("License expired for plugin '{0}'")]
    LicenseExpired(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Payment failed: {0}")]
    Payment(String),

    #[error("Plugin capacity reached ({limit} plugins)")]
    Capacity { limit: usize },

    #[error("Cannot read '{}': {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Source hash incomplete at '{}': {reason}", path.display())]
    PartialHash { path: PathBuf, reason: String },

    #[error(transparent)]
    Core(#[from] trellis_core::Error),
}

impl PluginError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E500",
            Self::Validation(_) => "E501",
            Self::LicenseExpired(_) => "E502",
            Self::Dependency(_) => "E503",
            Self::Verification(_) => "E504",
            Self::Storage(_) => "E505",
            Self::Payment(_) => "E506",
            Self::Capacity { .. } => "E507",
            Self::FileSystem { .. } => "E508",
            Self::PartialHash { .. } => "E509",
            Self::Core(inner) => inner.code(),
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_error_display() {
        let not_found = PluginError::NotFound("my-plugin".to_string());
        let validation = PluginError::Validation("bad descriptor".to_string());
        let expired = PluginError::LicenseExpired("expired-plugin".to_string());
        let capacity = PluginError::Capacity { limit: 4 };

        assert!(not_found.to_string().contains("my-plugin"));
        assert!(validation.to_string().contains("bad descriptor"));
        assert!(expired.to_string().contains("expired-plugin"));
        assert!(capacity.to_string().contains('4'));
    }

    #[test]
    fn test_plugin_error_codes() {
        assert_eq!(PluginError::Validation(String::new()).code(), "E501");
        assert_eq!(PluginError::Capacity { limit: 1 }.code(), "E507");
        let core = PluginError::from(trellis_core::Error::LockTimeout("x".into()));
        assert_eq!(core.code(), "E300");
    }

    #[test]
    fn test_filesystem_error_mentions_path() {
        let err = PluginError::FileSystem {
            path: PathBuf::from("/plugins/missing"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.to_string().contains("/plugins/missing"));
    }
}
