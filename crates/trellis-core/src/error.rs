//! Error types for Trellis

use thiserror::Error;

/// Result type alias using Trellis's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Cross-cutting errors shared by every Trellis component
#[derive(Error, Debug)]
pub enum Error {
    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Lock errors (E300-E399)
    #[error("Lock timeout: resource '{0}' is busy. Try again later.")]
    LockTimeout(String),

    // Event errors (E1000-E1099)
    #[error("Event delivery failed: {0}")]
    EventDeliveryFailed(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockTimeout(_) => "E300",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::EventDeliveryFailed(_) => "E1000",
            Self::Serialization(_) => "E1100",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ConfigError(_) => Some(
                "Check config.toml in $TRELLIS_CONFIG_DIR (or the platform config dir)".to_string(),
            ),
            Self::LockTimeout(resource) => {
                Some(format!("Wait for the pending operation on '{}' to finish", resource))
            }
            _ => None,
        }
    }
}
