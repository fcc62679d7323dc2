//! Trellis Core Library
//!
//! Shared plumbing for the Trellis plugin subsystem:
//! - Error type with stable codes
//! - Configuration (TOML file + environment secrets)
//! - Tracing subscriber setup
//! - Plugin lifecycle events and event buses
//! - Per-key async locking

pub mod config;
pub mod error;
pub mod events;
pub mod locking;
pub mod logging;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventBus, PluginEvent, PluginEventType};
    pub use crate::locking::KeyedMutex;
}
