//! Plugin registry and lifecycle
//!
//! Registration states: `Validating -> DependencyResolving -> Verifying ->
//! Registered`, or `Rejected` from any of them. A registered plugin moves
//! between enabled and disabled until it is unregistered.

mod dependency;
mod plugin;
mod registry;

pub use dependency::DependencyGraph;
pub use plugin::{DescriptorPlugin, Plugin, PluginContext};
pub use registry::{OperationResult, PluginFilter, PluginManager, PluginStatistics, RegistrationResult};
