use async_trait::async_trait;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use trellis_core::events::EventBus;

use crate::descriptor::{Permission, PluginDescriptor};
use crate::storage::{PluginConfig, StorageManager};
use crate::{PluginError, PluginResult};

/// A plugin as the registry sees it
#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    /// Plugin-specific checks on a configuration map; returns every problem found
    fn validate_config(&self, _config: &PluginConfig) -> Vec<String> {
        Vec::new()
    }

    /// Called once, at registration, when the host supplies a context
    async fn initialize(&self, _context: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    /// Called before the plugin is removed from the registry
    async fn cleanup(&self) -> PluginResult<()> {
        Ok(())
    }
}

/// A plugin with no behaviour beyond its descriptor
#[derive(Debug, Clone)]
pub struct DescriptorPlugin {
    descriptor: PluginDescriptor,
}

impl DescriptorPlugin {
    pub fn new(descriptor: PluginDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn shared(descriptor: PluginDescriptor) -> Arc<dyn Plugin> {
        Arc::new(Self::new(descriptor))
    }
}

#[async_trait]
impl Plugin for DescriptorPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

type Capability = Arc<dyn Any + Send + Sync>;

/// What the host agent hands a plugin at initialization
#[derive(Clone)]
pub struct PluginContext {
    pub storage: StorageManager,
    pub events: Arc<dyn EventBus>,
    permissions: HashSet<Permission>,
    capabilities: HashMap<String, Capability>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut capabilities: Vec<&String> = self.capabilities.keys().collect();
        capabilities.sort();
        f.debug_struct("PluginContext")
            .field("storage", &self.storage)
            .field("permissions", &self.permissions)
            .field("capabilities", &capabilities)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    pub fn new(storage: StorageManager, events: Arc<dyn EventBus>) -> Self {
        Self {
            storage,
            events,
            permissions: HashSet::new(),
            capabilities: HashMap::new(),
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions.extend(permissions);
        self
    }

    /// Expose a host API to plugins under `name`
    pub fn with_capability<T: Any + Send + Sync>(mut self, name: impl Into<String>, api: Arc<T>) -> Self {
        self.capabilities.insert(name.into(), api);
        self
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn require_permission(&self, permission: Permission) -> PluginResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(PluginError::Validation(format!(
                "Permission {:?} not granted",
                permission
            )))
        }
    }

    /// Permissions `descriptor` requests that this context does not grant
    pub fn missing_permissions(&self, descriptor: &PluginDescriptor) -> Vec<Permission> {
        descriptor
            .permissions
            .iter()
            .filter(|p| !self.permissions.contains(p))
            .copied()
            .collect()
    }

    /// Host API registered under `name`, if it has type `T`
    pub fn capability<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.capabilities
            .get(name)
            .cloned()
            .and_then(|api| api.downcast::<T>().ok())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PluginCategory;
    use trellis_core::events::NoopEventBus;

    struct Resolver {
        endpoint: String,
    }

    fn context() -> PluginContext {
        PluginContext::new(StorageManager::in_memory("test").unwrap(), Arc::new(NoopEventBus))
    }

    #[test]
    fn test_permissions() {
        let ctx = context().with_permission(Permission::Network);
        assert!(ctx.require_permission(Permission::Network).is_ok());
        assert!(ctx.require_permission(Permission::KeyManagement).is_err());

        let descriptor = PluginDescriptor::new("a", "A", "1.0.0", PluginCategory::Utility, "did:example:dev")
            .with_permission(Permission::Network)
            .with_permission(Permission::WriteStorage);
        assert_eq!(ctx.missing_permissions(&descriptor), vec![Permission::WriteStorage]);
    }

    #[test]
    fn test_capability_downcast() {
        let ctx = context().with_capability(
            "did-resolver",
            Arc::new(Resolver {
                endpoint: "https://dev.uniresolver.io".to_string(),
            }),
        );

        let api = ctx.capability::<Resolver>("did-resolver").unwrap();
        assert_eq!(api.endpoint, "https://dev.uniresolver.io");
        assert!(ctx.capability::<String>("did-resolver").is_none());
        assert!(ctx.capability::<Resolver>("missing").is_none());
        assert!(ctx.has_capability("did-resolver"));
    }
}
