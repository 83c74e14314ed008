//! Registry of live plugin instances

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use crate::manifest::PluginManifest;
use crate::rpc::RpcProxy;
use crate::unit::ExecutionUnit;

/// A loaded plugin: its manifest, its execution unit and a proxy into it
pub struct PluginInstance {
    manifest: PluginManifest,
    unit: ExecutionUnit,
    proxy: RpcProxy,
    is_fallback: bool,
}

impl PluginInstance {
    pub fn new(
        manifest: PluginManifest,
        unit: ExecutionUnit,
        proxy: RpcProxy,
        is_fallback: bool,
    ) -> Self {
        Self {
            manifest,
            unit,
            proxy,
            is_fallback,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn unit(&self) -> &ExecutionUnit {
        &self.unit
    }

    pub fn proxy(&self) -> &RpcProxy {
        &self.proxy
    }

    pub fn has_ui(&self) -> bool {
        self.manifest.has_ui()
    }

    pub fn has_background(&self) -> bool {
        self.manifest.has_background()
    }

    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("unit", &self.unit)
            .field("has_ui", &self.has_ui())
            .field("has_background", &self.has_background())
            .field("is_fallback", &self.is_fallback)
            .finish()
    }
}

/// Single source of truth for which plugins are live.
///
/// Every mutation happens under one write guard, and an instance leaves
/// the map only after its unit has been terminated.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<PluginInstance>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `instance`, terminating any instance already registered under
    /// the same id.
    pub fn register_plugin(&self, instance: PluginInstance) -> Arc<PluginInstance> {
        let instance = Arc::new(instance);
        let id = instance.id().to_string();

        let mut plugins = self.write();
        if let Some(previous) = plugins.remove(&id) {
            warn!(
                plugin_id = %id,
                previous_unit = %previous.unit().id(),
                "Replacing registered plugin"
            );
            previous.unit().terminate();
        }
        plugins.insert(id.clone(), Arc::clone(&instance));
        drop(plugins);

        info!(
            plugin_id = %id,
            unit_id = %instance.unit().id(),
            fallback = instance.is_fallback(),
            "Plugin registered"
        );
        instance
    }

    /// Terminate and remove the instance for `id`. Returns whether one was
    /// registered.
    pub fn unregister_plugin(&self, id: &str) -> bool {
        let removed = self.write().remove(id);
        match removed {
            Some(instance) => {
                instance.unit().terminate();
                info!(plugin_id = %id, "Plugin unregistered");
                true
            }
            None => false,
        }
    }

    pub fn get_plugin(&self, id: &str) -> Option<Arc<PluginInstance>> {
        self.read().get(id).cloned()
    }

    pub fn get_all_plugins(&self) -> Vec<Arc<PluginInstance>> {
        self.read().values().cloned().collect()
    }

    /// Terminate every instance and empty the registry
    pub fn cleanup(&self) -> usize {
        let drained: Vec<_> = self.write().drain().map(|(_, instance)| instance).collect();
        for instance in &drained {
            instance.unit().terminate();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Registry cleaned up");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<PluginInstance>>> {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<PluginInstance>>> {
        self.plugins.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::ExampleWorker;
    use crate::unit::spawn_inline;

    fn instance(id: &str) -> PluginInstance {
        let (unit, proxy) = spawn_inline(id, Box::new(ExampleWorker::default()));
        PluginInstance::new(PluginManifest::placeholder(id), unit, proxy, false)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = PluginRegistry::new();
        let registered = registry.register_plugin(instance("a"));

        let found = registry.get_plugin("a").unwrap();
        assert!(Arc::ptr_eq(&registered, &found));
        assert!(registry.get_plugin("b").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn replacing_terminates_previous_unit() {
        let registry = PluginRegistry::new();
        let first = registry.register_plugin(instance("a"));
        let second = registry.register_plugin(instance("a"));

        assert!(first.unit().is_terminated());
        assert!(!second.unit().is_terminated());
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get_plugin("a").unwrap(), &second));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = PluginRegistry::new();
        let registered = registry.register_plugin(instance("a"));

        assert!(registry.unregister_plugin("a"));
        assert!(!registry.unregister_plugin("a"));
        assert!(!registry.unregister_plugin("never-registered"));
        assert!(registered.unit().is_terminated());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cleanup_terminates_everything() {
        let registry = PluginRegistry::new();
        let a = registry.register_plugin(instance("a"));
        let b = registry.register_plugin(instance("b"));

        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.cleanup(), 2);
        assert!(a.unit().is_terminated());
        assert!(b.unit().is_terminated());
        assert_eq!(registry.cleanup(), 0);
        assert!(registry.get_all_plugins().is_empty());
    }

    #[tokio::test]
    async fn capability_flags_follow_manifest() {
        let registry = PluginRegistry::new();
        let registered = registry.register_plugin(instance("a"));

        assert!(!registered.has_ui());
        assert!(!registered.has_background());
        assert!(!registered.is_fallback());
        assert_eq!(registered.name(), "a");
    }
}
