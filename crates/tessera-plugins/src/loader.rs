//! Plugin loading orchestration

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{error, info, warn};

use crate::bootstrap::Bootstrapper;
use crate::config::{HostConfig, LoadPolicy};
use crate::fallback::{FallbackProvider, PlaceholderProvider};
use crate::handshake::Handshake;
use crate::manifest::PluginManifest;
use crate::registry::{PluginInstance, PluginRegistry};
use crate::resolver::ManifestResolver;
use crate::unit;
use crate::worker::WorkerCatalog;
use crate::{PluginError, PluginResult};

/// Composes resolution, bootstrap, handshake and registration per plugin
pub struct PluginLoader {
    registry: Arc<PluginRegistry>,
    resolver: ManifestResolver,
    bootstrapper: Bootstrapper,
    handshake: Handshake,
    policy: LoadPolicy,
    fallback: Arc<dyn FallbackProvider>,
}

impl PluginLoader {
    pub fn new(
        registry: Arc<PluginRegistry>,
        resolver: ManifestResolver,
        bootstrapper: Bootstrapper,
    ) -> Self {
        Self {
            registry,
            resolver,
            bootstrapper,
            handshake: Handshake::default(),
            policy: LoadPolicy::default(),
            fallback: Arc::new(PlaceholderProvider),
        }
    }

    /// Build a loader from host configuration using the built-in catalog
    pub fn from_config(config: &HostConfig, registry: Arc<PluginRegistry>) -> Self {
        Self::from_config_with_catalog(config, registry, WorkerCatalog::with_builtins())
    }

    pub fn from_config_with_catalog(
        config: &HostConfig,
        registry: Arc<PluginRegistry>,
        catalog: WorkerCatalog,
    ) -> Self {
        let resolver = ManifestResolver::new(config.candidate_roots())
            .with_max_manifest_bytes(config.plugins.max_manifest_bytes);
        let bootstrapper =
            Bootstrapper::new(catalog).with_search_roots(config.plugins.search_roots.clone());

        Self::new(registry, resolver, bootstrapper)
            .with_policy(config.plugins.policy)
            .with_handshake(Handshake::new(config.handshake_timeout()))
    }

    pub fn with_policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_fallback_provider(mut self, provider: impl FallbackProvider) -> Self {
        self.fallback = Arc::new(provider);
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> LoadPolicy {
        self.policy
    }

    pub fn resolver(&self) -> &ManifestResolver {
        &self.resolver
    }

    /// Ids of every bundle found under local candidate roots
    pub async fn discover_plugin_ids(&self) -> Vec<String> {
        self.resolver.discover().await
    }

    /// Load one plugin and register it.
    ///
    /// Under [`LoadPolicy::Permissive`], recoverable failures register a
    /// fallback instance instead of returning an error.
    pub async fn load_plugin_by_id(&self, plugin_id: &str) -> PluginResult<Arc<PluginInstance>> {
        info!(plugin_id, policy = %self.policy, "Loading plugin");

        let resolved = match self.resolver.resolve(plugin_id).await {
            Ok(resolved) => resolved,
            Err(e) => return self.degrade(plugin_id, None, e).await,
        };

        let (unit, proxy) = match self.bootstrapper.bootstrap(&resolved).await {
            Ok(pair) => pair,
            Err(e) => return self.degrade(plugin_id, Some(resolved.manifest()), e).await,
        };

        if let Err(e) = self
            .handshake
            .run(plugin_id, &proxy, &resolved.manifest().settings)
            .await
        {
            unit.terminate();
            return self.degrade(plugin_id, Some(resolved.manifest()), e).await;
        }

        let instance = PluginInstance::new(resolved.into_manifest(), unit, proxy, false);
        Ok(self.registry.register_plugin(instance))
    }

    async fn degrade(
        &self,
        plugin_id: &str,
        manifest: Option<&PluginManifest>,
        cause: PluginError,
    ) -> PluginResult<Arc<PluginInstance>> {
        if self.policy == LoadPolicy::Strict || !cause.allows_fallback() {
            return Err(cause);
        }

        warn!(
            plugin_id,
            code = cause.code(),
            error = %cause,
            "Plugin failed to load, substituting fallback"
        );

        let module = self.fallback.provide(plugin_id, manifest, &cause);
        let manifest = manifest
            .cloned()
            .unwrap_or_else(|| PluginManifest::placeholder(plugin_id));

        let (unit, proxy) = unit::spawn_inline(plugin_id, module);
        if let Err(e) = self.handshake.run(plugin_id, &proxy, &manifest.settings).await {
            unit.terminate();
            error!(plugin_id, error = %e, "Fallback instance failed to start");
            return Err(cause);
        }

        let instance = PluginInstance::new(manifest, unit, proxy, true);
        Ok(self.registry.register_plugin(instance))
    }

    /// Load `plugin_ids` one after another. Failures are logged and
    /// skipped; loaded instances come back in request order. Repeated ids
    /// are loaded once.
    pub async fn load_all_plugins<S: AsRef<str>>(
        &self,
        plugin_ids: &[S],
    ) -> Vec<Arc<PluginInstance>> {
        let plugin_ids = unique_ids(plugin_ids);
        let mut loaded = Vec::with_capacity(plugin_ids.len());
        for plugin_id in plugin_ids.iter().copied() {
            match self.load_plugin_by_id(plugin_id).await {
                Ok(instance) => loaded.push(instance),
                Err(e) => log_skipped(plugin_id, &e),
            }
        }

        info!(
            requested = plugin_ids.len(),
            loaded = loaded.len(),
            "Plugin batch loaded"
        );
        loaded
    }

    /// Same contract as [`PluginLoader::load_all_plugins`], but every id is
    /// loaded at once
    pub async fn load_all_plugins_concurrent<S: AsRef<str>>(
        &self,
        plugin_ids: &[S],
    ) -> Vec<Arc<PluginInstance>> {
        let plugin_ids = unique_ids(plugin_ids);
        let results = join_all(
            plugin_ids
                .iter()
                .map(|plugin_id| self.load_plugin_by_id(plugin_id)),
        )
        .await;

        let loaded: Vec<_> = plugin_ids
            .iter()
            .zip(results)
            .filter_map(|(plugin_id, result)| match result {
                Ok(instance) => Some(instance),
                Err(e) => {
                    log_skipped(plugin_id, &e);
                    None
                }
            })
            .collect();

        info!(
            requested = plugin_ids.len(),
            loaded = loaded.len(),
            "Plugin batch loaded concurrently"
        );
        loaded
    }

    pub fn unload_plugin(&self, plugin_id: &str) -> bool {
        self.registry.unregister_plugin(plugin_id)
    }

    pub fn unload_all_plugins(&self) -> usize {
        self.registry.cleanup()
    }
}

/// First occurrence of each id, in request order
fn unique_ids<S: AsRef<str>>(plugin_ids: &[S]) -> Vec<&str> {
    let mut seen = HashSet::new();
    plugin_ids
        .iter()
        .map(AsRef::as_ref)
        .filter(|plugin_id| seen.insert(*plugin_id))
        .collect()
}

fn log_skipped(plugin_id: &str, error: &PluginError) {
    warn!(
        plugin_id,
        code = error.code(),
        error = %error,
        "Skipping plugin that failed to load"
    );
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("resolver", &self.resolver)
            .field("bootstrapper", &self.bootstrapper)
            .field("handshake", &self.handshake)
            .field("policy", &self.policy)
            .field("registered", &self.registry.len())
            .finish()
    }
}
