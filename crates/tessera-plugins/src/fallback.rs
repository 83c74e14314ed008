//! Degraded stand-ins for plugins that failed to load

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::manifest::{PluginManifest, Settings};
use crate::worker::WorkerModule;
use crate::{PluginError, RpcError};

/// Supplies the worker hosted in place of a plugin that could not start
pub trait FallbackProvider: Send + Sync + 'static {
    fn provide(
        &self,
        plugin_id: &str,
        manifest: Option<&PluginManifest>,
        cause: &PluginError,
    ) -> Box<dyn WorkerModule>;
}

/// Default provider: a worker that answers with fixed placeholder data
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderProvider;

impl FallbackProvider for PlaceholderProvider {
    fn provide(
        &self,
        plugin_id: &str,
        _manifest: Option<&PluginManifest>,
        cause: &PluginError,
    ) -> Box<dyn WorkerModule> {
        Box::new(PlaceholderWorker::new(plugin_id, cause.to_string()))
    }
}

#[derive(Debug)]
pub struct PlaceholderWorker {
    plugin_id: String,
    reason: String,
    settings: Settings,
}

impl PlaceholderWorker {
    pub fn new(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
            settings: Settings::new(),
        }
    }
}

#[async_trait]
impl WorkerModule for PlaceholderWorker {
    async fn set_settings(&mut self, settings: Settings) -> Result<(), RpcError> {
        self.settings = settings;
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn get_data(&mut self) -> Result<Value, RpcError> {
        Ok(json!({
            "pluginId": self.plugin_id,
            "fallback": true,
            "message": format!("Plugin '{}' is unavailable", self.plugin_id),
            "reason": self.reason,
            "settings": self.settings,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_data_is_deterministic() {
        let cause = PluginError::ManifestRetrieval {
            plugin_id: "ghost".into(),
            attempts: vec!["plugins: not found".into()],
        };
        let mut worker = PlaceholderProvider.provide("ghost", None, &cause);

        worker.set_settings(Settings::new()).await.unwrap();
        worker.initialize().await.unwrap();
        let first = worker.get_data().await.unwrap();
        let second = worker.get_data().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first["fallback"], true);
        assert_eq!(first["message"], "Plugin 'ghost' is unavailable");
        assert!(first["reason"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn placeholder_rejects_plugin_operations() {
        let mut worker = PlaceholderWorker::new("ghost", "gone");
        let err = worker
            .invoke("incrementCounter", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedOperation(_)));
    }
}
