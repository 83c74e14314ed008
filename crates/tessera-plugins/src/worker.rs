//! Capability contract implemented by plugin workers

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::RpcError;
use crate::builtin::{CounterWorker, ExampleWorker};
use crate::manifest::Settings;

/// Version of the operation set every worker exposes
pub const CONTRACT_VERSION: u32 = 1;

/// Operation names of the capability contract
pub mod methods {
    pub const SET_SETTINGS: &str = "setSettings";
    pub const INITIALIZE: &str = "initialize";
    pub const GET_DATA: &str = "getData";
}

/// Code running inside an execution unit.
///
/// The three contract operations are required; anything else a plugin
/// offers goes through [`WorkerModule::invoke`], which rejects unknown
/// names with [`RpcError::UnsupportedOperation`] unless overridden.
#[async_trait]
pub trait WorkerModule: Send + 'static {
    /// Apply a settings bag. Must accept an empty bag.
    async fn set_settings(&mut self, settings: Settings) -> Result<(), RpcError>;

    /// One-time startup work
    async fn initialize(&mut self) -> Result<(), RpcError>;

    /// Snapshot of the plugin's current state
    async fn get_data(&mut self) -> Result<Value, RpcError>;

    /// Plugin-specific operations invoked by name
    async fn invoke(&mut self, operation: &str, params: Value) -> Result<Value, RpcError> {
        let _ = params;
        Err(RpcError::UnsupportedOperation(operation.to_string()))
    }
}

/// Route a named call to the matching worker operation
pub async fn dispatch(
    module: &mut dyn WorkerModule,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        methods::SET_SETTINGS => {
            let settings = match params {
                Value::Object(map) => map,
                Value::Null => Settings::new(),
                other => {
                    return Err(RpcError::Protocol(format!(
                        "{} expects an object, got {other}",
                        methods::SET_SETTINGS
                    )));
                }
            };
            module.set_settings(settings).await?;
            Ok(Value::Null)
        }
        methods::INITIALIZE => {
            module.initialize().await?;
            Ok(Value::Null)
        }
        methods::GET_DATA => module.get_data().await,
        operation => module.invoke(operation, params).await,
    }
}

type WorkerFactory = Arc<dyn Fn() -> Box<dyn WorkerModule> + Send + Sync>;

/// Workers compiled into the host, addressed as `builtin:<name>`
#[derive(Clone, Default)]
pub struct WorkerCatalog {
    factories: HashMap<String, WorkerFactory>,
}

impl WorkerCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the reference workers shipped with the host
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register("example", ExampleWorker::default);
        catalog.register("counter", CounterWorker::default);
        catalog
    }

    /// Register a factory; a later registration under the same name wins
    pub fn register<F, W>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> W + Send + Sync + 'static,
        W: WorkerModule,
    {
        let boxed: WorkerFactory = Arc::new(move || -> Box<dyn WorkerModule> { Box::new(factory()) });
        self.factories.insert(name.into(), boxed);
    }

    /// Build a fresh module instance
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn WorkerModule>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for WorkerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCatalog")
            .field("names", &self.names())
            .finish()
    }
}
