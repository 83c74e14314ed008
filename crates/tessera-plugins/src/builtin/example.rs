//! Example worker that greets and echoes

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::RpcError;
use crate::manifest::Settings;
use crate::worker::WorkerModule;

pub const DEFAULT_GREETING: &str = "Hello from the example plugin";

/// Minimal worker that reports its settings back
#[derive(Debug, Default)]
pub struct ExampleWorker {
    settings: Settings,
    initialized: bool,
}

impl ExampleWorker {
    fn greeting(&self) -> &str {
        self.settings
            .get("greeting")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_GREETING)
    }
}

#[async_trait]
impl WorkerModule for ExampleWorker {
    async fn set_settings(&mut self, settings: Settings) -> Result<(), RpcError> {
        self.settings = settings;
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), RpcError> {
        self.initialized = true;
        Ok(())
    }

    async fn get_data(&mut self) -> Result<Value, RpcError> {
        Ok(json!({
            "message": self.greeting(),
            "initialized": self.initialized,
            "settings": self.settings,
        }))
    }

    async fn invoke(&mut self, operation: &str, params: Value) -> Result<Value, RpcError> {
        match operation {
            "echo" => Ok(params),
            other => Err(RpcError::UnsupportedOperation(other.to_string())),
        }
    }
}
