//! Counter worker with a strictly increasing update timestamp

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RpcError;
use crate::manifest::Settings;
use crate::worker::WorkerModule;

/// Snapshot returned by every counter operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterData {
    pub count: i64,
    pub increment_by: i64,
    pub last_updated: DateTime<Utc>,
}

/// Stateful counter with a configurable step
#[derive(Debug)]
pub struct CounterWorker {
    count: i64,
    increment_by: i64,
    last_updated: DateTime<Utc>,
}

impl Default for CounterWorker {
    fn default() -> Self {
        Self {
            count: 0,
            increment_by: 1,
            last_updated: Utc::now(),
        }
    }
}

impl CounterWorker {
    fn snapshot(&self) -> CounterData {
        CounterData {
            count: self.count,
            increment_by: self.increment_by,
            last_updated: self.last_updated,
        }
    }

    fn snapshot_value(&self) -> Result<Value, RpcError> {
        Ok(serde_json::to_value(self.snapshot())?)
    }

    // Clock reads can repeat or step backwards; mutations must not.
    fn touch(&mut self) {
        let now = Utc::now();
        self.last_updated = if now > self.last_updated {
            now
        } else {
            self.last_updated + Duration::microseconds(1)
        };
    }
}

#[async_trait]
impl WorkerModule for CounterWorker {
    async fn set_settings(&mut self, settings: Settings) -> Result<(), RpcError> {
        if let Some(value) = settings.get("incrementBy") {
            self.increment_by = value.as_i64().ok_or_else(|| {
                RpcError::remote(
                    "invalid_settings",
                    format!("incrementBy must be an integer, got {value}"),
                )
            })?;
        }
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), RpcError> {
        self.touch();
        Ok(())
    }

    async fn get_data(&mut self) -> Result<Value, RpcError> {
        self.snapshot_value()
    }

    async fn invoke(&mut self, operation: &str, _params: Value) -> Result<Value, RpcError> {
        match operation {
            "incrementCounter" => {
                self.count = self.count.saturating_add(self.increment_by);
                self.touch();
                self.snapshot_value()
            }
            "resetCounter" => {
                self.count = 0;
                self.touch();
                self.snapshot_value()
            }
            other => Err(RpcError::UnsupportedOperation(other.to_string())),
        }
    }
}
