//! RPC proxy for calling into an execution unit

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::RpcError;
use crate::manifest::Settings;
use crate::worker::methods;

/// Number of calls that may queue in a unit's mailbox before callers wait
pub const MAILBOX_CAPACITY: usize = 64;

/// One call travelling from a proxy to its execution unit
pub(crate) struct Envelope {
    pub method: String,
    pub params: Value,
    pub reply: oneshot::Sender<Result<Value, RpcError>>,
}

/// Local handle whose calls are forwarded to an execution unit.
///
/// Methods are routed by name; arguments and results cross the boundary as
/// owned JSON values, so nothing is shared with the unit. Clones talk to
/// the same unit.
#[derive(Debug, Clone)]
pub struct RpcProxy {
    plugin_id: Arc<str>,
    tx: mpsc::Sender<Envelope>,
}

impl RpcProxy {
    /// Create a proxy together with the mailbox its unit will drain
    pub(crate) fn channel(plugin_id: &str) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let proxy = Self {
            plugin_id: Arc::from(plugin_id),
            tx,
        };
        (proxy, rx)
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Whether the unit behind this proxy has stopped accepting calls
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Invoke `method` with raw JSON parameters
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Envelope {
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| RpcError::Closed)?;

        response.await.map_err(|_| RpcError::Closed)?
    }

    /// Invoke `method`, serializing the arguments and deserializing the result
    pub async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn set_settings(&self, settings: &Settings) -> Result<(), RpcError> {
        self.call(methods::SET_SETTINGS, Value::Object(settings.clone()))
            .await
            .map(|_| ())
    }

    pub async fn initialize(&self) -> Result<(), RpcError> {
        self.call(methods::INITIALIZE, Value::Null).await.map(|_| ())
    }

    pub async fn get_data(&self) -> Result<Value, RpcError> {
        self.call(methods::GET_DATA, Value::Null).await
    }
}
