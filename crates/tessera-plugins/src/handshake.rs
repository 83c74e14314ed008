//! Settings-then-start handshake bounded by a deadline

use std::time::Duration;

use tracing::{debug, warn};

use crate::manifest::Settings;
use crate::rpc::RpcProxy;
use crate::{PluginError, PluginResult};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives `setSettings` then `initialize` on a freshly started unit.
///
/// The handshake never terminates the unit; on error the caller must.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    deadline: Duration,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

impl Handshake {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn run(
        &self,
        plugin_id: &str,
        proxy: &RpcProxy,
        settings: &Settings,
    ) -> PluginResult<()> {
        let sequence = async {
            proxy.set_settings(settings).await?;
            proxy.initialize().await
        };

        tokio::select! {
            result = sequence => {
                result.map_err(|source| PluginError::Initialization {
                    plugin_id: plugin_id.to_string(),
                    source,
                })?;
                debug!(plugin_id, "Handshake complete");
                Ok(())
            }
            () = tokio::time::sleep(self.deadline) => {
                warn!(
                    plugin_id,
                    timeout_ms = self.deadline.as_millis() as u64,
                    "Handshake deadline elapsed"
                );
                Err(PluginError::InitializationTimeout {
                    plugin_id: plugin_id.to_string(),
                    timeout: self.deadline,
                })
            }
        }
    }
}
