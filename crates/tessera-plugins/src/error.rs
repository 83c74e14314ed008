//! Error types for the plugin runtime

use std::time::Duration;

use thiserror::Error;

/// Result type alias for plugin runtime operations
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Failures that can stop a plugin from loading.
///
/// Every variant carries the id of the plugin being loaded so batch
/// loaders can log and skip without losing context.
#[derive(Error, Debug)]
pub enum PluginError {
    // Manifest errors (E500-E509)
    #[error(
        "Manifest for plugin '{plugin_id}' could not be retrieved: {}",
        attempts.join("; ")
    )]
    ManifestRetrieval {
        plugin_id: String,
        attempts: Vec<String>,
    },

    #[error("Manifest for plugin '{plugin_id}' is not valid JSON: {source}")]
    ManifestParse {
        plugin_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Manifest for plugin '{plugin_id}' is invalid: {reason}")]
    ManifestValidation { plugin_id: String, reason: String },

    // Execution unit errors (E510-E519)
    #[error("Execution unit for plugin '{plugin_id}' could not be created: {reason}")]
    ExecutionUnitCreation { plugin_id: String, reason: String },

    // Handshake errors (E520-E529)
    #[error(
        "Plugin '{plugin_id}' did not finish initializing within {}ms",
        timeout.as_millis()
    )]
    InitializationTimeout {
        plugin_id: String,
        timeout: Duration,
    },

    #[error("Plugin '{plugin_id}' failed to initialize: {source}")]
    Initialization {
        plugin_id: String,
        #[source]
        source: RpcError,
    },
}

impl PluginError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ManifestRetrieval { .. } => "E500",
            Self::ManifestParse { .. } => "E501",
            Self::ManifestValidation { .. } => "E502",
            Self::ExecutionUnitCreation { .. } => "E510",
            Self::InitializationTimeout { .. } => "E520",
            Self::Initialization { .. } => "E521",
        }
    }

    /// The plugin this error belongs to
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::ManifestRetrieval { plugin_id, .. }
            | Self::ManifestParse { plugin_id, .. }
            | Self::ManifestValidation { plugin_id, .. }
            | Self::ExecutionUnitCreation { plugin_id, .. }
            | Self::InitializationTimeout { plugin_id, .. }
            | Self::Initialization { plugin_id, .. } => plugin_id,
        }
    }

    /// Get a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ManifestRetrieval { .. } => Some("tessera list".to_string()),
            Self::ManifestValidation { .. } => {
                Some("Check that manifest.json declares id, name and worker.entryPoint".to_string())
            }
            Self::InitializationTimeout { timeout, .. } => Some(format!(
                "tessera --timeout-secs {} load {}",
                timeout.as_secs().saturating_mul(2).max(1),
                self.plugin_id()
            )),
            _ => None,
        }
    }

    /// Whether a permissive host may replace the failed plugin with a
    /// fallback instance.
    ///
    /// A manifest that fails validation cannot describe its worker, so
    /// there is nothing for a fallback to stand in for.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, Self::ManifestValidation { .. })
    }
}

/// Errors raised by a call through an [`RpcProxy`](crate::rpc::RpcProxy).
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Plugin returned error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("Execution unit is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// Build a remote failure from a worker-side message
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Wire code used when this error crosses the stdio protocol
    pub fn wire_code(&self) -> &str {
        match self {
            Self::UnsupportedOperation(_) => "unsupported_operation",
            Self::Remote { code, .. } => code,
            Self::Closed => "closed",
            Self::Serialization(_) => "serialization",
            Self::Protocol(_) => "protocol",
        }
    }
}
