//! Tessera Plugin Runtime
//!
//! Loads plugin bundles into isolated execution units:
//! - Manifest resolution from primary and alternate locations
//! - Inline (task) and process (stdio) execution units behind an RPC proxy
//! - Bounded settings-then-start handshake
//! - Registry with replace and teardown semantics
//! - Strict or permissive loading with fallback instances

pub mod bootstrap;
pub mod builtin;
pub mod config;
pub mod error;
pub mod fallback;
pub mod handshake;
pub mod loader;
pub mod manifest;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod rpc;
pub mod unit;
pub mod worker;

pub use bootstrap::Bootstrapper;
pub use config::{DeploymentLayout, HostConfig, LoadPolicy};
pub use error::{PluginError, PluginResult, RpcError};
pub use fallback::{FallbackProvider, PlaceholderProvider};
pub use handshake::Handshake;
pub use loader::PluginLoader;
pub use manifest::{BundleLocation, PluginManifest, ResolvedManifest, Settings, WorkerEntry};
pub use registry::{PluginInstance, PluginRegistry};
pub use resolver::{CandidateRoot, ManifestResolver};
pub use rpc::RpcProxy;
pub use unit::{ExecutionUnit, UnitKind};
pub use worker::{CONTRACT_VERSION, WorkerCatalog, WorkerModule};
