//! Plugin manifest format (`manifest.json`)

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{PluginError, PluginResult};

/// Free-form settings bag handed to a plugin's `setSettings`
pub type Settings = serde_json::Map<String, serde_json::Value>;

/// Scheme prefix for workers compiled into the host
pub const BUILTIN_SCHEME: &str = "builtin:";

/// Plugin manifest describing a plugin's identity and entry points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Stable identifier, unique within a host
    pub id: String,
    /// Human-readable name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// UI entry, rendered by the host UI (not by this runtime)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<EntryRef>,
    /// Background task entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<EntryRef>,
    /// Worker entry. Optional here so that a missing entry surfaces as a
    /// validation error instead of a parse error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerEntry>,
    #[serde(default)]
    pub settings: Settings,
}

/// Reference to a UI or background entry module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRef {
    pub entry_point: String,
}

/// Reference to the module that runs inside the plugin's execution unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEntry {
    /// Either `builtin:<name>` or a path to an executable
    pub entry_point: String,
    /// Arguments passed to process-backed workers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl WorkerEntry {
    /// Name of the built-in module, if the entry uses the `builtin:` scheme
    pub fn builtin_name(&self) -> Option<&str> {
        self.entry_point.strip_prefix(BUILTIN_SCHEME)
    }
}

impl PluginManifest {
    /// Minimal manifest standing in for a plugin whose descriptor could not
    /// be retrieved.
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            version: None,
            ui: None,
            background: None,
            worker: Some(WorkerEntry {
                entry_point: format!("{BUILTIN_SCHEME}fallback"),
                args: Vec::new(),
            }),
            settings: Settings::new(),
        }
    }

    pub fn has_ui(&self) -> bool {
        self.ui.is_some()
    }

    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }
}

/// Where a manifest was retrieved from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleLocation {
    /// Local bundle directory containing `manifest.json`
    Directory(PathBuf),
    /// Remote manifest URL
    Remote(String),
}

impl std::fmt::Display for BundleLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Directory(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

/// A manifest that passed validation.
///
/// This is the only input the bootstrapper accepts, and it can only be
/// built through [`ResolvedManifest::validate`], so a manifest without a
/// worker entry can never reach an execution unit.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    manifest: PluginManifest,
    worker: WorkerEntry,
    bundle: BundleLocation,
}

impl ResolvedManifest {
    /// Parse a raw manifest document and validate it against the requested id
    pub fn from_document(
        requested_id: &str,
        document: &[u8],
        bundle: BundleLocation,
    ) -> PluginResult<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(document).map_err(|source| PluginError::ManifestParse {
                plugin_id: requested_id.to_string(),
                source,
            })?;

        let manifest: PluginManifest =
            serde_json::from_value(value).map_err(|e| PluginError::ManifestValidation {
                plugin_id: requested_id.to_string(),
                reason: format!("manifest does not match the expected schema: {e}"),
            })?;

        Self::validate(requested_id, manifest, bundle)
    }

    /// Check the required fields of an already-parsed manifest
    pub fn validate(
        requested_id: &str,
        manifest: PluginManifest,
        bundle: BundleLocation,
    ) -> PluginResult<Self> {
        let invalid = |reason: &str| PluginError::ManifestValidation {
            plugin_id: requested_id.to_string(),
            reason: reason.to_string(),
        };

        if manifest.id.trim().is_empty() || manifest.name.trim().is_empty() {
            return Err(invalid("manifest id and name cannot be empty"));
        }

        if manifest.id != requested_id {
            return Err(PluginError::ManifestValidation {
                plugin_id: requested_id.to_string(),
                reason: format!("manifest declares id '{}'", manifest.id),
            });
        }

        let worker = match &manifest.worker {
            Some(worker) if !worker.entry_point.trim().is_empty() => worker.clone(),
            Some(_) => return Err(invalid("worker.entryPoint cannot be empty")),
            None => return Err(invalid("missing required worker.entryPoint")),
        };

        Ok(Self {
            manifest,
            worker,
            bundle,
        })
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn worker(&self) -> &WorkerEntry {
        &self.worker
    }

    pub fn bundle(&self) -> &BundleLocation {
        &self.bundle
    }

    pub fn into_manifest(self) -> PluginManifest {
        self.manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> BundleLocation {
        BundleLocation::Directory(PathBuf::from("/plugins/counter-plugin"))
    }

    #[test]
    fn deserialize_full_manifest() {
        let json = r#"{
            "id": "counter-plugin",
            "name": "Counter",
            "description": "Counts things",
            "version": "1.2.0",
            "ui": { "entryPoint": "ui/index.js" },
            "background": { "entryPoint": "background.js" },
            "worker": { "entryPoint": "builtin:counter" },
            "settings": { "incrementBy": 2 }
        }"#;

        let resolved =
            ResolvedManifest::from_document("counter-plugin", json.as_bytes(), bundle())
                .expect("valid manifest");
        let manifest = resolved.manifest();
        assert_eq!(manifest.name, "Counter");
        assert_eq!(manifest.version.as_deref(), Some("1.2.0"));
        assert!(manifest.has_ui());
        assert!(manifest.has_background());
        assert_eq!(manifest.settings["incrementBy"], 2);
        assert_eq!(resolved.worker().builtin_name(), Some("counter"));
    }

    #[test]
    fn deserialize_minimal_manifest() {
        let json = r#"{"id":"p","name":"P","worker":{"entryPoint":"bin/worker"}}"#;

        let resolved = ResolvedManifest::from_document("p", json.as_bytes(), bundle()).unwrap();
        assert!(!resolved.manifest().has_ui());
        assert!(!resolved.manifest().has_background());
        assert!(resolved.manifest().settings.is_empty());
        assert!(resolved.worker().args.is_empty());
        assert_eq!(resolved.worker().builtin_name(), None);
    }

    #[test]
    fn missing_worker_is_validation_error() {
        let json = r#"{"id":"example-plugin","name":"Example","ui":{"entryPoint":"ui.js"}}"#;

        let err = ResolvedManifest::from_document("example-plugin", json.as_bytes(), bundle())
            .unwrap_err();
        assert!(matches!(err, PluginError::ManifestValidation { .. }));
        assert!(err.to_string().contains("worker.entryPoint"));
    }

    #[test]
    fn empty_worker_entry_is_validation_error() {
        let json = r#"{"id":"p","name":"P","worker":{"entryPoint":"  "}}"#;

        let err = ResolvedManifest::from_document("p", json.as_bytes(), bundle()).unwrap_err();
        assert!(matches!(err, PluginError::ManifestValidation { .. }));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = ResolvedManifest::from_document("p", b"{ not json", bundle()).unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse { .. }));
        assert_eq!(err.plugin_id(), "p");
    }

    #[test]
    fn invalid_utf8_is_parse_error() {
        let document = b"{\"id\":\"p\",\"name\":\"\xff\xfe\"}";

        let err = ResolvedManifest::from_document("p", document, bundle()).unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse { .. }));
    }

    #[test]
    fn schema_mismatch_is_validation_error() {
        let json = r#"{"id":"p","worker":{"entryPoint":"builtin:example"}}"#;

        let err = ResolvedManifest::from_document("p", json.as_bytes(), bundle()).unwrap_err();
        assert!(matches!(err, PluginError::ManifestValidation { .. }));
    }

    #[test]
    fn mismatched_id_is_validation_error() {
        let json = r#"{"id":"other","name":"Other","worker":{"entryPoint":"builtin:example"}}"#;

        let err = ResolvedManifest::from_document("p", json.as_bytes(), bundle()).unwrap_err();
        assert!(err.to_string().contains("declares id 'other'"));
    }

    #[test]
    fn serializes_in_camel_case() {
        let manifest = PluginManifest::placeholder("ghost");
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"entryPoint\":\"builtin:fallback\""));
        assert!(!json.contains("description"));
    }
}
