//! Manifest resolution and bundle discovery

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::{debug, warn};

use crate::manifest::{BundleLocation, ResolvedManifest};
use crate::{PluginError, PluginResult};

/// File name of a bundle's manifest
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Default cap on manifest size
pub const DEFAULT_MAX_MANIFEST_BYTES: u64 = 64 * 1024;

const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A location that may hold plugin bundles (`<root>/<id>/manifest.json`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateRoot {
    Directory(PathBuf),
    /// Base URL, without trailing slash
    Remote(String),
}

impl CandidateRoot {
    /// Interpret a configured root: `http(s)://` prefixes are remote,
    /// everything else is a local directory.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Remote(raw.trim_end_matches('/').to_string())
        } else {
            Self::Directory(PathBuf::from(raw))
        }
    }
}

impl std::fmt::Display for CandidateRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Directory(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

/// Retrieves and validates plugin manifests.
///
/// Candidates are tried in order: the first is the primary location, the
/// rest are alternates consulted only when retrieval from the previous one
/// fails. A document that was found but does not parse or validate stops
/// the search.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    candidates: Vec<CandidateRoot>,
    max_manifest_bytes: u64,
    http: reqwest::Client,
}

impl ManifestResolver {
    pub fn new(candidates: Vec<CandidateRoot>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REMOTE_FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            candidates,
            max_manifest_bytes: DEFAULT_MAX_MANIFEST_BYTES,
            http,
        }
    }

    pub fn with_max_manifest_bytes(mut self, max_manifest_bytes: u64) -> Self {
        self.max_manifest_bytes = max_manifest_bytes;
        self
    }

    pub fn candidates(&self) -> &[CandidateRoot] {
        &self.candidates
    }

    /// Retrieve, parse and validate the manifest for `plugin_id`
    pub async fn resolve(&self, plugin_id: &str) -> PluginResult<ResolvedManifest> {
        if !is_valid_plugin_id(plugin_id) {
            return Err(PluginError::ManifestValidation {
                plugin_id: plugin_id.to_string(),
                reason: "plugin id must be a single non-empty path segment".to_string(),
            });
        }

        let mut attempts = Vec::with_capacity(self.candidates.len());

        for candidate in &self.candidates {
            match self.retrieve(candidate, plugin_id).await {
                Ok((document, bundle)) => {
                    debug!(plugin_id = %plugin_id, bundle = %bundle, "Retrieved manifest");
                    return ResolvedManifest::from_document(plugin_id, &document, bundle);
                }
                Err(e) => {
                    let reason = format!("{candidate}: {e:#}");
                    debug!(plugin_id = %plugin_id, reason = %reason, "Manifest candidate unavailable");
                    attempts.push(reason);
                }
            }
        }

        if attempts.is_empty() {
            attempts.push("no candidate locations configured".to_string());
        }

        Err(PluginError::ManifestRetrieval {
            plugin_id: plugin_id.to_string(),
            attempts,
        })
    }

    /// List plugin ids found in local candidate roots.
    ///
    /// A bundle is any immediate subdirectory holding a `manifest.json`.
    /// Remote roots cannot be listed and are skipped.
    pub async fn discover(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();

        for candidate in &self.candidates {
            let CandidateRoot::Directory(root) = candidate else {
                continue;
            };

            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(path = %root.display(), error = %e, "Plugin directory not readable, skipping");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %root.display(), error = %e, "Failed to read plugin directory entry");
                        break;
                    }
                };

                let path = entry.path();
                if !tokio::fs::metadata(path.join(MANIFEST_FILE_NAME))
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false)
                {
                    continue;
                }

                if let Some(id) = path.file_name().and_then(|n| n.to_str()) {
                    debug!(plugin_id = %id, path = %path.display(), "Discovered plugin bundle");
                    ids.insert(id.to_string());
                }
            }
        }

        ids.into_iter().collect()
    }

    async fn retrieve(
        &self,
        candidate: &CandidateRoot,
        plugin_id: &str,
    ) -> anyhow::Result<(Vec<u8>, BundleLocation)> {
        match candidate {
            CandidateRoot::Directory(root) => {
                let bundle_dir = root.join(plugin_id);
                let document = self.read_local(&bundle_dir.join(MANIFEST_FILE_NAME)).await?;
                Ok((document, BundleLocation::Directory(bundle_dir)))
            }
            CandidateRoot::Remote(base) => {
                let url = format!("{base}/{plugin_id}/{MANIFEST_FILE_NAME}");
                let document = self.fetch_remote(&url).await?;
                Ok((document, BundleLocation::Remote(url)))
            }
        }
    }

    async fn read_local(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?;

        if !metadata.is_file() {
            return Err(anyhow!("{} is not a regular file", path.display()));
        }
        if metadata.len() > self.max_manifest_bytes {
            return Err(anyhow!(
                "manifest too large: {} bytes (limit {})",
                metadata.len(),
                self.max_manifest_bytes
            ));
        }

        tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))
    }

    /// Fetch `url`, streaming the body so a response without a
    /// `Content-Length` cannot exceed the size cap.
    async fn fetch_remote(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()?;

        if response
            .content_length()
            .is_some_and(|len| len > self.max_manifest_bytes)
        {
            return Err(anyhow!("manifest too large (limit {})", self.max_manifest_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("failed to read response body")?
        {
            if (body.len() + chunk.len()) as u64 > self.max_manifest_bytes {
                return Err(anyhow!("manifest too large (limit {})", self.max_manifest_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

fn is_valid_plugin_id(id: &str) -> bool {
    !id.trim().is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
}
