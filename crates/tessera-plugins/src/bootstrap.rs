//! Execution-unit bootstrap

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use tracing::{debug, info};

use crate::manifest::{BundleLocation, ResolvedManifest, WorkerEntry};
use crate::rpc::RpcProxy;
use crate::unit::{self, ExecutionUnit};
use crate::worker::WorkerCatalog;
use crate::{PluginError, PluginResult};

/// Turns a validated manifest into a running execution unit
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    catalog: WorkerCatalog,
    search_roots: Vec<PathBuf>,
}

impl Default for Bootstrapper {
    fn default() -> Self {
        Self::new(WorkerCatalog::with_builtins())
    }
}

impl Bootstrapper {
    pub fn new(catalog: WorkerCatalog) -> Self {
        Self {
            catalog,
            search_roots: Vec::new(),
        }
    }

    /// Extra directories consulted by the permissive path strategy
    pub fn with_search_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.search_roots = roots;
        self
    }

    pub fn catalog(&self) -> &WorkerCatalog {
        &self.catalog
    }

    /// Start the worker described by `resolved`.
    ///
    /// The caller owns the returned unit and is responsible for
    /// terminating it.
    pub async fn bootstrap(
        &self,
        resolved: &ResolvedManifest,
    ) -> PluginResult<(ExecutionUnit, RpcProxy)> {
        let plugin_id = resolved.id();
        let worker = resolved.worker();

        if let Some(name) = worker.builtin_name() {
            let module =
                self.catalog
                    .instantiate(name)
                    .ok_or_else(|| PluginError::ExecutionUnitCreation {
                        plugin_id: plugin_id.to_string(),
                        reason: format!(
                            "no built-in worker named '{name}' (available: {})",
                            self.catalog.names().join(", ")
                        ),
                    })?;
            info!(plugin_id, worker = name, "Starting built-in worker");
            return Ok(unit::spawn_inline(plugin_id, module));
        }

        let bundle_dir = match resolved.bundle() {
            BundleLocation::Directory(dir) => Some(dir.as_path()),
            BundleLocation::Remote(_) => None,
        };

        let primary = match bundle_dir {
            Some(dir) => {
                let dir = dir.to_path_buf();
                let entry = worker.entry_point.clone();
                resolve_blocking(move || resolve_bundle_relative(&dir, &entry)).await
            }
            None => Err(anyhow!("bundle {} is not a local directory", resolved.bundle())),
        }
        .and_then(|program| self.spawn(plugin_id, &program, worker, bundle_dir));

        let primary_err = match primary {
            Ok(pair) => return Ok(pair),
            Err(e) => e,
        };
        let reason = format!("{primary_err:#}");
        debug!(
            plugin_id,
            reason = %reason,
            "Bundle-relative worker resolution failed, trying permissive resolution"
        );

        let entry = worker.entry_point.clone();
        let search_roots = self.search_roots.clone();
        resolve_blocking(move || resolve_permissive(&entry, &search_roots))
            .await
            .and_then(|program| self.spawn(plugin_id, &program, worker, bundle_dir))
            .map_err(|secondary_err| PluginError::ExecutionUnitCreation {
                plugin_id: plugin_id.to_string(),
                reason: format!("bundle-relative: {reason}; permissive: {secondary_err:#}"),
            })
    }

    fn spawn(
        &self,
        plugin_id: &str,
        program: &Path,
        worker: &WorkerEntry,
        working_dir: Option<&Path>,
    ) -> anyhow::Result<(ExecutionUnit, RpcProxy)> {
        unit::spawn_process(plugin_id, program, &worker.args, working_dir)
    }
}

/// Run a filesystem-bound path resolution on the blocking pool
async fn resolve_blocking<F>(resolve: F) -> anyhow::Result<PathBuf>
where
    F: FnOnce() -> anyhow::Result<PathBuf> + Send + 'static,
{
    tokio::task::spawn_blocking(resolve)
        .await
        .context("worker path resolution did not complete")?
}

/// Resolve `entry` inside `bundle_dir`, rejecting symlinks and escapes
fn resolve_bundle_relative(bundle_dir: &Path, entry: &str) -> anyhow::Result<PathBuf> {
    let base = bundle_dir
        .canonicalize()
        .with_context(|| format!("bundle directory {}", bundle_dir.display()))?;
    let joined = base.join(entry);

    let metadata = fs::symlink_metadata(&joined)
        .with_context(|| format!("worker {}", joined.display()))?;
    if metadata.file_type().is_symlink() {
        bail!("worker {} is a symlink", joined.display());
    }

    let target = joined
        .canonicalize()
        .with_context(|| format!("worker {}", joined.display()))?;
    if !target.starts_with(&base) {
        bail!(
            "worker {} resolves outside the bundle directory {}",
            target.display(),
            base.display()
        );
    }
    if !target.is_file() {
        bail!("worker {} is not a regular file", target.display());
    }

    Ok(target)
}

/// Resolve `entry` as given, then against each search root
fn resolve_permissive(entry: &str, search_roots: &[PathBuf]) -> anyhow::Result<PathBuf> {
    let entry_path = Path::new(entry);
    let mut candidates = vec![entry_path.to_path_buf()];
    if entry_path.is_relative() {
        candidates.extend(search_roots.iter().map(|root| root.join(entry_path)));
    }

    for candidate in &candidates {
        if candidate.is_file() {
            return std::path::absolute(candidate)
                .with_context(|| format!("worker {}", candidate.display()));
        }
    }

    Err(anyhow!(
        "{entry} not found in {} location(s)",
        candidates.len()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcError;
    use crate::manifest::PluginManifest;
    use tempfile::TempDir;

    fn resolved(id: &str, entry: &str, bundle: BundleLocation) -> ResolvedManifest {
        let mut manifest = PluginManifest::placeholder(id);
        manifest.worker = Some(WorkerEntry {
            entry_point: entry.to_string(),
            args: Vec::new(),
        });
        ResolvedManifest::validate(id, manifest, bundle).unwrap()
    }

    #[tokio::test]
    async fn builtin_entries_spawn_inline() {
        let bootstrapper = Bootstrapper::default();
        let manifest = resolved(
            "counter-plugin",
            "builtin:counter",
            BundleLocation::Remote("https://plugins.example/counter-plugin".into()),
        );

        let (unit, proxy) = bootstrapper.bootstrap(&manifest).await.unwrap();
        assert_eq!(unit.kind(), unit::UnitKind::Inline);
        assert!(proxy.get_data().await.unwrap().get("count").is_some());
        unit.terminate();
    }

    #[tokio::test]
    async fn unknown_builtin_fails_creation() {
        let bootstrapper = Bootstrapper::default();
        let manifest = resolved(
            "p",
            "builtin:nope",
            BundleLocation::Directory(PathBuf::from("/tmp")),
        );

        let err = bootstrapper.bootstrap(&manifest).await.unwrap_err();
        assert!(matches!(err, PluginError::ExecutionUnitCreation { .. }));
        assert!(err.to_string().contains("available: counter, example"));
    }

    #[tokio::test]
    async fn missing_executable_names_both_strategies() {
        let bundle = TempDir::new().unwrap();
        let manifest = resolved(
            "p",
            "bin/worker",
            BundleLocation::Directory(bundle.path().to_path_buf()),
        );

        let err = Bootstrapper::default()
            .bootstrap(&manifest)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bundle-relative"));
        assert!(message.contains("permissive"));
    }

    #[test]
    fn bundle_relative_rejects_escapes() {
        let root = TempDir::new().unwrap();
        let bundle = root.path().join("bundle");
        fs::create_dir(&bundle).unwrap();
        fs::write(root.path().join("outside.sh"), "#!/bin/sh\n").unwrap();

        let err = resolve_bundle_relative(&bundle, "../outside.sh").unwrap_err();
        assert!(err.to_string().contains("outside the bundle"));
    }

    #[cfg(unix)]
    #[test]
    fn bundle_relative_rejects_symlinks() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("real.sh");
        fs::write(&target, "#!/bin/sh\n").unwrap();
        std::os::unix::fs::symlink(&target, root.path().join("link.sh")).unwrap();

        let err = resolve_bundle_relative(root.path(), "link.sh").unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }

    #[test]
    fn bundle_relative_accepts_contained_files() {
        let bundle = TempDir::new().unwrap();
        fs::create_dir(bundle.path().join("bin")).unwrap();
        fs::write(bundle.path().join("bin/worker"), "").unwrap();

        let path = resolve_bundle_relative(bundle.path(), "bin/worker").unwrap();
        assert!(path.ends_with("bin/worker"));
    }

    #[tokio::test]
    async fn blocking_resolution_reports_panics() {
        let err = resolve_blocking(|| panic!("lost the filesystem"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not complete"));

        let path = resolve_blocking(|| Ok(PathBuf::from("/bin/sh"))).await.unwrap();
        assert_eq!(path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn permissive_consults_search_roots() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("shared-worker"), "").unwrap();

        let path = resolve_permissive("shared-worker", &[root.path().to_path_buf()]).unwrap();
        assert!(path.ends_with("shared-worker"));
        assert!(resolve_permissive("shared-worker", &[]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn permissive_strategy_spawns_absolute_entries() {
        let bundle = TempDir::new().unwrap();
        let mut manifest = PluginManifest::placeholder("shell");
        manifest.worker = Some(WorkerEntry {
            entry_point: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
        });
        let manifest = ResolvedManifest::validate(
            "shell",
            manifest,
            BundleLocation::Directory(bundle.path().to_path_buf()),
        )
        .unwrap();

        let (unit, proxy) = Bootstrapper::default().bootstrap(&manifest).await.unwrap();
        assert_eq!(unit.kind(), unit::UnitKind::Process);
        assert!(!proxy.is_closed());

        unit.terminate();
        assert!(matches!(proxy.get_data().await, Err(RpcError::Closed)));
    }
}
