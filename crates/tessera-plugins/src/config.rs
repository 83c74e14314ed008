//! Host configuration with file persistence

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::resolver::{CandidateRoot, DEFAULT_MAX_MANIFEST_BYTES};

pub const CONFIG_DIR_ENV: &str = "TESSERA_CONFIG_DIR";
pub const PLUGIN_DIR_ENV: &str = "TESSERA_PLUGIN_DIR";
pub const STRICT_PLUGINS_ENV: &str = "TESSERA_STRICT_PLUGINS";

/// Tessera host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub plugins: PluginsConfig,
    pub handshake: HandshakeConfig,
    pub loading: LoadingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub layout: DeploymentLayout,
    /// Candidate roots tried in order; empty means the layout defaults
    pub dirs: Vec<String>,
    /// Extra directories searched for worker executables
    pub search_roots: Vec<PathBuf>,
    pub policy: LoadPolicy,
    pub max_manifest_bytes: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            layout: DeploymentLayout::default(),
            dirs: Vec::new(),
            search_roots: Vec::new(),
            policy: LoadPolicy::default(),
            max_manifest_bytes: DEFAULT_MAX_MANIFEST_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub timeout_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    /// Load batches concurrently instead of one id at a time
    pub concurrent: bool,
}

/// Where bundles live relative to the host binary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentLayout {
    Packaged,
    #[default]
    Development,
}

/// What to do when a plugin fails to load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPolicy {
    /// Every failure propagates
    Strict,
    /// Recoverable failures are replaced by a fallback instance
    #[default]
    Permissive,
}

impl std::fmt::Display for LoadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::Permissive => f.write_str("permissive"),
        }
    }
}

impl std::fmt::Display for DeploymentLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Packaged => f.write_str("packaged"),
            Self::Development => f.write_str("development"),
        }
    }
}

impl HostConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("tessera")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the config file (or defaults when absent), then apply
    /// environment overrides
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_overrides(
            env::var(PLUGIN_DIR_ENV).ok().as_deref(),
            env::var(STRICT_PLUGINS_ENV).ok().as_deref(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Load only what the config file says, or defaults if it doesn't exist
    pub fn load_file() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            // Return default config without creating file
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = dir.join("config.toml");
        fs::write(&path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(path)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Apply values normally taken from the environment
    pub fn apply_overrides(&mut self, plugin_dir: Option<&str>, strict: Option<&str>) {
        if let Some(dir) = plugin_dir.map(str::trim).filter(|dir| !dir.is_empty()) {
            if self.plugins.dirs.is_empty() {
                self.plugins.dirs = self
                    .candidate_roots()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
            }
            self.plugins.dirs.insert(0, dir.to_string());
        }

        if let Some(flag) = strict {
            match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.plugins.policy = LoadPolicy::Strict,
                "0" | "false" | "no" | "off" => self.plugins.policy = LoadPolicy::Permissive,
                _ => {}
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handshake.timeout_secs == 0 {
            bail!("handshake.timeout_secs must be greater than zero");
        }
        if self.plugins.max_manifest_bytes == 0 {
            bail!("plugins.max_manifest_bytes must be greater than zero");
        }
        if self.plugins.dirs.iter().any(|dir| dir.trim().is_empty()) {
            bail!("plugins.dirs cannot contain empty entries");
        }
        Ok(())
    }

    /// Candidate manifest roots, primary first
    pub fn candidate_roots(&self) -> Vec<CandidateRoot> {
        if !self.plugins.dirs.is_empty() {
            return self
                .plugins
                .dirs
                .iter()
                .map(|dir| CandidateRoot::parse(dir))
                .collect();
        }

        let mut roots = Vec::new();
        match self.plugins.layout {
            DeploymentLayout::Development => {
                roots.push(CandidateRoot::Directory(PathBuf::from("plugins")));
                if let Ok(dir) = Self::config_dir() {
                    roots.push(CandidateRoot::Directory(dir.join("plugins")));
                }
            }
            DeploymentLayout::Packaged => {
                if let Some(dir) = dirs::data_dir() {
                    roots.push(CandidateRoot::Directory(dir.join("tessera").join("plugins")));
                }
                if let Some(dir) = env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(|parent| parent.join("plugins")))
                {
                    roots.push(CandidateRoot::Directory(dir));
                }
            }
        }
        roots
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake.timeout_secs)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "plugins.layout" => Ok(self.plugins.layout.to_string()),
            "plugins.dirs" => Ok(self.plugins.dirs.join(", ")),
            "plugins.search_roots" => Ok(self
                .plugins
                .search_roots
                .iter()
                .map(|root| root.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")),
            "plugins.policy" => Ok(self.plugins.policy.to_string()),
            "plugins.max_manifest_bytes" => Ok(self.plugins.max_manifest_bytes.to_string()),
            "handshake.timeout_secs" => Ok(self.handshake.timeout_secs.to_string()),
            "loading.concurrent" => Ok(self.loading.concurrent.to_string()),
            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `tessera config show` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "plugins.layout" => {
                self.plugins.layout = match value {
                    "packaged" => DeploymentLayout::Packaged,
                    "development" => DeploymentLayout::Development,
                    _ => bail!("Invalid layout: {}. Must be packaged or development", value),
                };
            }
            "plugins.dirs" => {
                self.plugins.dirs = split_list(value);
            }
            "plugins.search_roots" => {
                self.plugins.search_roots = split_list(value).into_iter().map(PathBuf::from).collect();
            }
            "plugins.policy" => {
                self.plugins.policy = match value {
                    "strict" => LoadPolicy::Strict,
                    "permissive" => LoadPolicy::Permissive,
                    _ => bail!("Invalid policy: {}. Must be strict or permissive", value),
                };
            }
            "plugins.max_manifest_bytes" => {
                self.plugins.max_manifest_bytes = value
                    .parse()
                    .with_context(|| format!("Invalid byte count: {}", value))?;
            }
            "handshake.timeout_secs" => {
                self.handshake.timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid timeout value: {}", value))?;
            }
            "loading.concurrent" => {
                self.loading.concurrent = value
                    .parse()
                    .with_context(|| format!("Invalid boolean value: {}", value))?;
            }
            _ => bail!(
                "Unknown configuration key: {}. Use `tessera config show` to see available keys.",
                key
            ),
        }

        self.validate()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
