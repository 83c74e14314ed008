//! Tessera CLI - plugin host

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tessera_plugins::protocol::serve_stdio;
use tessera_plugins::{
    HostConfig, LoadPolicy, PluginError, PluginInstance, PluginLoader, PluginRegistry,
    WorkerCatalog,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about = "Plugin host with isolated workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    host: HostArgs,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Overrides applied on top of the config file and environment
#[derive(Args, Debug, Clone, Default)]
struct HostArgs {
    /// Plugin root (directory or http(s) URL); repeat to add alternates.
    /// Replaces the configured roots.
    #[arg(long = "plugin-dir", global = true, value_name = "DIR")]
    plugin_dirs: Vec<String>,

    /// Fail instead of substituting fallback plugins
    #[arg(long, global = true)]
    strict: bool,

    /// Handshake deadline in seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Load batches concurrently
    #[arg(long, global = true)]
    concurrent: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Load plugins, report their state, then unload them
    Load {
        /// Plugin ids (defaults to every discovered bundle)
        ids: Vec<String>,
    },

    /// Load one plugin and invoke a method on it
    Call {
        /// Plugin id
        id: String,
        /// Method name (e.g. getData, incrementCounter)
        method: String,
        /// JSON parameters
        #[arg(long, default_value = "null")]
        params: String,
    },

    /// List discovered plugin bundles
    List,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Serve a built-in worker over stdio
    #[command(hide = true)]
    Worker {
        /// Built-in worker name
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// Show config file path
    Path,
}

impl HostArgs {
    fn apply(&self, mut config: HostConfig) -> anyhow::Result<HostConfig> {
        if !self.plugin_dirs.is_empty() {
            config.plugins.dirs = self.plugin_dirs.clone();
        }
        if self.strict {
            config.plugins.policy = LoadPolicy::Strict;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            config.handshake.timeout_secs = timeout_secs;
        }
        if self.concurrent {
            config.loading.concurrent = true;
        }
        config.validate()?;
        Ok(config)
    }

    fn config(&self) -> anyhow::Result<HostConfig> {
        self.apply(HostConfig::load()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output and the worker protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tessera=info".parse()?)
                .add_directive("tessera_plugins=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Load { ids } => cmd_load(&cli.host, ids, cli.format, cli.quiet).await,

        Commands::Call { id, method, params } => {
            cmd_call(&cli.host, &id, &method, &params, cli.format).await
        }

        Commands::List => cmd_list(&cli.host, cli.format, cli.quiet).await,

        Commands::Config { action } => cmd_config(&cli.host, action, cli.quiet),

        Commands::Worker { name } => cmd_worker(&name).await,
    }
}

fn build_loader(config: &HostConfig) -> PluginLoader {
    PluginLoader::from_config(config, Arc::new(PluginRegistry::new()))
}

/// Summary of a loaded instance, including a live `getData` snapshot
async fn describe(instance: &PluginInstance) -> Value {
    let data = match instance.proxy().get_data().await {
        Ok(data) => data,
        Err(e) => {
            warn!(plugin_id = %instance.id(), error = %e, "getData failed");
            json!({ "error": e.to_string() })
        }
    };

    json!({
        "id": instance.id(),
        "name": instance.name(),
        "unit": instance.unit().kind().to_string(),
        "fallback": instance.is_fallback(),
        "ui": instance.has_ui(),
        "background": instance.has_background(),
        "data": data,
    })
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn print_report(report: &Value) {
    println!(
        "{} ({}) [{}]",
        report["id"].as_str().unwrap_or_default(),
        report["name"].as_str().unwrap_or_default(),
        report["unit"].as_str().unwrap_or_default()
    );
    println!(
        "  ui: {}  background: {}  fallback: {}",
        yes_no(report["ui"].as_bool().unwrap_or(false)),
        yes_no(report["background"].as_bool().unwrap_or(false)),
        yes_no(report["fallback"].as_bool().unwrap_or(false))
    );
    println!("  data: {}", report["data"]);
}

async fn cmd_load(
    host: &HostArgs,
    ids: Vec<String>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = host.config()?;
    let loader = build_loader(&config);

    let ids = if ids.is_empty() {
        loader.discover_plugin_ids().await
    } else {
        ids
    };
    if ids.is_empty() {
        if !quiet {
            println!("No plugins found.");
        }
        return Ok(());
    }

    let loaded = if config.loading.concurrent {
        loader.load_all_plugins_concurrent(ids.as_slice()).await
    } else {
        loader.load_all_plugins(ids.as_slice()).await
    };

    let mut reports = Vec::with_capacity(loaded.len());
    for instance in &loaded {
        reports.push(describe(instance).await);
    }

    match format {
        OutputFormat::Json => {
            let output = json!({
                "requested": ids,
                "loaded": reports.len(),
                "plugins": reports,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            for report in &reports {
                print_report(report);
            }
            if !quiet {
                println!();
                println!("Loaded {}/{} plugin(s)", reports.len(), ids.len());
            }
        }
    }

    let unloaded = loader.unload_all_plugins();
    info!(unloaded, "Plugins unloaded");

    if loaded.is_empty() {
        bail!("None of the requested plugins could be loaded");
    }
    Ok(())
}

async fn cmd_call(
    host: &HostArgs,
    id: &str,
    method: &str,
    params: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params)
        .with_context(|| format!("Invalid --params JSON: {}", params))?;

    let config = host.config()?;
    let loader = build_loader(&config);

    let instance = loader.load_plugin_by_id(id).await.inspect_err(print_suggestion)?;
    let result = instance.proxy().call(method, params).await;
    let fallback = instance.is_fallback();
    loader.unload_all_plugins();

    let value = result.with_context(|| format!("Call to {} on plugin '{}' failed", method, id))?;

    match format {
        OutputFormat::Json => {
            let output = json!({
                "plugin": id,
                "method": method,
                "fallback": fallback,
                "result": value,
            });
            println!("{}", serde_json::to_string(&output)?);
        }
        OutputFormat::Text => {
            if fallback {
                eprintln!("Note: plugin '{}' is running as a fallback instance", id);
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}

fn print_suggestion(error: &PluginError) {
    if let Some(suggestion) = error.suggestion() {
        eprintln!("[{}] Try: {}", error.code(), suggestion);
    }
}

async fn cmd_list(host: &HostArgs, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = host.config()?;
    let ids = build_loader(&config).discover_plugin_ids().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&ids)?),
        OutputFormat::Text => {
            if ids.is_empty() {
                if !quiet {
                    println!("No plugins found.");
                }
            } else {
                for id in &ids {
                    println!("{}", id);
                }
            }
        }
    }
    Ok(())
}

fn cmd_config(host: &HostArgs, action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = host.config()?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Get { key } => {
            let config = host.config()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = HostConfig::load_file()?;
            config.set(&key, &value)?;
            let path = config.save()?;
            if !quiet {
                println!("Set {} = {} ({})", key, value, path.display());
            }
        }
        ConfigAction::Path => {
            let path = HostConfig::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_worker(name: &str) -> anyhow::Result<()> {
    let catalog = WorkerCatalog::with_builtins();
    let module = catalog.instantiate(name).ok_or_else(|| {
        anyhow!(
            "Unknown built-in worker: {} (available: {})",
            name,
            catalog.names().join(", ")
        )
    })?;

    serve_stdio(module).await.context("Worker I/O failed")
}
