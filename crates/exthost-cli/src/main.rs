//! CLI entry point for exthost.
//!
//! The `exthost` binary discovers a directory of extension packages and
//! either reports on them (`list`, `order`), runs them with hot reload until
//! Ctrl-C (`run`), or edits the persisted disabled set (`enable`,
//! `disable`).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use exthost_extensions::config::{CONFIG_ENV, EXTENSIONS_DIR_ENV};
use exthost_extensions::{
    ConfigSource, ExtensionAnalysis, ExtensionManager, ExtensionSummary, FileConfigSource,
    analyze, discover_extensions,
};
use exthost_kernel::DependencyReport;
use exthost_sandbox::{SandboxConfig, WasmModuleLoader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// exthost: an extension host with dependency-ordered activation.
#[derive(Parser)]
#[command(
    name = "exthost",
    version,
    about = "Extension host with dependency-ordered activation and hot reload",
    long_about = "Discovers extension packages, activates them in dependency order under \
                  a timeout, and reloads any one of them when its files change."
)]
struct Cli {
    /// Configuration file (TOML, or JSON by extension).
    /// Falls back to $EXTHOST_CONFIG, then `exthost.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory of user-installed extension packages.
    /// Falls back to $EXTHOST_EXTENSIONS_DIR, then `extensions`.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Directory of built-in packages, which cannot be removed.
    #[arg(long, global = true)]
    builtin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze every package and show its dependency status.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the activation order.
    Order,

    /// Activate every extension and keep running until Ctrl-C.
    Run {
        /// Fuel granted to each WebAssembly guest call.
        #[arg(long)]
        max_fuel: Option<u64>,
    },

    /// Remove an extension from the disabled set.
    Enable { id: String },

    /// Add an extension to the disabled set.
    Disable { id: String },
}

struct Locations {
    config: PathBuf,
    dir: PathBuf,
    builtin_dir: Option<PathBuf>,
}

impl Locations {
    fn resolve(cli: &Cli) -> Self {
        let from_env = |name: &str, fallback: &str| {
            std::env::var_os(name)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(fallback))
        };
        Self {
            config: cli
                .config
                .clone()
                .unwrap_or_else(|| from_env(CONFIG_ENV, "exthost.toml")),
            dir: cli
                .dir
                .clone()
                .unwrap_or_else(|| from_env(EXTENSIONS_DIR_ENV, "extensions")),
            builtin_dir: cli.builtin_dir.clone(),
        }
    }

    /// Package roots with their `removable` flag, built-ins first.
    async fn package_roots(&self) -> Result<Vec<(PathBuf, bool)>> {
        let mut roots = Vec::new();
        if let Some(builtin) = &self.builtin_dir {
            for root in discover_extensions(builtin)
                .await
                .with_context(|| format!("failed to scan {}", builtin.display()))?
            {
                roots.push((root, false));
            }
        }
        for root in discover_extensions(&self.dir)
            .await
            .with_context(|| format!("failed to scan {}", self.dir.display()))?
        {
            roots.push((root, true));
        }
        Ok(roots)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let locations = Locations::resolve(&cli);

    match cli.command {
        Commands::List { json } => cmd_list(&locations, json).await,
        Commands::Order => cmd_order(&locations).await,
        Commands::Run { max_fuel } => cmd_run(&locations, max_fuel).await,
        Commands::Enable { id } => cmd_set_disabled(&locations, &id, false),
        Commands::Disable { id } => cmd_set_disabled(&locations, &id, true),
    }
}

fn load_config(locations: &Locations) -> Result<Arc<FileConfigSource>> {
    let source = FileConfigSource::load(&locations.config)
        .with_context(|| format!("failed to load {}", locations.config.display()))?;
    Ok(Arc::new(source))
}

/// Analyze every package without starting a runtime.
///
/// Later packages reusing an id are dropped, matching what `run` loads.
async fn analyze_packages(locations: &Locations) -> Result<Vec<ExtensionAnalysis>> {
    let mut analyses = Vec::new();
    for (root, removable) in locations.package_roots().await? {
        analyses.push(analyze(&root, removable).await);
    }
    Ok(first_per_id(analyses))
}

fn first_per_id(analyses: Vec<ExtensionAnalysis>) -> Vec<ExtensionAnalysis> {
    let mut seen = HashSet::new();
    analyses
        .into_iter()
        .filter(|analysis| {
            let first = seen.insert(analysis.id.clone());
            if !first {
                warn!(
                    extension_id = %analysis.id,
                    path = %analysis.path.display(),
                    "duplicate extension id, skipping"
                );
            }
            first
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Subcommand: list / order
// ---------------------------------------------------------------------------

async fn cmd_list(locations: &Locations, json: bool) -> Result<()> {
    init_tracing("warn");

    let host = load_config(locations)?.host_config();
    let (valid, broken): (Vec<_>, Vec<_>) = analyze_packages(locations)
        .await?
        .into_iter()
        .partition(|analysis| analysis.error.is_none());
    let report = DependencyReport::build(&valid, host.strict_cycle_detection);

    let mut rows = Vec::new();
    for analysis in &valid {
        let status = if host.disabled.contains(&analysis.id) {
            "disabled".to_string()
        } else if !report.missing_for(&analysis.id).is_empty() {
            format!("missing: {}", report.missing_for(&analysis.id).join(", "))
        } else if !report.circular_for(&analysis.id).is_empty() {
            format!("cycle: {}", report.circular_for(&analysis.id).join(", "))
        } else {
            "ok".to_string()
        };
        rows.push(serde_json::json!({
            "id": analysis.id,
            "version": analysis.manifest.version,
            "removable": analysis.removable,
            "path": analysis.path,
            "status": status,
        }));
    }
    for analysis in &broken {
        rows.push(serde_json::json!({
            "id": analysis.id,
            "version": null,
            "removable": analysis.removable,
            "path": analysis.path,
            "status": format!("error: {}", analysis.error.as_deref().unwrap_or("unknown")),
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No extensions found in {}", locations.dir.display());
        return Ok(());
    }
    println!("{:<32} {:<10} {}", "ID", "VERSION", "STATUS");
    for row in &rows {
        println!(
            "{:<32} {:<10} {}",
            row["id"].as_str().unwrap_or_default(),
            row["version"].as_str().unwrap_or("-"),
            row["status"].as_str().unwrap_or_default(),
        );
    }
    Ok(())
}

async fn cmd_order(locations: &Locations) -> Result<()> {
    init_tracing("warn");

    let strict = load_config(locations)?.host_config().strict_cycle_detection;
    let valid: Vec<_> = analyze_packages(locations)
        .await?
        .into_iter()
        .filter(|analysis| analysis.error.is_none())
        .collect();
    let report = DependencyReport::build(&valid, strict);

    for (position, id) in report.order.iter().enumerate() {
        println!("{:>3}. {id}", position + 1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(locations: &Locations, max_fuel: Option<u64>) -> Result<()> {
    init_tracing("info");

    let config = load_config(locations)?;
    let mut sandbox = SandboxConfig::default();
    if let Some(fuel) = max_fuel {
        sandbox = sandbox.with_max_fuel(fuel);
    }
    let loader = WasmModuleLoader::new(sandbox).context("failed to start wasm runtime")?;
    let manager = ExtensionManager::builder(config, Arc::new(loader)).build();

    info!(dir = %locations.dir.display(), "starting extension host");
    let records = manager.analyze_all(locations.package_roots().await?).await;
    let report = manager.load_all(records).await;
    info!(
        started = report.started.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "extension host running, press Ctrl-C to stop"
    );

    for summary in manager.list_extensions() {
        print_summary(&summary);
    }

    let _listener = manager.spawn_reload_listener();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutting down");
    manager.deactivate_all().await;
    Ok(())
}

fn print_summary(summary: &ExtensionSummary) {
    let state = if summary.disabled {
        "disabled".to_string()
    } else {
        summary.state.to_string()
    };
    match &summary.error {
        Some(error) => println!("  {:<32} {:<10} {error}", summary.id, state),
        None => match summary.activation_ms {
            Some(ms) => println!("  {:<32} {:<10} {ms}ms", summary.id, state),
            None => println!("  {:<32} {state}", summary.id),
        },
    }
}

// ---------------------------------------------------------------------------
// Subcommand: enable / disable
// ---------------------------------------------------------------------------

fn cmd_set_disabled(locations: &Locations, id: &str, disabled: bool) -> Result<()> {
    init_tracing("warn");

    let config = load_config(locations)?;
    let mut ids = config.disabled_ids();
    ids.retain(|existing| existing != id);
    if disabled {
        ids.push(id.to_string());
    }
    ids.sort();
    config
        .set_disabled_ids(ids)
        .with_context(|| format!("failed to write {}", locations.config.display()))?;

    let verb = if disabled { "Disabled" } else { "Enabled" };
    println!("{verb} {id} in {}", locations.config.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
