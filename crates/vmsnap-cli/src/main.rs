//! # vmsnap CLI
//!
//! Operator tool for the VM snapshot store: save files into the local cache
//! as a snapshot, inspect and restore snapshots, and convert images.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use vmsnap_config::logging::{init_logging, LogLevel};
use vmsnap_config::Config;
use vmsnap_loader::{FileCacheLoader, LoaderOptions, OpContext, StaticGroup};

mod config_cmd;
mod image;
mod snapshot;

/// vmsnap - chunked copy-on-write VM snapshot store
#[derive(Parser)]
#[command(name = "vmsnap")]
#[command(version, about, long_about = None)]
struct Cli {
    /// File cache root (overrides config)
    #[arg(long, global = true, value_name = "DIR")]
    cache_root: Option<PathBuf>,

    /// Key artifacts by content digest so runners can share them
    #[arg(long, global = true, value_name = "BOOL")]
    sharing: Option<bool>,

    /// Group that namespaces cache keys
    #[arg(long, global = true)]
    group: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save files and chunked files into the cache as a snapshot
    Save(snapshot::SaveArgs),

    /// Print a snapshot's manifest
    Show(snapshot::KeyArgs),

    /// Unpack a snapshot into a directory
    Restore(snapshot::RestoreArgs),

    /// Remove a snapshot's manifest and whole-file artifacts from the cache
    Delete(snapshot::KeyArgs),

    /// Convert a filesystem image to chunks, reusing a cached conversion
    Image(image::ImageArgs),

    /// Display cache statistics
    Stats,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: config_cmd::ConfigCommands,
    },
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    let mut config = Config::load().context("Failed to load config")?;
    if let Some(root) = cli.cache_root {
        config.storage.cache_root = root;
    }
    if let Some(sharing) = cli.sharing {
        config.snapshot.enable_local_snapshot_sharing = sharing;
    }
    if let Some(group) = cli.group {
        config.snapshot.group_id = group;
    }

    init_logging(config.logging.level.parse().unwrap_or(LogLevel::Warn));

    match cli.command {
        Commands::Save(args) => {
            let (loader, ctx) = open(&config)?;
            snapshot::save(&loader, &ctx, &config, args)
        }
        Commands::Show(args) => {
            let (loader, ctx) = open(&config)?;
            snapshot::show(&loader, &ctx, &args)
        }
        Commands::Restore(args) => {
            let (loader, ctx) = open(&config)?;
            snapshot::restore(&loader, &ctx, args)
        }
        Commands::Delete(args) => {
            let (loader, ctx) = open(&config)?;
            snapshot::delete(&loader, &ctx, &args)
        }
        Commands::Image(args) => {
            let (loader, ctx) = open(&config)?;
            image::run(loader, &ctx, &config, args)
        }
        Commands::Stats => cmd_stats(&config),
        Commands::Config { command } => config_cmd::run(&config, command),
    }
}

/// Loader and context for the configured cache and group.
fn open(config: &Config) -> Result<(FileCacheLoader, OpContext)> {
    let options = LoaderOptions::from_config(config)
        .with_context(|| format!("Failed to open cache at {}", config.cache_root().display()))?;
    let loader = FileCacheLoader::new(options)?;
    let ctx = OpContext::new().with_group(Arc::new(StaticGroup(config.snapshot.group_id.clone())));
    Ok((loader, ctx))
}

fn cmd_stats(config: &Config) -> Result<()> {
    let root = config.cache_root();
    if !root.exists() {
        println!("Cache: {} (not created)", root.display());
        return Ok(());
    }
    let cache = vmsnap_cas::LocalFileCache::new(&root)?;
    let stats = cache.stats()?;
    println!("Cache: {}", root.display());
    println!("  Entries:    {}", stats.blob_count);
    println!("  Total size: {}", format_bytes(stats.total_bytes));
    println!("  Average:    {}", format_bytes(stats.avg_blob_size()));
    Ok(())
}

pub(crate) fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
