//! save / show / restore / delete

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use vmsnap_config::{log_cli_info, Config};
use vmsnap_cow::ChunkedStore;
use vmsnap_loader::{CacheSnapshotOptions, FileCacheLoader, Loader, OpContext, Snapshot};
use vmsnap_manifest::{is_valid_name, Platform, SnapshotKey, VmConfiguration};

use crate::format_bytes;

/// Fields of the snapshot key.
#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Instance name
    #[arg(long, default_value = "")]
    instance: String,

    /// Platform property; repeatable, order is significant
    #[arg(long = "platform", value_name = "NAME=VALUE", value_parser = parse_pair)]
    platform: Vec<(String, String)>,

    /// Hash of the VM configuration
    #[arg(long, default_value = "")]
    config_hash: String,

    /// Runner that owns the snapshot (empty when sharing)
    #[arg(long, default_value = "")]
    runner_id: String,
}

impl KeyArgs {
    pub fn key(&self) -> Result<SnapshotKey> {
        let platform = self
            .platform
            .iter()
            .fold(Platform::new(), |p, (name, value)| p.with(name, value));
        Ok(SnapshotKey::new(
            &self.instance,
            &platform,
            &self.config_hash,
            &self.runner_id,
        )?)
    }
}

#[derive(Args, Debug)]
pub struct SaveArgs {
    #[command(flatten)]
    key: KeyArgs,

    #[arg(long, value_name = "FILE")]
    vm_state: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    kernel: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    initrd: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    mem: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    container_fs: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    scratch_fs: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    workspace_fs: Option<PathBuf>,

    /// Flat file to store as chunks; repeatable
    #[arg(long = "chunked", value_name = "NAME=FILE", value_parser = parse_pair)]
    chunked: Vec<(String, String)>,

    /// Chunk size in bytes (default from config)
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Number of vCPUs recorded in the VM configuration
    #[arg(long)]
    vcpus: Option<u32>,

    /// Memory size in MiB recorded in the VM configuration
    #[arg(long)]
    mem_mb: Option<u64>,

    /// Scratch disk size in MiB recorded in the VM configuration
    #[arg(long)]
    scratch_disk_mb: Option<u64>,

    /// Record networking as enabled in the VM configuration
    #[arg(long)]
    networking: bool,
}

impl SaveArgs {
    fn vm_configuration(&self) -> Option<VmConfiguration> {
        if self.vcpus.is_none() && self.mem_mb.is_none() && self.scratch_disk_mb.is_none() {
            return None;
        }
        Some(VmConfiguration {
            num_cpus: self.vcpus.unwrap_or(1),
            mem_size_mb: self.mem_mb.unwrap_or_default(),
            scratch_disk_size_mb: self.scratch_disk_mb.unwrap_or_default(),
            enable_networking: self.networking,
            ..Default::default()
        })
    }
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// Directory to unpack into
    #[arg(short, long)]
    output: PathBuf,

    /// Also reassemble each chunked file as <output>/<name>.img
    #[arg(long)]
    flatten: bool,
}

fn parse_pair(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {:?}", s)),
    }
}

fn check_name(name: &str) -> Result<()> {
    if !is_valid_name(name) {
        bail!("Invalid chunked file name: {:?}", name);
    }
    Ok(())
}

pub fn save(
    loader: &FileCacheLoader,
    ctx: &OpContext,
    config: &Config,
    args: SaveArgs,
) -> Result<()> {
    let key = args.key.key()?;
    let chunk_size = args.chunk_size.unwrap_or(config.snapshot.chunk_size_bytes);
    if chunk_size == 0 {
        bail!("Chunk size must be non-zero");
    }

    // Chunk files live next to the cache so they can be hard-linked in.
    let work = tempfile::Builder::new()
        .prefix("vmsnap-save-")
        .tempdir_in(config.cache_root())
        .context("Failed to create work directory")?;
    let mut stores = BTreeMap::new();
    for (name, path) in &args.chunked {
        check_name(name)?;
        let store = ChunkedStore::from_flat_file(path, chunk_size, work.path().join(name))
            .with_context(|| format!("Failed to chunk {}", path))?;
        stores.insert(name.clone(), store);
    }

    let opts = CacheSnapshotOptions {
        vm_configuration: args.vm_configuration(),
        vm_state_snapshot_path: args.vm_state,
        kernel_image_path: args.kernel,
        initrd_image_path: args.initrd,
        mem_snapshot_path: args.mem,
        container_fs_path: args.container_fs,
        scratch_fs_path: args.scratch_fs,
        workspace_fs_path: args.workspace_fs,
        chunked_files: stores.iter_mut().map(|(k, v)| (k.clone(), v)).collect(),
    };
    let snapshot = loader
        .cache_snapshot(ctx, &key, opts)
        .context("Failed to cache snapshot")?;

    let stats = snapshot.save_stats();
    log_cli_info!("Snapshot saved", chunks = stats.chunks_total);
    println!("Saved snapshot");
    println!(
        "  Files:   {} ({} added, {} reused)",
        snapshot.manifest().files.len(),
        stats.files_added,
        stats.files_reused
    );
    println!(
        "  Chunks:  {} ({} added, {} dirty, {})",
        stats.chunks_total,
        stats.chunks_added,
        stats.chunks_dirty,
        format_bytes(stats.dirty_bytes)
    );
    Ok(())
}

fn get(loader: &FileCacheLoader, ctx: &OpContext, args: &KeyArgs) -> Result<Snapshot> {
    let key = args.key()?;
    loader
        .get_snapshot(ctx, &key)
        .context("Snapshot not available")
}

pub fn show(loader: &FileCacheLoader, ctx: &OpContext, args: &KeyArgs) -> Result<()> {
    let snapshot = get(loader, ctx, args)?;
    print_snapshot(&snapshot);
    Ok(())
}

fn print_snapshot(snapshot: &Snapshot) {
    let key = snapshot.key();
    println!("Snapshot");
    println!("  Instance:       {:?}", key.instance_name);
    println!("  Platform hash:  {}", key.platform_hash);
    println!("  Config hash:    {:?}", key.configuration_hash);
    println!("  Runner:         {:?}", key.runner_id);
    if let Some(vm) = snapshot.vm_configuration() {
        println!(
            "  VM:             {} vCPU, {} MiB memory, {} MiB scratch, networking {}",
            vm.num_cpus,
            vm.mem_size_mb,
            vm.scratch_disk_size_mb,
            if vm.enable_networking { "on" } else { "off" }
        );
    }
    let manifest = snapshot.manifest();
    println!("Files:");
    for node in &manifest.files {
        println!("  {:<24} {}", node.name, node.digest);
    }
    println!("Chunked files:");
    for file in &manifest.chunked_files {
        println!(
            "  {:<24} {} in {} chunks of {}",
            file.name,
            format_bytes(file.size),
            file.chunks.len(),
            format_bytes(file.chunk_size)
        );
    }
}

pub fn restore(loader: &FileCacheLoader, ctx: &OpContext, args: RestoreArgs) -> Result<()> {
    let snapshot = get(loader, ctx, &args.key)?;
    fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    let mut unpacked = loader
        .unpack_snapshot(ctx, Some(&snapshot), &args.output)
        .context("Failed to unpack snapshot")?;

    for node in &snapshot.manifest().files {
        println!("  {}", args.output.join(&node.name).display());
    }
    let mut names: Vec<_> = unpacked.chunked_files.keys().cloned().collect();
    names.sort();
    for name in names {
        let Some(mut store) = unpacked.take(&name) else {
            continue;
        };
        println!("  {}/ ({} chunks)", store.data_dir().display(), store.chunk_count());
        if args.flatten {
            let flat = flat_path(&args.output, &name);
            store
                .write_flat_file(&flat)
                .with_context(|| format!("Failed to write {}", flat.display()))?;
            println!("  {}", flat.display());
        }
    }
    log_cli_info!("Snapshot restored");
    Ok(())
}

fn flat_path(output: &Path, name: &str) -> PathBuf {
    output.join(format!("{}.img", name))
}

pub fn delete(loader: &FileCacheLoader, ctx: &OpContext, args: &KeyArgs) -> Result<()> {
    let snapshot = get(loader, ctx, args)?;
    let summary = loader.delete_snapshot(ctx, &snapshot);
    println!(
        "Deleted {} of {} cache entries",
        summary.deleted, summary.attempted
    );
    for (name, error) in &summary.failures {
        eprintln!("  warning: {}: {}", name, error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("OSFamily=linux").unwrap(),
            ("OSFamily".to_string(), "linux".to_string())
        );
        assert_eq!(parse_pair("a=b=c").unwrap().1, "b=c");
        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=x").is_err());
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("scratchfs").is_ok());
        assert!(check_name("../x").is_err());
        assert!(check_name("").is_err());
    }

    #[test]
    fn test_flat_path() {
        assert_eq!(flat_path(Path::new("/out"), "disk"), PathBuf::from("/out/disk.img"));
    }
}
