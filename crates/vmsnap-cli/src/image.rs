use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use vmsnap_config::{log_cli_debug, Config};
use vmsnap_loader::{FileCacheLoader, ImageUnpacker, OpContext};

use crate::format_bytes;

#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Image reference that names the conversion (e.g. docker.io/library/alpine:3.19)
    #[arg(long = "ref", value_name = "REF")]
    image_ref: String,

    /// Flat ext4 image to convert when no cached conversion exists
    #[arg(long, value_name = "FILE")]
    path: PathBuf,

    /// Directory that receives rootfs.ext4/
    #[arg(short, long)]
    output: PathBuf,

    /// Chunk size in bytes (default from config)
    #[arg(long)]
    chunk_size: Option<u64>,
}

pub fn run(loader: FileCacheLoader, ctx: &OpContext, config: &Config, args: ImageArgs) -> Result<()> {
    let chunk_size = args.chunk_size.unwrap_or(config.snapshot.chunk_size_bytes);
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;

    let unpacker = ImageUnpacker::new(Arc::new(loader));
    let start = Instant::now();
    let store = unpacker
        .unpack(ctx, &args.image_ref, &args.path, &args.output, chunk_size)
        .with_context(|| format!("Failed to unpack image {}", args.image_ref))?;

    let converted = store.io_stats().bytes_read > 0;
    log_cli_debug!(
        "Image ready",
        converted = converted,
        elapsed_ms = start.elapsed().as_millis() as u64
    );
    println!(
        "{} {} -> {}",
        if converted { "Converted" } else { "Reused" },
        args.image_ref,
        store.data_dir().display()
    );
    println!(
        "  {} in {} chunks",
        format_bytes(store.size_bytes()),
        store.chunk_count()
    );
    Ok(())
}
