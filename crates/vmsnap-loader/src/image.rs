//! Container image conversion with per-image de-duplication.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, instrument};
use vmsnap_cow::ChunkedStore;
use vmsnap_manifest::{hash_strings, SnapshotKey};

use crate::{CacheSnapshotOptions, Loader, OpContext, Result, SnapshotError};

/// Name of the chunked file holding a converted image.
pub const ROOTFS_FILE_NAME: &str = "rootfs.ext4";

const IMAGE_KEY_TAG: &str = "__UnpackContainerImage";

/// Snapshot key under which the conversion of `image_ref` is cached.
pub fn image_snapshot_key(image_ref: &str) -> SnapshotKey {
    SnapshotKey {
        configuration_hash: hash_strings([IMAGE_KEY_TAG, image_ref]),
        ..Default::default()
    }
}

/// Converts flat filesystem images into chunked stores, once per image.
///
/// Concurrent requests for the same image wait for the first conversion and
/// then unpack its cached result.
pub struct ImageUnpacker {
    loader: Arc<dyn Loader>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ImageUnpacker {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        Self {
            loader,
            in_flight: DashMap::new(),
        }
    }

    /// Chunked store for `image_ref`, placed in `out_dir/rootfs.ext4/`.
    ///
    /// `image_path` is read only when no cached conversion exists.
    #[instrument(skip(self, ctx, image_path, out_dir), level = "debug")]
    pub fn unpack(
        &self,
        ctx: &OpContext,
        image_ref: &str,
        image_path: &Path,
        out_dir: &Path,
        chunk_size: u64,
    ) -> Result<ChunkedStore> {
        let key = image_snapshot_key(image_ref);
        if let Some(store) = self.try_cached(ctx, &key, out_dir)? {
            return Ok(store);
        }

        let slot = Arc::clone(
            self.in_flight
                .entry(key.configuration_hash.clone())
                .or_default()
                .value(),
        );
        let _guard = slot
            .lock()
            .map_err(|_| SnapshotError::Internal(format!("conversion of {} panicked", image_ref)))?;

        // Another caller may have finished the conversion while we waited.
        if let Some(store) = self.try_cached(ctx, &key, out_dir)? {
            return Ok(store);
        }

        let result = self.convert(ctx, &key, image_ref, image_path, out_dir, chunk_size);
        self.in_flight.remove(&key.configuration_hash);
        result
    }

    /// Number of images currently being converted.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn try_cached(
        &self,
        ctx: &OpContext,
        key: &SnapshotKey,
        out_dir: &Path,
    ) -> Result<Option<ChunkedStore>> {
        let snapshot = match self.loader.get_snapshot(ctx, key) {
            Ok(s) => s,
            Err(e) if e.is_not_found() || e.is_unavailable() => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut unpacked = self.loader.unpack_snapshot(ctx, Some(&snapshot), out_dir)?;
        unpacked
            .take(ROOTFS_FILE_NAME)
            .map(Some)
            .ok_or_else(|| SnapshotError::Internal("missing rootfs artifact in snapshot".into()))
    }

    fn convert(
        &self,
        ctx: &OpContext,
        key: &SnapshotKey,
        image_ref: &str,
        image_path: &Path,
        out_dir: &Path,
        chunk_size: u64,
    ) -> Result<ChunkedStore> {
        let start = Instant::now();
        let mut store =
            ChunkedStore::from_flat_file(image_path, chunk_size, out_dir.join(ROOTFS_FILE_NAME))?;
        debug!(
            image_ref,
            chunks = store.chunk_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "converted image to chunked store"
        );

        let mut opts = CacheSnapshotOptions::default();
        opts.chunked_files.insert(ROOTFS_FILE_NAME.to_string(), &mut store);
        self.loader.cache_snapshot(ctx, key, opts)?;
        Ok(store)
    }
}
