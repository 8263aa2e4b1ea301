//! Inputs and outputs of loader operations.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vmsnap_cas::{FileCache, LocalFileCache};
use vmsnap_config::Config;
use vmsnap_cow::ChunkedStore;
use vmsnap_manifest::{SnapshotKey, SnapshotManifest, VmConfiguration};

use crate::Result;

/// Construction options for [`FileCacheLoader`](crate::FileCacheLoader).
#[derive(Clone, Default)]
pub struct LoaderOptions {
    pub cache: Option<Arc<dyn FileCache>>,
    /// Key artifacts by content digest so runners can share them.
    pub enable_local_snapshot_sharing: bool,
}

impl LoaderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: Arc<dyn FileCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_local_snapshot_sharing(mut self, enabled: bool) -> Self {
        self.enable_local_snapshot_sharing = enabled;
        self
    }

    /// Open the local cache named by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let cache = LocalFileCache::new(config.cache_root())?;
        Ok(Self::new()
            .with_cache(Arc::new(cache))
            .with_local_snapshot_sharing(config.snapshot.enable_local_snapshot_sharing))
    }
}

/// What to save with a snapshot. Every field is optional: a snapshot may be
/// a full VM or a single shared asset such as a container filesystem.
#[derive(Debug, Default)]
pub struct CacheSnapshotOptions<'a> {
    pub vm_configuration: Option<VmConfiguration>,
    pub vm_state_snapshot_path: Option<PathBuf>,
    pub kernel_image_path: Option<PathBuf>,
    pub initrd_image_path: Option<PathBuf>,
    pub mem_snapshot_path: Option<PathBuf>,
    pub container_fs_path: Option<PathBuf>,
    pub scratch_fs_path: Option<PathBuf>,
    pub workspace_fs_path: Option<PathBuf>,
    /// Chunked files by name. Dirty chunks are synced while caching.
    pub chunked_files: BTreeMap<String, &'a mut ChunkedStore>,
}

impl CacheSnapshotOptions<'_> {
    /// Whole-file artifacts in manifest order.
    pub fn artifact_paths(&self) -> Vec<&Path> {
        [
            &self.vm_state_snapshot_path,
            &self.kernel_image_path,
            &self.initrd_image_path,
            &self.mem_snapshot_path,
            &self.container_fs_path,
            &self.scratch_fs_path,
            &self.workspace_fs_path,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect()
    }
}

/// Counters from one save. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SaveStats {
    pub files_added: usize,
    pub files_reused: usize,
    pub chunks_total: usize,
    pub chunks_dirty: usize,
    pub chunks_added: usize,
    pub dirty_bytes: u64,
}

impl SaveStats {
    /// Fraction of chunks written since they were last cached.
    pub fn dirty_chunk_ratio(&self) -> f64 {
        if self.chunks_total == 0 {
            0.0
        } else {
            self.chunks_dirty as f64 / self.chunks_total as f64
        }
    }
}

/// A snapshot key paired with its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    key: SnapshotKey,
    manifest: SnapshotManifest,
    stats: SaveStats,
}

impl Snapshot {
    pub(crate) fn new(key: SnapshotKey, manifest: SnapshotManifest, stats: SaveStats) -> Self {
        Self {
            key,
            manifest,
            stats,
        }
    }

    pub fn key(&self) -> &SnapshotKey {
        &self.key
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    pub fn vm_configuration(&self) -> Option<&VmConfiguration> {
        self.manifest.vm_configuration.as_ref()
    }

    /// Counters from the save that produced this snapshot. Zero for
    /// snapshots read back from the cache.
    pub fn save_stats(&self) -> &SaveStats {
        &self.stats
    }
}

/// Chunked files reconstructed by an unpack, owned by the caller.
#[derive(Debug, Default)]
pub struct UnpackedSnapshot {
    pub chunked_files: HashMap<String, ChunkedStore>,
}

impl UnpackedSnapshot {
    pub fn take(&mut self, name: &str) -> Option<ChunkedStore> {
        self.chunked_files.remove(name)
    }
}

/// Result of a best-effort delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub attempted: usize,
    pub deleted: usize,
    /// `(entry name, error message)` for each entry that could not be removed.
    pub failures: Vec<(String, String)>,
}

impl DeleteSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
