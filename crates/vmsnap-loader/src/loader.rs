//! [`FileCacheLoader`]: the loader over a local [`FileCache`].

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, instrument};
use vmsnap_cas::{FileCache, FileNode};
use vmsnap_config::{log_loader_debug, log_loader_info, log_loader_warn};
use vmsnap_cow::{chunk_name, Chunk, ChunkedStore};
use vmsnap_manifest::{
    artifact_file_node, chunk_file_node, is_valid_name, manifest_file_node, ChunkEntry,
    ChunkedFile, KeyMode, ManifestError, SnapshotKey, SnapshotManifest,
};

use crate::{
    CacheSnapshotOptions, DeleteSummary, Loader, LoaderOptions, OpContext, Result, SaveStats,
    Snapshot, SnapshotError, UnpackedSnapshot,
};

/// Loader backed by a local file cache. Holds no per-snapshot state, so one
/// instance serves concurrent operations on independent keys.
#[derive(Clone)]
pub struct FileCacheLoader {
    cache: Arc<dyn FileCache>,
    enable_local_snapshot_sharing: bool,
}

/// Per-chunk result of caching a chunked file.
struct ChunkOutcome {
    entry: ChunkEntry,
    dirty_bytes: Option<u64>,
    added: bool,
}

impl FileCacheLoader {
    /// Fails with `InvalidArgument` if `options` has no cache.
    pub fn new(options: LoaderOptions) -> Result<Self> {
        let cache = options
            .cache
            .ok_or_else(|| SnapshotError::InvalidArgument("missing file cache".into()))?;
        Ok(Self {
            cache,
            enable_local_snapshot_sharing: options.enable_local_snapshot_sharing,
        })
    }

    pub fn cache(&self) -> &Arc<dyn FileCache> {
        &self.cache
    }

    pub fn sharing_enabled(&self) -> bool {
        self.enable_local_snapshot_sharing
    }

    fn key_mode(&self) -> KeyMode {
        KeyMode::for_sharing(self.enable_local_snapshot_sharing)
    }

    /// Fails with `Unavailable` naming the first artifact or chunk that is
    /// not resident. Refreshes recency of everything it finds.
    fn check_all_artifacts_exist(&self, manifest: &SnapshotManifest) -> Result<()> {
        for node in &manifest.files {
            if !self.cache.contains_file(node) {
                return Err(SnapshotError::Unavailable(format!(
                    "file {:?} not found (digest {})",
                    node.name, node.digest
                )));
            }
        }
        for file in &manifest.chunked_files {
            for entry in &file.chunks {
                let node = chunk_file_node(file, entry);
                if !self.cache.contains_file(&node) {
                    return Err(SnapshotError::Unavailable(format!(
                        "chunked file {:?} missing chunk at offset {:#x} (digest {})",
                        file.name, entry.offset, node.digest
                    )));
                }
            }
        }
        Ok(())
    }

    /// Register every chunk of `store` with the cache and describe it.
    ///
    /// Dirty chunks are synced first. Clean chunks that are already resident
    /// are not re-added.
    fn cache_chunked(
        &self,
        ctx: &OpContext,
        name: &str,
        store: &mut ChunkedStore,
        stats: &mut SaveStats,
    ) -> Result<ChunkedFile> {
        let size = store.size_bytes();
        let chunk_size = store.chunk_size_bytes();
        let cache = &*self.cache;

        let outcomes: Vec<ChunkOutcome> = store
            .sorted_chunks_mut()
            .par_iter_mut()
            .map(|chunk| cache_chunk(ctx, cache, chunk))
            .collect::<Result<_>>()?;

        let mut chunks = Vec::with_capacity(outcomes.len());
        let mut dirty = 0usize;
        let mut dirty_bytes = 0u64;
        for outcome in outcomes {
            if let Some(n) = outcome.dirty_bytes {
                dirty += 1;
                dirty_bytes += n;
            }
            if outcome.added {
                stats.chunks_added += 1;
            }
            chunks.push(outcome.entry);
        }
        stats.chunks_total += chunks.len();
        stats.chunks_dirty += dirty;
        stats.dirty_bytes += dirty_bytes;

        let ratio = if chunks.is_empty() {
            0.0
        } else {
            dirty as f64 / chunks.len() as f64
        };
        info!(
            file = name,
            chunks = chunks.len(),
            dirty_chunks = dirty,
            dirty_chunk_ratio = ratio,
            dirty_bytes,
            "cached chunked file"
        );

        Ok(ChunkedFile {
            name: name.to_string(),
            size,
            chunk_size,
            chunks,
        })
    }

    /// Link every chunk of `file` from the cache into `output_dir/<name>/`.
    ///
    /// The data directory must not exist yet. On failure the chunks created
    /// so far are dropped, which releases them.
    fn unpack_chunked(
        &self,
        ctx: &OpContext,
        file: &ChunkedFile,
        output_dir: &Path,
    ) -> Result<ChunkedStore> {
        let data_dir = output_dir.join(&file.name);
        fs::create_dir(&data_dir).map_err(|e| {
            SnapshotError::Internal(format!(
                "failed to create chunk data dir {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let mut chunks = Vec::with_capacity(file.chunks.len());
        for entry in &file.chunks {
            ctx.check()?;
            let node = chunk_file_node(file, entry);
            let path = data_dir.join(chunk_name(entry.offset));
            if !self.cache.fast_link_file(&node, &path) {
                return Err(SnapshotError::Unavailable(format!(
                    "snapshot chunk {}/{} not found in local cache",
                    file.name, entry.offset
                )));
            }
            let mut chunk = Chunk::lazy(&path, entry.offset);
            // The original digest stays valid until the chunk is written.
            chunk.set_digest(node.digest);
            chunks.push(chunk);
        }
        Ok(ChunkedStore::new(
            chunks,
            file.chunk_size,
            file.size,
            data_dir,
        )?)
    }
}

fn cache_chunk(ctx: &OpContext, cache: &dyn FileCache, chunk: &mut Chunk) -> Result<ChunkOutcome> {
    ctx.check()?;
    let dirty_bytes = if chunk.is_dirty() {
        let n = chunk.size_bytes()?;
        chunk.sync().map_err(|e| {
            SnapshotError::from(e).context(format!("sync chunk {}", chunk.path().display()))
        })?;
        Some(n)
    } else {
        None
    };
    let digest = chunk.digest().map_err(|e| {
        SnapshotError::from(e).context(format!("digest chunk {}", chunk.path().display()))
    })?;
    let node = FileNode::new(digest).with_name(chunk_name(chunk.offset()));
    let added = dirty_bytes.is_some() || !cache.contains_file(&node);
    if added {
        cache.add_file(&node, chunk.path()).map_err(|e| {
            SnapshotError::from(e).context(format!("add chunk {}", chunk.path().display()))
        })?;
    }
    Ok(ChunkOutcome {
        entry: ChunkEntry::new(chunk.offset(), node.digest.hash),
        dirty_bytes,
        added,
    })
}

impl Loader for FileCacheLoader {
    #[instrument(skip(self, ctx, opts), fields(instance = %key.instance_name), level = "debug")]
    fn cache_snapshot(
        &self,
        ctx: &OpContext,
        key: &SnapshotKey,
        opts: CacheSnapshotOptions<'_>,
    ) -> Result<Snapshot> {
        ctx.check()?;
        let gid = ctx.group_id()?;
        let mode = self.key_mode();
        if let Some(name) = opts.chunked_files.keys().find(|n| !is_valid_name(n)) {
            return Err(SnapshotError::InvalidArgument(format!(
                "invalid chunked file name {:?}",
                name
            )));
        }
        let mut stats = SaveStats::default();
        let mut manifest = SnapshotManifest {
            vm_configuration: opts.vm_configuration.clone(),
            ..Default::default()
        };

        for path in opts.artifact_paths() {
            ctx.check()?;
            let meta = fs::metadata(path)
                .map_err(|e| SnapshotError::io(format!("stat {}", path.display()), e))?;
            let node = artifact_file_node(mode, &gid, key, path, meta.len()).map_err(|e| {
                SnapshotError::from(e).context(format!("derive key for {}", path.display()))
            })?;
            if !is_valid_name(&node.name) {
                return Err(SnapshotError::InvalidArgument(format!(
                    "artifact path {} has no usable file name",
                    path.display()
                )));
            }
            // Content-addressed entries are immutable, so a resident one
            // needs no rewrite. Cheap keys always overwrite.
            if mode == KeyMode::Cheap || !self.cache.contains_file(&node) {
                self.cache.add_file(&node, path).map_err(|e| {
                    SnapshotError::from(e).context(format!("add {}", path.display()))
                })?;
                stats.files_added += 1;
            } else {
                stats.files_reused += 1;
            }
            debug!(file = %node.name, digest = %node.digest, "cached artifact");
            manifest.files.push(node);
        }

        for (name, store) in opts.chunked_files {
            let file = self
                .cache_chunked(ctx, &name, store, &mut stats)
                .inspect_err(|e| {
                    log_loader_warn!(
                        "Failed to cache chunked file",
                        file = name.as_str(),
                        error = display(e),
                    )
                })?;
            manifest.chunked_files.push(file);
        }

        ctx.check()?;
        let bytes = manifest.encode()?;
        self.cache
            .write(&manifest_file_node(&gid, key), &bytes)
            .map_err(|e| SnapshotError::from(e).context("write snapshot manifest"))?;

        log_loader_info!(
            "Snapshot cached",
            files = manifest.files.len(),
            chunked_files = manifest.chunked_files.len(),
            chunks_added = stats.chunks_added,
            dirty_bytes = stats.dirty_bytes,
        );
        Ok(Snapshot::new(key.clone(), manifest, stats))
    }

    #[instrument(skip(self, ctx), fields(instance = %key.instance_name), level = "debug")]
    fn get_snapshot(&self, ctx: &OpContext, key: &SnapshotKey) -> Result<Snapshot> {
        ctx.check()?;
        let gid = ctx.group_id()?;
        let node = manifest_file_node(&gid, key);
        let bytes = self.cache.read(&node).map_err(|e| {
            SnapshotError::Unavailable(format!("failed to read snapshot manifest: {}", e))
        })?;
        let manifest = SnapshotManifest::decode(&bytes).map_err(|e| match e {
            ManifestError::VersionMismatch { .. } => {
                SnapshotError::Unavailable(format!("incompatible snapshot manifest: {}", e))
            }
            other => SnapshotError::Unavailable(format!(
                "failed to decode snapshot manifest: {}",
                other
            )),
        })?;
        self.check_all_artifacts_exist(&manifest)?;
        log_loader_debug!(
            "Snapshot found",
            files = manifest.files.len(),
            chunks = manifest.chunk_count(),
        );
        Ok(Snapshot::new(key.clone(), manifest, SaveStats::default()))
    }

    #[instrument(skip(self, ctx, snapshot), level = "debug")]
    fn unpack_snapshot(
        &self,
        ctx: &OpContext,
        snapshot: Option<&Snapshot>,
        output_dir: &Path,
    ) -> Result<UnpackedSnapshot> {
        let snapshot = snapshot
            .ok_or_else(|| SnapshotError::InvalidArgument("no snapshot to unpack".into()))?;
        let manifest = snapshot.manifest();
        // Names come from cache contents; never join one that escapes output_dir.
        manifest.validate().map_err(|e| {
            SnapshotError::Internal(format!("refusing to unpack snapshot manifest: {}", e))
        })?;

        for node in &manifest.files {
            ctx.check()?;
            if !self.cache.fast_link_file(node, &output_dir.join(&node.name)) {
                return Err(SnapshotError::Unavailable(format!(
                    "snapshot artifact {:?} not found in local cache",
                    node.name
                )));
            }
        }

        let mut unpacked = UnpackedSnapshot::default();
        for file in &manifest.chunked_files {
            let store = self.unpack_chunked(ctx, file, output_dir)?;
            unpacked.chunked_files.insert(file.name.clone(), store);
        }
        log_loader_debug!(
            "Snapshot unpacked",
            files = manifest.files.len(),
            chunked_files = unpacked.chunked_files.len(),
        );
        Ok(unpacked)
    }

    fn delete_snapshot(&self, ctx: &OpContext, snapshot: &Snapshot) -> DeleteSummary {
        let mut summary = DeleteSummary::default();
        let mut nodes = Vec::with_capacity(snapshot.manifest().files.len() + 1);
        match ctx.group_id() {
            Ok(gid) => nodes.push(manifest_file_node(&gid, snapshot.key())),
            Err(e) => summary
                .failures
                .push((vmsnap_manifest::MANIFEST_FILE_NAME.to_string(), e.to_string())),
        }
        nodes.extend(snapshot.manifest().files.iter().cloned());

        for node in &nodes {
            summary.attempted += 1;
            match self.cache.delete_file(node) {
                Ok(()) => summary.deleted += 1,
                Err(e) => {
                    log_loader_warn!(
                        "Failed to delete snapshot entry",
                        file = node.name.as_str(),
                        digest = display(&node.digest),
                        error = display(&e),
                    );
                    summary.failures.push((node.name.clone(), e.to_string()));
                }
            }
        }
        log_loader_info!(
            "Snapshot deleted",
            attempted = summary.attempted,
            deleted = summary.deleted,
            failed = summary.failures.len(),
        );
        summary
    }
}
