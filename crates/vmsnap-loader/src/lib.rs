//! # vmsnap-loader
//!
//! Saves VM snapshots into a local file cache and restores them.
//!
//! A snapshot is a manifest plus the cache entries it references:
//! - whole-file artifacts (VM state, kernel, memory, filesystems), keyed by
//!   content digest when sharing is enabled and by a cheap hash otherwise
//! - chunks of chunked files, always keyed by content digest
//!
//! Saving only re-registers chunks written since the last save. Loading
//! checks that every referenced entry is still resident before declaring a
//! snapshot usable, since the cache may evict entries at any time.

mod context;
mod error;
mod image;
mod loader;
mod snapshot;

pub use context::{AuthError, CancelHandle, GroupResolver, OpContext, StaticGroup};
pub use error::{ErrorKind, Result, SnapshotError};
pub use image::{image_snapshot_key, ImageUnpacker, ROOTFS_FILE_NAME};
pub use loader::FileCacheLoader;
pub use snapshot::{
    CacheSnapshotOptions, DeleteSummary, LoaderOptions, SaveStats, Snapshot, UnpackedSnapshot,
};

use std::path::Path;

use vmsnap_manifest::SnapshotKey;

/// Stores and loads snapshots. Implementations are stateless between calls
/// and safe to share across threads.
pub trait Loader: Send + Sync {
    /// Save the artifacts and chunked files in `opts` under `key`.
    ///
    /// The manifest is written last, so a failed save never leaves a
    /// manifest pointing at missing entries.
    fn cache_snapshot(
        &self,
        ctx: &OpContext,
        key: &SnapshotKey,
        opts: CacheSnapshotOptions<'_>,
    ) -> Result<Snapshot>;

    /// Load snapshot metadata. Fails with `Unavailable` if the manifest or
    /// any entry it references is no longer cached.
    fn get_snapshot(&self, ctx: &OpContext, key: &SnapshotKey) -> Result<Snapshot>;

    /// Materialize a snapshot into `output_dir`: whole files as
    /// `output_dir/<name>`, chunked files as `output_dir/<name>/<offset>`.
    fn unpack_snapshot(
        &self,
        ctx: &OpContext,
        snapshot: Option<&Snapshot>,
        output_dir: &Path,
    ) -> Result<UnpackedSnapshot>;

    /// Remove the manifest and whole-file artifacts from the cache. Chunks
    /// are content-addressed and may be shared, so they are left alone.
    fn delete_snapshot(&self, ctx: &OpContext, snapshot: &Snapshot) -> DeleteSummary;
}
