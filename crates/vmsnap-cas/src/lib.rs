//! # vmsnap-cas
//!
//! Local file cache backing the snapshot store.
//!
//! Entries are addressed by [`Digest`] (`hash` + `size_bytes`) and laid out
//! with a 2-level fan-out so no single directory grows unbounded:
//!
//! ```text
//! <root>/
//! └── blobs/
//!     └── ab/
//!         └── cd/
//!             └── abcd1234...efgh_4194304   # hash_size
//! ```
//!
//! The cache never verifies that an entry's bytes hash to its key. Callers
//! that derive keys without reading content (see `vmsnap-manifest`) rely on
//! this.

mod digest;
pub mod link_strategy;

pub use digest::{Digest, FileNode};

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, instrument};

use link_strategy::get_strategy;

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob not found: {digest}")]
    NotFound { digest: String },

    #[error("Invalid digest: {digest}")]
    InvalidDigest { digest: String },
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Operations the snapshot loader needs from a backing cache.
///
/// `contains_file` and `fast_link_file` also refresh the entry's access
/// time so that recently verified entries are the last to be evicted.
pub trait FileCache: Send + Sync {
    /// Check if an entry is resident.
    fn contains_file(&self, node: &FileNode) -> bool;

    /// Register `source` under `node`, replacing any existing entry.
    fn add_file(&self, node: &FileNode, source: &Path) -> Result<()>;

    /// Materialize an entry at `dest` without copying where possible.
    /// Returns false if the entry is not resident. Never leaves a partial
    /// file at `dest`.
    fn fast_link_file(&self, node: &FileNode, dest: &Path) -> bool;

    /// Remove an entry.
    fn delete_file(&self, node: &FileNode) -> Result<()>;

    /// Read an entry's bytes.
    fn read(&self, node: &FileNode) -> Result<Vec<u8>>;

    /// Store bytes under `node`, replacing any existing entry.
    fn write(&self, node: &FileNode, data: &[u8]) -> Result<()>;
}

/// Filesystem-backed [`FileCache`].
#[derive(Debug, Clone)]
pub struct LocalFileCache {
    root: PathBuf,
}

impl LocalFileCache {
    /// Open a cache rooted at the given directory, creating it if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("blobs"))?;
        Ok(Self { root })
    }

    /// Get the root path of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path where the entry for `digest` lives: `blobs/ab/cd/hash_size`.
    pub fn blob_path(&self, digest: &Digest) -> Result<PathBuf> {
        if !digest.is_valid() {
            return Err(CasError::InvalidDigest {
                digest: digest.to_string(),
            });
        }
        let hash = digest.hash.to_ascii_lowercase();
        Ok(self
            .root
            .join("blobs")
            .join(&hash[..2])
            .join(&hash[2..4])
            .join(format!("{}_{}", hash, digest.size_bytes)))
    }

    /// Unique sibling path for staging a write before the atomic rename.
    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(
            "{}.{}.{:?}.tmp",
            name,
            std::process::id(),
            std::thread::current().id()
        ))
    }

    /// Move a fully staged file into place, cleaning up on failure.
    fn commit(temp: &Path, dest: &Path) -> Result<()> {
        if let Err(e) = fs::rename(temp, dest) {
            let _ = fs::remove_file(temp);
            return Err(CasError::Io(e));
        }
        Ok(())
    }

    /// Best-effort access-time refresh; eviction order is advisory.
    fn touch(path: &Path) {
        if let Ok(file) = File::options().append(true).open(path) {
            let _ = file.set_modified(SystemTime::now());
        }
    }

    /// Get statistics about the cache.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        let blobs = self.root.join("blobs");
        if !blobs.exists() {
            return Ok(stats);
        }

        for l1 in fs::read_dir(&blobs)? {
            let l1 = l1?;
            if !l1.file_type()?.is_dir() {
                continue;
            }
            for l2 in fs::read_dir(l1.path())? {
                let l2 = l2?;
                if !l2.file_type()?.is_dir() {
                    continue;
                }
                for blob in fs::read_dir(l2.path())? {
                    let blob = blob?;
                    if !blob.file_type()?.is_file() {
                        continue;
                    }
                    if blob.path().extension().is_some_and(|ext| ext == "tmp") {
                        continue;
                    }
                    stats.blob_count += 1;
                    stats.total_bytes += blob.metadata()?.len();
                }
            }
        }
        Ok(stats)
    }
}

impl FileCache for LocalFileCache {
    fn contains_file(&self, node: &FileNode) -> bool {
        let Ok(path) = self.blob_path(&node.digest) else {
            return false;
        };
        if path.is_file() {
            Self::touch(&path);
            true
        } else {
            false
        }
    }

    #[instrument(skip(self, node), fields(digest = %node.digest), level = "debug")]
    fn add_file(&self, node: &FileNode, source: &Path) -> Result<()> {
        let path = self.blob_path(&node.digest)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = Self::temp_path(&path);
        let _ = fs::remove_file(&temp);
        get_strategy().link_file(source, &temp)?;
        Self::commit(&temp, &path)
    }

    fn fast_link_file(&self, node: &FileNode, dest: &Path) -> bool {
        let Ok(path) = self.blob_path(&node.digest) else {
            return false;
        };
        if dest.symlink_metadata().is_ok() && fs::remove_file(dest).is_err() {
            return false;
        }
        // Link to a staging name first so a copy fallback interrupted by
        // eviction never shows up at `dest`.
        let temp = Self::temp_path(dest);
        let _ = fs::remove_file(&temp);
        match get_strategy().link_file(&path, &temp) {
            Ok(()) => {}
            Err(e) => {
                let _ = fs::remove_file(&temp);
                debug!(digest = %node.digest, error = %e, "cache link miss");
                return false;
            }
        }
        if fs::rename(&temp, dest).is_err() {
            let _ = fs::remove_file(&temp);
            return false;
        }
        Self::touch(&path);
        true
    }

    fn delete_file(&self, node: &FileNode) -> Result<()> {
        let path = self.blob_path(&node.digest)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound {
                digest: node.digest.to_string(),
            }),
            Err(e) => Err(CasError::Io(e)),
        }
    }

    fn read(&self, node: &FileNode) -> Result<Vec<u8>> {
        let path = self.blob_path(&node.digest)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound {
                digest: node.digest.to_string(),
            }),
            Err(e) => Err(CasError::Io(e)),
        }
    }

    #[instrument(skip(self, node, data), fields(digest = %node.digest), level = "debug")]
    fn write(&self, node: &FileNode, data: &[u8]) -> Result<()> {
        let path = self.blob_path(&node.digest)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = Self::temp_path(&path);
        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        Self::commit(&temp, &path)
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of resident entries
    pub blob_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
}

impl CacheStats {
    pub fn avg_blob_size(&self) -> u64 {
        if self.blob_count == 0 {
            0
        } else {
            self.total_bytes / self.blob_count
        }
    }
}
