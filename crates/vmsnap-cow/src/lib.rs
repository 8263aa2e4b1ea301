//! # vmsnap-cow
//!
//! Copy-on-write chunked files for VM disks and memory images.
//!
//! A large file is split into fixed-size chunks, each stored as its own
//! backing file named by its byte offset:
//!
//! ```text
//! <data_dir>/
//! ├── 0
//! ├── 4194304
//! └── 8388608        # last chunk may be shorter than chunk_size
//! ```
//!
//! Chunk files handed out by the cache may share an inode with the cache
//! entry. The first write to such a chunk copies it to a private file before
//! mapping it writable, so cache entries are never modified in place.

mod chunk;
mod store;

pub use chunk::{Chunk, ChunkState};
pub use store::{chunk_name, ChunkedStore};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use thiserror::Error;

/// Errors that can occur during chunk operations
#[derive(Error, Debug)]
pub enum CowError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Chunk backing file missing: {}", path.display())]
    MissingBacking { path: PathBuf },

    #[error("Invalid chunk layout: {0}")]
    InvalidLayout(String),

    #[error("Access out of bounds: offset {offset} len {len} size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
}

pub type Result<T> = std::result::Result<T, CowError>;

/// Counters shared by every chunk of a store.
#[derive(Debug, Default)]
pub struct IoStats {
    bytes_hashed: AtomicU64,
    bytes_read: AtomicU64,
    map_calls: AtomicU64,
    link_breaks: AtomicU64,
    live_mappings: AtomicI64,
}

impl IoStats {
    pub(crate) fn add_hashed(&self, n: u64) {
        self.bytes_hashed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn mapped(&self) {
        self.map_calls.fetch_add(1, Ordering::Relaxed);
        self.live_mappings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unmapped(&self) {
        self.live_mappings.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn link_broken(&self) {
        self.link_breaks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            bytes_hashed: self.bytes_hashed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            map_calls: self.map_calls.load(Ordering::Relaxed),
            link_breaks: self.link_breaks.load(Ordering::Relaxed),
            live_mappings: self.live_mappings.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`IoStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    /// Bytes fed through the digest function
    pub bytes_hashed: u64,
    /// Bytes read from source files during conversion
    pub bytes_read: u64,
    /// Number of mmap calls
    pub map_calls: u64,
    /// Number of shared chunk files copied before their first write
    pub link_breaks: u64,
    /// Mappings currently held
    pub live_mappings: i64,
}
