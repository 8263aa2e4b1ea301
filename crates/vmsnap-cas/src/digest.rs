//! Content digests and cache node descriptors.
//!
//! Cache entries are addressed by a `(hash, size)` pair. For content-addressed
//! entries the hash is the BLAKE3 digest of the bytes; for cheaply-keyed
//! entries it is any 64-char hex string derived by the caller.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Read buffer used when streaming files through the hasher.
const HASH_BUF_SIZE: usize = 256 * 1024;

/// Cache address of a blob: hex hash plus size in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: u64,
}

impl Digest {
    pub fn new(hash: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// BLAKE3 digest of an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            hash: blake3::hash(data).to_hex().to_string(),
            size_bytes: data.len() as u64,
        }
    }

    /// Stream a reader through BLAKE3, counting the bytes consumed.
    pub fn compute<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        let mut size = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok(Self {
            hash: hasher.finalize().to_hex().to_string(),
            size_bytes: size,
        })
    }

    /// BLAKE3 digest of a file's contents.
    pub fn compute_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::compute(File::open(path)?)
    }

    /// True if the hash can be used as a path component in the cache layout.
    pub fn is_valid(&self) -> bool {
        self.hash.len() >= 4 && self.hash.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// A cache entry descriptor. `name` is informational only: two nodes with the
/// same digest and different names refer to the same cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub digest: Digest,
    #[serde(default)]
    pub name: String,
}

impl FileNode {
    pub fn new(digest: Digest) -> Self {
        Self {
            digest,
            name: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
