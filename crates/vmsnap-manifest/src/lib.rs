//! # vmsnap-manifest
//!
//! Snapshot keys and the manifest that describes a saved snapshot.
//!
//! A manifest lists whole-file artifacts by cache node and chunked files by
//! their ordered `(offset, digest)` pairs. It is stored in the file cache
//! under a key derived from the [`SnapshotKey`] (see [`keys`]).
//!
//! ## Wire format
//!
//! ```text
//! +----------+-------------+-------------+-----------------+
//! | magic(8) | version u32 | length u64  | bincode body    |
//! +----------+-------------+-------------+-----------------+
//! ```
//!
//! Integers are little-endian. `version` is [`SNAPSHOT_KEY_VERSION`].

pub mod keys;
mod manifest;

pub use keys::{
    artifact_file_node, chunk_file_node, hash_string, hash_strings, manifest_file_node, KeyMode,
    MANIFEST_FILE_NAME, SNAPSHOT_KEY_VERSION,
};
pub use manifest::{
    is_valid_name, ChunkEntry, ChunkedFile, SnapshotManifest, VmConfiguration, MANIFEST_MAGIC,
};

use std::io;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Errors that can occur during manifest operations
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Invalid manifest: {0}")]
    InvalidFormat(String),

    #[error("Manifest version {found} does not match expected version {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Invalid chunk layout for {name}: {reason}")]
    InvalidChunkLayout { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// One platform property requested by an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformProperty {
    pub name: String,
    pub value: String,
}

/// The platform a snapshot was built for. Property order is significant
/// for the platform hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub properties: Vec<PlatformProperty>,
}

impl Platform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push(PlatformProperty {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// SHA-256 of the serialized platform, hex encoded.
    ///
    /// This identifies the platform structure and is unrelated to the BLAKE3
    /// content digests used for artifacts and chunks.
    pub fn hash(&self) -> Result<String> {
        let bytes = bincode::serialize(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Identifies a snapshot. Two keys are equal iff all fields match.
///
/// With local sharing disabled, `runner_id` makes the key exclusive to one
/// runner. With sharing enabled it may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub instance_name: String,
    pub platform_hash: String,
    pub configuration_hash: String,
    pub runner_id: String,
}

impl SnapshotKey {
    /// Build a key for a task, hashing its platform.
    pub fn new(
        instance_name: impl Into<String>,
        platform: &Platform,
        configuration_hash: impl Into<String>,
        runner_id: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            instance_name: instance_name.into(),
            platform_hash: platform.hash()?,
            configuration_hash: configuration_hash.into(),
            runner_id: runner_id.into(),
        })
    }
}
