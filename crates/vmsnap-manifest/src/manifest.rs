//! Snapshot manifest and its wire encoding.

use std::io::Write;

use serde::{Deserialize, Serialize};
use vmsnap_cas::FileNode;

use crate::{ManifestError, Result, SNAPSHOT_KEY_VERSION};

pub const MANIFEST_MAGIC: &[u8; 8] = b"VMSNAPMF";

const HEADER_LEN: usize = 8 + 4 + 8;

/// VM settings a snapshot was taken with. Restoring into a VM with other
/// settings is the caller's problem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfiguration {
    pub num_cpus: u32,
    pub mem_size_mb: u64,
    pub scratch_disk_size_mb: u64,
    pub enable_networking: bool,
    pub init_dockerd: bool,
    pub enable_dockerd_tcp: bool,
    pub debug_mode: bool,
}

/// One chunk of a chunked file: its offset and content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub offset: u64,
    pub digest_hash: String,
}

impl ChunkEntry {
    pub fn new(offset: u64, digest_hash: impl Into<String>) -> Self {
        Self {
            offset,
            digest_hash: digest_hash.into(),
        }
    }
}

/// Whether `name` can be restored as a single entry of an output directory.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}

/// Descriptor of a file stored as content-addressed chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedFile {
    pub name: String,
    pub size: u64,
    pub chunk_size: u64,
    /// Ascending by offset.
    pub chunks: Vec<ChunkEntry>,
}

impl ChunkedFile {
    /// Cache size of a chunk: `min(chunk_size, size - offset)`.
    pub fn chunk_digest_size(&self, entry: &ChunkEntry) -> u64 {
        self.chunk_size.min(self.size.saturating_sub(entry.offset))
    }

    /// Check that the chunks partition `[0, size)` in ascending order.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ManifestError::InvalidChunkLayout {
            name: self.name.clone(),
            reason,
        };
        if self.chunk_size == 0 {
            return Err(invalid("chunk size is zero".into()));
        }
        let expected = self.size.div_ceil(self.chunk_size);
        if self.chunks.len() as u64 != expected {
            return Err(invalid(format!(
                "{} chunks listed, {} needed",
                self.chunks.len(),
                expected
            )));
        }
        for (i, entry) in self.chunks.iter().enumerate() {
            if entry.offset != i as u64 * self.chunk_size {
                return Err(invalid(format!("chunk {} at offset {}", i, entry.offset)));
            }
        }
        Ok(())
    }
}

/// Everything needed to restore a snapshot from the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub vm_configuration: Option<VmConfiguration>,
    /// Whole-file artifacts. `name` is the file name to restore to.
    pub files: Vec<FileNode>,
    /// Ordered by name.
    pub chunked_files: Vec<ChunkedFile>,
}

impl SnapshotManifest {
    pub fn file(&self, name: &str) -> Option<&FileNode> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn chunked_file(&self, name: &str) -> Option<&ChunkedFile> {
        self.chunked_files.iter().find(|f| f.name == name)
    }

    /// Total number of chunks across all chunked files.
    pub fn chunk_count(&self) -> usize {
        self.chunked_files.iter().map(|f| f.chunks.len()).sum()
    }

    /// Check chunk layouts and that every name stays inside an output directory.
    pub fn validate(&self) -> Result<()> {
        let names = self.files.iter().map(|f| &f.name);
        let chunked = self.chunked_files.iter().map(|f| &f.name);
        if let Some(bad) = names.chain(chunked).find(|n| !is_valid_name(n)) {
            return Err(ManifestError::InvalidFormat(format!("invalid file name {:?}", bad)));
        }
        self.chunked_files.iter().try_for_each(ChunkedFile::validate)
    }

    /// Serialize with the versioned header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.write_all(MANIFEST_MAGIC)?;
        out.write_all(&SNAPSHOT_KEY_VERSION.to_le_bytes())?;
        out.write_all(&(body.len() as u64).to_le_bytes())?;
        out.write_all(&body)?;
        Ok(out)
    }

    /// Parse and validate an encoded manifest.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ManifestError::InvalidFormat(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let (header, body) = bytes.split_at(HEADER_LEN);
        if &header[..8] != MANIFEST_MAGIC {
            return Err(ManifestError::InvalidFormat("bad magic".into()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&header[8..12]);
        let version = u32::from_le_bytes(version);
        if version != SNAPSHOT_KEY_VERSION {
            return Err(ManifestError::VersionMismatch {
                expected: SNAPSHOT_KEY_VERSION,
                found: version,
            });
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&header[12..20]);
        let len = u64::from_le_bytes(len);
        if len != body.len() as u64 {
            return Err(ManifestError::InvalidFormat(format!(
                "body is {} bytes, header says {}",
                body.len(),
                len
            )));
        }
        let manifest: Self = bincode::deserialize(body)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmsnap_cas::Digest;

    fn sample() -> SnapshotManifest {
        SnapshotManifest {
            vm_configuration: Some(VmConfiguration {
                num_cpus: 2,
                mem_size_mb: 2048,
                scratch_disk_size_mb: 4096,
                enable_networking: true,
                ..Default::default()
            }),
            files: vec![FileNode::new(Digest::new("ab12", 10)).with_name("vmlinux")],
            chunked_files: vec![ChunkedFile {
                name: "scratchfs".into(),
                size: 10,
                chunk_size: 4,
                chunks: vec![
                    ChunkEntry::new(0, "aa"),
                    ChunkEntry::new(4, "bb"),
                    ChunkEntry::new(8, "cc"),
                ],
            }],
        }
    }

    #[test]
    fn test_names_must_stay_in_output_dir() {
        assert!(is_valid_name("rootfs.ext4"));
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b"] {
            assert!(!is_valid_name(bad), "{:?}", bad);
        }

        let mut m = sample();
        m.files[0].name = "../vmlinux".into();
        let bytes = m.encode().unwrap();
        assert!(matches!(
            SnapshotManifest::decode(&bytes),
            Err(ManifestError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_encode_decode() {
        let m = sample();
        let bytes = m.encode().unwrap();
        assert_eq!(&bytes[..8], MANIFEST_MAGIC);
        let decoded = SnapshotManifest::decode(&bytes).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.chunk_count(), 3);
        assert!(decoded.file("vmlinux").is_some());
        assert!(decoded.chunked_file("scratchfs").is_some());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        assert_eq!(sample().encode().unwrap(), sample().encode().unwrap());
    }

    #[test]
    fn test_decode_rejects_other_version() {
        let mut bytes = sample().encode().unwrap();
        bytes[8..12].copy_from_slice(&(SNAPSHOT_KEY_VERSION + 1).to_le_bytes());
        assert!(matches!(
            SnapshotManifest::decode(&bytes),
            Err(ManifestError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            SnapshotManifest::decode(b"short"),
            Err(ManifestError::InvalidFormat(_))
        ));
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            SnapshotManifest::decode(&bytes),
            Err(ManifestError::InvalidFormat(_))
        ));
        let bytes = sample().encode().unwrap();
        assert!(SnapshotManifest::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_validate_rejects_gaps() {
        let mut m = sample();
        m.chunked_files[0].chunks.remove(1);
        assert!(matches!(
            m.validate(),
            Err(ManifestError::InvalidChunkLayout { .. })
        ));
        let bytes = m.encode().unwrap();
        assert!(SnapshotManifest::decode(&bytes).is_err());
    }

    #[test]
    fn test_empty_chunked_file_is_valid() {
        let file = ChunkedFile {
            name: "empty".into(),
            size: 0,
            chunk_size: 4096,
            chunks: vec![],
        };
        assert!(file.validate().is_ok());
    }
}
