//! Cache key derivation for snapshot artifacts, chunks, and manifests.
//!
//! Two modes exist. [`KeyMode::Digest`] reads the artifact and uses its
//! BLAKE3 digest, so identical content from any runner maps to the same
//! entry. [`KeyMode::Cheap`] never reads content: the key is a hash of the
//! snapshot key fields and the file name. Cheap keys are only usable with a
//! cache that does not verify digests.

use std::path::Path;

use sha2::{Digest as _, Sha256};
use vmsnap_cas::{Digest, FileNode};

use crate::{ChunkEntry, ChunkedFile, Result, SnapshotKey};

/// Mixed into every cheap key and written into the manifest header.
/// Bump when snapshots become incompatible with older runners.
pub const SNAPSHOT_KEY_VERSION: u32 = 1;

/// Sentinel file name for the manifest entry. No such file exists on disk.
pub const MANIFEST_FILE_NAME: &str = ".manifest";

const MANIFEST_NOMINAL_SIZE: u64 = 1;

/// How artifact cache keys are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Content digest of the artifact bytes.
    Digest,
    /// Hash of the snapshot key and file name, plus the file size.
    Cheap,
}

impl KeyMode {
    /// Sharing snapshots across runners requires content addressing.
    pub fn for_sharing(enable_local_snapshot_sharing: bool) -> Self {
        if enable_local_snapshot_sharing {
            KeyMode::Digest
        } else {
            KeyMode::Cheap
        }
    }
}

/// SHA-256 of a string, hex encoded.
pub fn hash_string(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// Hash of the concatenated per-part hashes. Hashing each part first keeps
/// `("ab", "c")` and `("a", "bc")` distinct.
pub fn hash_strings<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined: String = parts
        .into_iter()
        .map(|p| hash_string(p.as_ref()))
        .collect();
    hash_string(&joined)
}

fn cheap_node(group_id: &str, key: &SnapshotKey, file_name: &str, size_bytes: u64) -> FileNode {
    let version = SNAPSHOT_KEY_VERSION.to_string();
    let hash = hash_strings([
        version.as_str(),
        group_id,
        &key.instance_name,
        &key.platform_hash,
        &key.configuration_hash,
        &key.runner_id,
        file_name,
    ]);
    FileNode::new(Digest::new(hash, size_bytes)).with_name(file_name)
}

/// Cache node for a whole-file artifact at `path`.
///
/// The node's name is the artifact's base file name. In digest mode the file
/// is read in full.
pub fn artifact_file_node(
    mode: KeyMode,
    group_id: &str,
    key: &SnapshotKey,
    path: &Path,
    size_bytes: u64,
) -> Result<FileNode> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match mode {
        KeyMode::Digest => Ok(FileNode::new(Digest::compute_file(path)?).with_name(file_name)),
        KeyMode::Cheap => Ok(cheap_node(group_id, key, &file_name, size_bytes)),
    }
}

/// Cache node for the manifest of `key`. Always cheaply keyed, so the newest
/// save for a key overwrites older manifests.
pub fn manifest_file_node(group_id: &str, key: &SnapshotKey) -> FileNode {
    cheap_node(group_id, key, MANIFEST_FILE_NAME, MANIFEST_NOMINAL_SIZE)
}

/// Cache node for one chunk of a chunked file.
pub fn chunk_file_node(file: &ChunkedFile, entry: &ChunkEntry) -> FileNode {
    let digest = Digest::new(entry.digest_hash.clone(), file.chunk_digest_size(entry));
    FileNode::new(digest).with_name(entry.offset.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn key(runner: &str) -> SnapshotKey {
        SnapshotKey {
            instance_name: "default".into(),
            platform_hash: "p".into(),
            configuration_hash: "c".into(),
            runner_id: runner.into(),
        }
    }

    #[test]
    fn test_hash_strings_separates_parts() {
        assert_ne!(hash_strings(["ab", "c"]), hash_strings(["a", "bc"]));
        assert_eq!(hash_strings(["a", "b"]), hash_strings(vec!["a".to_string(), "b".into()]));
        assert_eq!(hash_strings(["x"]).len(), 64);
    }

    #[test]
    fn test_cheap_key_ignores_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mem.snap");
        fs::write(&path, b"one").unwrap();
        let a = artifact_file_node(KeyMode::Cheap, "g", &key("r1"), &path, 3).unwrap();
        fs::write(&path, b"two").unwrap();
        let b = artifact_file_node(KeyMode::Cheap, "g", &key("r1"), &path, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name, "mem.snap");
        assert_eq!(a.digest.size_bytes, 3);
    }

    #[test]
    fn test_cheap_key_namespaced_by_group_and_runner() {
        let path = Path::new("/tmp/vmstate.snap");
        let base = artifact_file_node(KeyMode::Cheap, "g", &key("r1"), path, 10).unwrap();
        let other_group = artifact_file_node(KeyMode::Cheap, "h", &key("r1"), path, 10).unwrap();
        let other_runner = artifact_file_node(KeyMode::Cheap, "g", &key("r2"), path, 10).unwrap();
        assert_ne!(base.digest, other_group.digest);
        assert_ne!(base.digest, other_runner.digest);
    }

    #[test]
    fn test_digest_key_shared_across_runners() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rootfs.ext4");
        fs::write(&path, b"filesystem bytes").unwrap();
        let a = artifact_file_node(KeyMode::Digest, "g", &key("r1"), &path, 16).unwrap();
        let b = artifact_file_node(KeyMode::Digest, "h", &key("r2"), &path, 16).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest, Digest::of_bytes(b"filesystem bytes"));
    }

    #[test]
    fn test_digest_key_missing_file() {
        let result = artifact_file_node(KeyMode::Digest, "", &key(""), Path::new("/nonexistent/x"), 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_manifest_node() {
        let node = manifest_file_node("g", &key("r1"));
        assert_eq!(node.name, MANIFEST_FILE_NAME);
        assert_eq!(node.digest.size_bytes, 1);
        assert_ne!(node.digest, manifest_file_node("", &key("r1")).digest);
    }

    #[test]
    fn test_key_mode_for_sharing() {
        assert_eq!(KeyMode::for_sharing(true), KeyMode::Digest);
        assert_eq!(KeyMode::for_sharing(false), KeyMode::Cheap);
    }

    #[test]
    fn test_chunk_node_size_of_last_chunk() {
        let file = ChunkedFile {
            name: "scratchfs".into(),
            size: 10,
            chunk_size: 4,
            chunks: vec![
                ChunkEntry::new(0, "aa"),
                ChunkEntry::new(4, "bb"),
                ChunkEntry::new(8, "cc"),
            ],
        };
        assert_eq!(chunk_file_node(&file, &file.chunks[0]).digest.size_bytes, 4);
        let last = chunk_file_node(&file, &file.chunks[2]);
        assert_eq!(last.digest, Digest::new("cc", 2));
        assert_eq!(last.name, "8");
    }
}
