//! A single chunk of a chunked file, backed by its own file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use tracing::debug;
use vmsnap_cas::Digest;

use crate::{CowError, IoStats, Result};

/// Lifecycle state of a chunk's mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Backing file not mapped yet (or released)
    Unmapped,
    /// Mapped read-only; contents match the backing file
    MappedClean,
    /// Mapped writable and written since the last sync
    MappedDirty,
}

enum Mapping {
    Unmapped,
    Clean(Mmap),
    Dirty(MmapMut),
}

impl Mapping {
    fn is_mapped(&self) -> bool {
        !matches!(self, Mapping::Unmapped)
    }
}

/// One contiguous byte range of a chunked file.
///
/// Transitions:
/// - first read / digest: `Unmapped -> MappedClean`
/// - write: `Unmapped | MappedClean -> MappedDirty`
/// - sync: `MappedDirty -> MappedClean`
/// - release / drop: `* -> Unmapped`
pub struct Chunk {
    offset: u64,
    path: PathBuf,
    mapping: Mapping,
    digest: Option<Digest>,
    stats: Arc<IoStats>,
}

impl Chunk {
    /// A chunk backed by `path`, mapped on first access.
    pub fn lazy<P: AsRef<Path>>(path: P, offset: u64) -> Self {
        Self {
            offset,
            path: path.as_ref().to_path_buf(),
            mapping: Mapping::Unmapped,
            digest: None,
            stats: Arc::default(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ChunkState {
        match self.mapping {
            Mapping::Unmapped => ChunkState::Unmapped,
            Mapping::Clean(_) => ChunkState::MappedClean,
            Mapping::Dirty(_) => ChunkState::MappedDirty,
        }
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.mapping, Mapping::Dirty(_))
    }

    /// Size of the backing file. Does not map the chunk.
    pub fn size_bytes(&self) -> Result<u64> {
        match &self.mapping {
            Mapping::Clean(m) => Ok(m.len() as u64),
            Mapping::Dirty(m) => Ok(m.len() as u64),
            Mapping::Unmapped => fs::metadata(&self.path)
                .map(|m| m.len())
                .map_err(|e| self.access_error(e)),
        }
    }

    /// Memoize a digest known to match the backing file.
    pub fn set_digest(&mut self, digest: Digest) {
        self.digest = Some(digest);
    }

    /// Content digest. Memoized while the chunk stays clean.
    pub fn digest(&mut self) -> Result<Digest> {
        if !self.is_dirty() {
            if let Some(d) = &self.digest {
                return Ok(d.clone());
            }
        }
        let stats = Arc::clone(&self.stats);
        let bytes = self.bytes()?;
        let digest = Digest::of_bytes(bytes);
        stats.add_hashed(digest.size_bytes);
        if !self.is_dirty() {
            self.digest = Some(digest.clone());
        }
        Ok(digest)
    }

    /// Copy bytes starting at `offset` (relative to the chunk) into `buf`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes()?;
        let range = bounded(offset, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    /// Write `data` at `offset` (relative to the chunk). Marks the chunk dirty.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let map = self.writable()?;
        let range = bounded(offset, data.len(), map.len())?;
        map[range].copy_from_slice(data);
        self.digest = None;
        Ok(())
    }

    /// Flush writes to the backing file and return to the clean state.
    pub fn sync(&mut self) -> Result<()> {
        let Mapping::Dirty(map) = &self.mapping else {
            return Ok(());
        };
        map.flush()?;
        let file = File::open(&self.path).map_err(|e| self.access_error(e))?;
        let clean = unsafe { Mmap::map(&file) }?;
        self.set_mapping(Mapping::Clean(clean));
        self.stats.mapped();
        Ok(())
    }

    /// Drop the mapping. Dirty chunks are synced first so no write is lost.
    pub fn release(&mut self) -> Result<()> {
        self.sync()?;
        self.set_mapping(Mapping::Unmapped);
        Ok(())
    }

    /// Share counters with the owning store.
    pub(crate) fn attach_stats(&mut self, stats: Arc<IoStats>) {
        if self.mapping.is_mapped() {
            self.stats.unmapped();
            stats.mapped();
        }
        self.stats = stats;
    }

    fn bytes(&mut self) -> Result<&[u8]> {
        if !self.mapping.is_mapped() {
            let file = File::open(&self.path).map_err(|e| self.access_error(e))?;
            let map = unsafe { Mmap::map(&file) }?;
            self.set_mapping(Mapping::Clean(map));
            self.stats.mapped();
        }
        Ok(match &self.mapping {
            Mapping::Clean(m) => &m[..],
            Mapping::Dirty(m) => &m[..],
            Mapping::Unmapped => &[],
        })
    }

    fn writable(&mut self) -> Result<&mut MmapMut> {
        if !self.is_dirty() {
            // The read-only mapping must go before the file is replaced.
            self.set_mapping(Mapping::Unmapped);
            self.break_link()?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .map_err(|e| self.access_error(e))?;
            let map = unsafe { MmapMut::map_mut(&file) }?;
            self.set_mapping(Mapping::Dirty(map));
            self.stats.mapped();
            self.digest = None;
        }
        match &mut self.mapping {
            Mapping::Dirty(m) => Ok(m),
            _ => Err(CowError::InvalidLayout(format!(
                "chunk at offset {} not writable",
                self.offset
            ))),
        }
    }

    /// Give the chunk a private inode if its backing file is shared with
    /// another path (typically a cache entry).
    fn break_link(&self) -> Result<()> {
        let meta = fs::metadata(&self.path).map_err(|e| self.access_error(e))?;
        if meta.nlink() <= 1 {
            return Ok(());
        }
        let temp = self.path.with_extension("cow.tmp");
        let _ = fs::remove_file(&temp);
        if let Err(e) = fs::copy(&self.path, &temp).and_then(|_| fs::rename(&temp, &self.path)) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        self.stats.link_broken();
        debug!(path = %self.path.display(), "broke shared chunk link before write");
        Ok(())
    }

    fn set_mapping(&mut self, mapping: Mapping) {
        if self.mapping.is_mapped() {
            self.stats.unmapped();
        }
        self.mapping = mapping;
    }

    fn access_error(&self, e: io::Error) -> CowError {
        if e.kind() == io::ErrorKind::NotFound {
            CowError::MissingBacking {
                path: self.path.clone(),
            }
        } else {
            CowError::Io(e)
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.mapping.is_mapped() {
            self.stats.unmapped();
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("offset", &self.offset)
            .field("path", &self.path)
            .field("state", &self.state())
            .field("digest", &self.digest)
            .finish()
    }
}

fn bounded(offset: u64, len: usize, size: usize) -> Result<std::ops::Range<usize>> {
    let start = offset as usize;
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(CowError::OutOfBounds {
            offset,
            len: len as u64,
            size: size as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk_with(dir: &TempDir, content: &[u8]) -> Chunk {
        let path = dir.path().join("0");
        fs::write(&path, content).unwrap();
        Chunk::lazy(path, 0)
    }

    #[test]
    fn test_lazy_chunk_maps_on_first_access() {
        let dir = TempDir::new().unwrap();
        let mut chunk = chunk_with(&dir, b"hello chunk");
        assert_eq!(chunk.state(), ChunkState::Unmapped);

        let mut buf = [0u8; 5];
        chunk.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"chunk");
        assert_eq!(chunk.state(), ChunkState::MappedClean);
    }

    #[test]
    fn test_missing_backing_fails_on_access() {
        let dir = TempDir::new().unwrap();
        let mut chunk = Chunk::lazy(dir.path().join("404"), 0);
        assert!(matches!(
            chunk.digest(),
            Err(CowError::MissingBacking { .. })
        ));
    }

    #[test]
    fn test_write_marks_dirty_and_sync_cleans() {
        let dir = TempDir::new().unwrap();
        let mut chunk = chunk_with(&dir, b"aaaa");
        let before = chunk.digest().unwrap();

        chunk.write_at(1, b"bb").unwrap();
        assert_eq!(chunk.state(), ChunkState::MappedDirty);

        chunk.sync().unwrap();
        assert_eq!(chunk.state(), ChunkState::MappedClean);
        assert_eq!(fs::read(chunk.path()).unwrap(), b"abba");

        let after = chunk.digest().unwrap();
        assert_ne!(before, after);
        assert_eq!(after, Digest::of_bytes(b"abba"));
    }

    #[test]
    fn test_memoized_digest_skips_hashing() {
        let dir = TempDir::new().unwrap();
        let mut chunk = chunk_with(&dir, b"known");
        chunk.set_digest(Digest::of_bytes(b"known"));

        assert_eq!(chunk.digest().unwrap(), Digest::of_bytes(b"known"));
        assert_eq!(chunk.stats.snapshot().bytes_hashed, 0);
        assert_eq!(chunk.state(), ChunkState::Unmapped);
    }

    #[test]
    fn test_write_invalidates_memoized_digest() {
        let dir = TempDir::new().unwrap();
        let mut chunk = chunk_with(&dir, b"xxxx");
        chunk.set_digest(Digest::of_bytes(b"xxxx"));

        chunk.write_at(0, b"y").unwrap();
        assert_eq!(chunk.digest().unwrap(), Digest::of_bytes(b"yxxx"));
    }

    #[test]
    fn test_write_breaks_shared_link() {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("cache_entry");
        fs::write(&shared, b"immutable").unwrap();
        let path = dir.path().join("0");
        fs::hard_link(&shared, &path).unwrap();

        let mut chunk = Chunk::lazy(&path, 0);
        chunk.write_at(0, b"I").unwrap();
        chunk.sync().unwrap();

        assert_eq!(fs::read(&shared).unwrap(), b"immutable");
        assert_eq!(fs::read(&path).unwrap(), b"Immutable");
        assert_eq!(chunk.stats.snapshot().link_breaks, 1);
    }

    #[test]
    fn test_out_of_bounds_write() {
        let dir = TempDir::new().unwrap();
        let mut chunk = chunk_with(&dir, b"abc");
        assert!(matches!(
            chunk.write_at(2, b"zz"),
            Err(CowError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_release_tracks_mappings() {
        let dir = TempDir::new().unwrap();
        let mut chunk = chunk_with(&dir, b"data");
        chunk.write_at(0, b"D").unwrap();
        assert_eq!(chunk.stats.snapshot().live_mappings, 1);

        chunk.release().unwrap();
        assert_eq!(chunk.state(), ChunkState::Unmapped);
        assert_eq!(chunk.stats.snapshot().live_mappings, 0);
        assert_eq!(fs::read(chunk.path()).unwrap(), b"Data");
    }
}
