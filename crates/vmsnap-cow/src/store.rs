//! Ordered set of chunks covering one logical file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument};
use vmsnap_cas::Digest;

use crate::{Chunk, CowError, IoStats, IoStatsSnapshot, Result};

/// File name of the backing file for the chunk at `offset`.
pub fn chunk_name(offset: u64) -> String {
    offset.to_string()
}

/// A logical file of `total_size` bytes split into `chunk_size` chunks.
///
/// Chunks partition `[0, total_size)`: chunk `i` starts at `i * chunk_size`
/// and the last one covers the remainder.
#[derive(Debug)]
pub struct ChunkedStore {
    chunks: Vec<Chunk>,
    chunk_size: u64,
    total_size: u64,
    data_dir: PathBuf,
    stats: Arc<IoStats>,
}

impl ChunkedStore {
    /// Assemble a store from chunks in any order.
    ///
    /// Fails if the chunks do not partition `[0, total_size)`. On failure all
    /// chunks are dropped, which releases their mappings.
    pub fn new<P: AsRef<Path>>(
        mut chunks: Vec<Chunk>,
        chunk_size: u64,
        total_size: u64,
        data_dir: P,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CowError::InvalidLayout("chunk size must be non-zero".into()));
        }
        chunks.sort_by_key(Chunk::offset);

        let expected = total_size.div_ceil(chunk_size);
        if chunks.len() as u64 != expected {
            return Err(CowError::InvalidLayout(format!(
                "expected {} chunks for {} bytes at chunk size {}, got {}",
                expected,
                total_size,
                chunk_size,
                chunks.len()
            )));
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let want = i as u64 * chunk_size;
            if chunk.offset() != want {
                return Err(CowError::InvalidLayout(format!(
                    "chunk {} has offset {}, expected {}",
                    i,
                    chunk.offset(),
                    want
                )));
            }
        }

        let stats = Arc::new(IoStats::default());
        for chunk in &mut chunks {
            chunk.attach_stats(Arc::clone(&stats));
        }

        Ok(Self {
            chunks,
            chunk_size,
            total_size,
            data_dir: data_dir.as_ref().to_path_buf(),
            stats,
        })
    }

    /// Split a flat file into chunk files under `output_dir`.
    ///
    /// Digests are computed while splitting, so the returned chunks are clean
    /// and already know their digests.
    #[instrument(skip(path, output_dir), level = "debug")]
    pub fn from_flat_file<P: AsRef<Path>, Q: AsRef<Path>>(
        path: P,
        chunk_size: u64,
        output_dir: Q,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CowError::InvalidLayout("chunk size must be non-zero".into()));
        }
        let output_dir = output_dir.as_ref();
        let mut source = File::open(path.as_ref())?;
        let total_size = source.metadata()?.len();
        fs::create_dir_all(output_dir)?;

        let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
        let mut buf = vec![0u8; chunk_size.min(total_size) as usize];
        let mut offset = 0u64;
        while offset < total_size {
            let len = chunk_size.min(total_size - offset) as usize;
            source.read_exact(&mut buf[..len])?;

            let chunk_path = output_dir.join(chunk_name(offset));
            // A leftover chunk file may share its inode with a cache entry.
            // Unlink it and write a fresh file instead of truncating.
            match fs::remove_file(&chunk_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let mut out = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&chunk_path)?;
            out.write_all(&buf[..len])?;

            let mut chunk = Chunk::lazy(chunk_path, offset);
            chunk.set_digest(Digest::of_bytes(&buf[..len]));
            chunks.push(chunk);
            offset += len as u64;
        }

        let store = Self::new(chunks, chunk_size, total_size, output_dir)?;
        store.stats.add_read(total_size);
        store.stats.add_hashed(total_size);
        debug!(chunks = store.chunks.len(), total_size, "converted flat file");
        Ok(store)
    }

    /// Logical size of the file.
    pub fn size_bytes(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size
    }

    /// Directory holding the chunk files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Backing file name for the chunk at `offset`.
    pub fn chunk_name(&self, offset: u64) -> String {
        chunk_name(offset)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Logical size of the chunk at `offset`: `min(chunk_size, total - offset)`.
    pub fn chunk_logical_size(&self, offset: u64) -> u64 {
        self.chunk_size.min(self.total_size.saturating_sub(offset))
    }

    /// Chunks in ascending offset order.
    pub fn sorted_chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Chunks in ascending offset order, for parallel per-chunk work.
    pub fn sorted_chunks_mut(&mut self) -> &mut [Chunk] {
        &mut self.chunks
    }

    pub fn chunk(&self, offset: u64) -> Option<&Chunk> {
        self.index(offset).map(|i| &self.chunks[i])
    }

    pub fn chunk_mut(&mut self, offset: u64) -> Option<&mut Chunk> {
        self.index(offset).map(move |i| &mut self.chunks[i])
    }

    /// True if the chunk starting at `offset` was written since its last sync.
    pub fn dirty(&self, offset: u64) -> bool {
        self.chunk(offset).is_some_and(Chunk::is_dirty)
    }

    pub fn dirty_chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_dirty()).count()
    }

    /// Read from the logical file. Returns the number of bytes read, which
    /// is short only at end of file.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.total_size {
            return Ok(0);
        }
        let end = self.total_size.min(offset + buf.len() as u64);
        let mut pos = offset;
        while pos < end {
            let (idx, within, n) = self.span(pos, end);
            let dst = (pos - offset) as usize;
            self.chunks[idx].read_at(within, &mut buf[dst..dst + n as usize])?;
            pos += n;
        }
        Ok((end - offset) as usize)
    }

    /// Write into the logical file. The file cannot grow.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.total_size)
            .ok_or(CowError::OutOfBounds {
                offset,
                len: data.len() as u64,
                size: self.total_size,
            })?;
        let mut pos = offset;
        while pos < end {
            let (idx, within, n) = self.span(pos, end);
            let src = (pos - offset) as usize;
            self.chunks[idx].write_at(within, &data[src..src + n as usize])?;
            pos += n;
        }
        Ok(())
    }

    /// Sync every dirty chunk.
    pub fn sync(&mut self) -> Result<()> {
        for chunk in self.chunks.iter_mut().filter(|c| c.is_dirty()) {
            chunk.sync()?;
        }
        Ok(())
    }

    /// Reassemble the logical file at `path`.
    pub fn write_flat_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        let mut buf = vec![0u8; self.chunk_size.min(self.total_size) as usize];
        for i in 0..self.chunks.len() {
            let offset = self.chunks[i].offset();
            let len = self.chunk_logical_size(offset) as usize;
            self.chunks[i].read_at(0, &mut buf[..len])?;
            out.write_all(&buf[..len])?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn io_stats(&self) -> IoStatsSnapshot {
        self.stats.snapshot()
    }

    fn index(&self, offset: u64) -> Option<usize> {
        if offset % self.chunk_size != 0 {
            return None;
        }
        let i = (offset / self.chunk_size) as usize;
        (i < self.chunks.len()).then_some(i)
    }

    /// Chunk index, offset within it, and length of the piece of
    /// `[pos, end)` that falls in that chunk.
    fn span(&self, pos: u64, end: u64) -> (usize, u64, u64) {
        let idx = (pos / self.chunk_size) as usize;
        let within = pos % self.chunk_size;
        let n = (self.chunk_size - within).min(end - pos);
        (idx, within, n)
    }
}
