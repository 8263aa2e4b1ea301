//! Shared fixtures for loader integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vmsnap_cas::{FileCache, FileNode, LocalFileCache};
use vmsnap_config::testing::TestEnvironment;
use vmsnap_loader::{FileCacheLoader, LoaderOptions};
use vmsnap_manifest::{Platform, SnapshotKey};

pub const MIB: usize = 1024 * 1024;

/// [`LocalFileCache`] that counts calls.
pub struct CountingCache {
    inner: LocalFileCache,
    pub adds: AtomicUsize,
    pub writes: AtomicUsize,
    pub links: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl CountingCache {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalFileCache::new(root).unwrap(),
            adds: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            links: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Remove an entry behind the loader's back, as eviction would.
    pub fn evict(&self, node: &FileNode) {
        self.inner.delete_file(node).unwrap();
    }

    pub fn inner(&self) -> &LocalFileCache {
        &self.inner
    }
}

impl FileCache for CountingCache {
    fn contains_file(&self, node: &FileNode) -> bool {
        self.inner.contains_file(node)
    }

    fn add_file(&self, node: &FileNode, source: &Path) -> vmsnap_cas::Result<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.inner.add_file(node, source)
    }

    fn fast_link_file(&self, node: &FileNode, dest: &Path) -> bool {
        self.links.fetch_add(1, Ordering::SeqCst);
        self.inner.fast_link_file(node, dest)
    }

    fn delete_file(&self, node: &FileNode) -> vmsnap_cas::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_file(node)
    }

    fn read(&self, node: &FileNode) -> vmsnap_cas::Result<Vec<u8>> {
        self.inner.read(node)
    }

    fn write(&self, node: &FileNode, data: &[u8]) -> vmsnap_cas::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(node, data)
    }
}

pub struct Fixture {
    pub env: TestEnvironment,
    pub cache: Arc<CountingCache>,
    pub loader: FileCacheLoader,
}

pub fn fixture(sharing: bool) -> Fixture {
    let env = TestEnvironment::new().unwrap();
    let cache = Arc::new(CountingCache::new(&env.cache_root));
    let loader = FileCacheLoader::new(
        LoaderOptions::new()
            .with_cache(cache.clone())
            .with_local_snapshot_sharing(sharing),
    )
    .unwrap();
    Fixture { env, cache, loader }
}

/// A second loader over the same cache, as another runner would have.
pub fn loader_for(cache: &Arc<CountingCache>, sharing: bool) -> FileCacheLoader {
    FileCacheLoader::new(
        LoaderOptions::new()
            .with_cache(cache.clone())
            .with_local_snapshot_sharing(sharing),
    )
    .unwrap()
}

pub fn key(runner_id: &str) -> SnapshotKey {
    let platform = Platform::new()
        .with("OSFamily", "linux")
        .with("container-image", "docker://gcr.io/test/image:latest");
    SnapshotKey::new("default", &platform, "config-hash", runner_id).unwrap()
}
