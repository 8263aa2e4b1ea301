//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - a temporary cache root
//! - a work directory holding the files a VM would produce
//! - fresh restore directories
//!
//! # Usage
//!
//! ```ignore
//! use vmsnap_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! let disk = env.create_patterned_file("scratchfs.ext4", 10 << 20, 7)?;
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated file cache root
    pub cache_root: PathBuf,
    /// Where test artifacts are created
    pub work_dir: PathBuf,
    /// Parent of restore directories
    pub restore_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let cache_root = root.join("cache");
        let work_dir = root.join("work");
        let restore_root = root.join("restore");

        std::fs::create_dir_all(&cache_root)?;
        std::fs::create_dir_all(&work_dir)?;
        std::fs::create_dir_all(&restore_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            cache_root,
            work_dir,
            restore_root,
            test_id,
        })
    }

    /// Config pointing at this environment's cache.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.cache_root = self.cache_root.clone();
        cfg
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a file of `len` bytes whose content depends on `seed`.
    pub fn create_patterned_file(
        &self,
        relative_path: &str,
        len: usize,
        seed: u8,
    ) -> anyhow::Result<PathBuf> {
        self.create_file(relative_path, &pattern(len, seed))
    }

    /// Create a test directory
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// A new, empty directory to unpack a snapshot into.
    pub fn restore_dir(&self, name: &str) -> anyhow::Result<PathBuf> {
        let path = self.restore_root.join(name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

/// Deterministic, non-repeating-per-chunk test content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 251) as u8).wrapping_mul(31) ^ (i as u8).wrapping_add(seed))
        .collect()
}
