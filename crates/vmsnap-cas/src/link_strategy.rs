//! Zero-copy file materialization for cache entries.
//!
//! Cache blobs and the files handed out to callers share storage whenever the
//! platform allows it:
//!
//! - **Linux**: hard_link, then reflink (btrfs, xfs) across devices, then copy
//! - **Other Unix**: hard_link, then copy

use std::fs;
use std::io;
use std::path::Path;

/// Platform-specific strategy for linking a file into a new location.
pub trait LinkStrategy: Send + Sync {
    /// Materialize `source` at `target`. `target` must not exist.
    fn link_file(&self, source: &Path, target: &Path) -> io::Result<()>;

    /// Name of this strategy (for logging)
    fn name(&self) -> &'static str;
}

/// Linux: hard_link → reflink → copy
#[cfg(target_os = "linux")]
pub struct LinuxLinkStrategy;

#[cfg(target_os = "linux")]
impl LinkStrategy for LinuxLinkStrategy {
    fn link_file(&self, source: &Path, target: &Path) -> io::Result<()> {
        match fs::hard_link(source, target) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(e),
            // EXDEV or EMLINK: fall through
            Err(_) => {}
        }

        if reflink_copy::reflink(source, target).is_ok() {
            return Ok(());
        }

        fs::copy(source, target)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "linux-hardlink"
    }
}

/// Generic Unix fallback: hard_link → copy
#[cfg(not(target_os = "linux"))]
pub struct UnixLinkStrategy;

#[cfg(not(target_os = "linux"))]
impl LinkStrategy for UnixLinkStrategy {
    fn link_file(&self, source: &Path, target: &Path) -> io::Result<()> {
        match fs::hard_link(source, target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
            Err(_) => {
                fs::copy(source, target)?;
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "unix-generic"
    }
}

/// Get the platform-optimal LinkStrategy
#[cfg(target_os = "linux")]
pub fn get_strategy() -> &'static dyn LinkStrategy {
    static STRATEGY: LinuxLinkStrategy = LinuxLinkStrategy;
    &STRATEGY
}

#[cfg(not(target_os = "linux"))]
pub fn get_strategy() -> &'static dyn LinkStrategy {
    static STRATEGY: UnixLinkStrategy = UnixLinkStrategy;
    &STRATEGY
}
