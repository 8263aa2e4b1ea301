//! # vmsnap-config
//!
//! Configuration for vmsnap.
//!
//! Loads configuration from:
//! 1. `~/.vmsnap/config.toml` (global)
//! 2. `.vmsnap/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! There is no process-wide config. Callers load a [`Config`] once and pass
//! the values they need to the loader.

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const ENV_CACHE_ROOT: &str = "VMSNAP_CACHE_ROOT";
pub const ENV_ENABLE_SHARING: &str = "VMSNAP_ENABLE_LOCAL_SNAPSHOT_SHARING";
pub const ENV_CHUNK_SIZE: &str = "VMSNAP_CHUNK_SIZE";
pub const ENV_GROUP_ID: &str = "VMSNAP_GROUP_ID";

/// Default chunk size for chunked files: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub snapshot: SnapshotConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::load_from(global.as_deref(), Some(Path::new(".vmsnap/config.toml")))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Layer a project file over a global file. Missing files are skipped.
    ///
    /// Only keys present in the project file override the global values.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!("Loading config from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let layer: toml::Value = toml::from_str(&contents)?;
                merge_values(&mut merged, layer);
            }
        }
        Ok(merged.try_into()?)
    }

    /// Global config path: ~/.vmsnap/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".vmsnap/config.toml"))
    }

    /// Apply overrides from an environment lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_CACHE_ROOT) {
            self.storage.cache_root = PathBuf::from(path);
        }
        if let Some(v) = lookup(ENV_ENABLE_SHARING) {
            match parse_bool(&v) {
                Some(b) => self.snapshot.enable_local_snapshot_sharing = b,
                None => warn!(key = ENV_ENABLE_SHARING, value = %v, "ignoring invalid boolean"),
            }
        }
        if let Some(v) = lookup(ENV_CHUNK_SIZE) {
            match v.parse() {
                Ok(n) => self.snapshot.chunk_size_bytes = n,
                Err(_) => warn!(key = ENV_CHUNK_SIZE, value = %v, "ignoring invalid chunk size"),
            }
        }
        if let Some(gid) = lookup(ENV_GROUP_ID) {
            self.snapshot.group_id = gid;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "snapshot.chunk_size_bytes".into(),
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    /// Cache root with `~` expanded.
    pub fn cache_root(&self) -> PathBuf {
        normalize_path(&self.storage.cache_root.to_string_lossy())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the local file cache
    pub cache_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("~/.vmsnap/cache"),
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Key artifacts by content so runners can share snapshots
    pub enable_local_snapshot_sharing: bool,
    /// Chunk size used when converting flat files
    pub chunk_size_bytes: u64,
    /// Group used to namespace cheap keys. Empty means anonymous.
    pub group_id: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enable_local_snapshot_sharing: false,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            group_id: String::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when neither VMSNAP_LOG nor RUST_LOG is set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Robust path normalization (expands tilde)
pub fn normalize_path(p: &str) -> PathBuf {
    if let Some(stripped) = p.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(p)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (k, v) in overlay {
                match base.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.snapshot.enable_local_snapshot_sharing);
        assert_eq!(config.snapshot.chunk_size_bytes, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[snapshot]"));
        assert!(toml_str.contains("enable_local_snapshot_sharing"));
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_project_overrides_only_present_keys() {
        let dir = TempDir::new().unwrap();
        let global = dir.path().join("global.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(
            &global,
            "[storage]\ncache_root = \"/g/cache\"\n[snapshot]\nchunk_size_bytes = 1024\ngroup_id = \"g\"\n",
        )
        .unwrap();
        std::fs::write(&project, "[snapshot]\ngroup_id = \"p\"\n").unwrap();

        let config = Config::load_from(Some(&global), Some(&project)).unwrap();
        assert_eq!(config.storage.cache_root, PathBuf::from("/g/cache"));
        assert_eq!(config.snapshot.chunk_size_bytes, 1024);
        assert_eq!(config.snapshot.group_id, "p");
    }

    #[test]
    fn test_missing_files_give_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(Some(&dir.path().join("nope.toml")), None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[snapshot\n").unwrap();
        assert!(matches!(
            Config::load_from(Some(&path), None),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_CACHE_ROOT, "/tmp/vmsnap"),
            (ENV_ENABLE_SHARING, "true"),
            (ENV_CHUNK_SIZE, "65536"),
            (ENV_GROUP_ID, "GR123"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.storage.cache_root, PathBuf::from("/tmp/vmsnap"));
        assert!(config.snapshot.enable_local_snapshot_sharing);
        assert_eq!(config.snapshot.chunk_size_bytes, 65536);
        assert_eq!(config.snapshot.group_id, "GR123");
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|k| match k {
            ENV_ENABLE_SHARING => Some("maybe".into()),
            ENV_CHUNK_SIZE => Some("lots".into()),
            _ => None,
        });
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let mut config = Config::default();
        config.snapshot.chunk_size_bytes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(normalize_path("~/x"), home.join("x"));
        }
    }
}
