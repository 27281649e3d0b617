//! Persistence configuration via `tidepool.toml`
//!
//! On first open a commented default `tidepool.toml` is created in the data
//! directory. To change settings, edit the file and reopen.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tidepool_core::{Error, Result};

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "tidepool.toml";

/// Default LRU threshold for the server cache (10 MiB).
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Smallest accepted LRU threshold (1 MiB).
pub const MIN_CACHE_SIZE_BYTES: u64 = 1024 * 1024;

/// Storage backend selected at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// KV-log backed, survives restarts
    Durable,
    /// Server cache held in memory only
    Memory,
    /// Nothing is stored
    Disabled,
}

/// Persistence configuration loaded from `tidepool.toml`.
///
/// # Example
///
/// ```toml
/// backend = "durable"
/// cache_size_bytes = 10485760
/// sync_on_commit = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Backend: `"durable"`, `"memory"` or `"disabled"`.
    #[serde(default = "default_backend_str")]
    pub backend: String,
    /// Server cache size above which the LRU policy prunes.
    #[serde(default = "default_cache_size_bytes")]
    pub cache_size_bytes: u64,
    /// fsync every committed transaction.
    #[serde(default = "default_sync_on_commit")]
    pub sync_on_commit: bool,
}

fn default_backend_str() -> String {
    "durable".to_string()
}

fn default_cache_size_bytes() -> u64 {
    DEFAULT_CACHE_SIZE_BYTES
}

fn default_sync_on_commit() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            backend: default_backend_str(),
            cache_size_bytes: default_cache_size_bytes(),
            sync_on_commit: default_sync_on_commit(),
        }
    }
}

impl PersistenceConfig {
    /// Durable backend without fsync, for tests.
    pub fn for_testing() -> Self {
        PersistenceConfig {
            sync_on_commit: false,
            ..PersistenceConfig::default()
        }
    }

    /// Builder: select the backend by name.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Builder: set the LRU threshold.
    pub fn with_cache_size_bytes(mut self, bytes: u64) -> Self {
        self.cache_size_bytes = bytes;
        self
    }

    /// Parse the backend string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unknown backend name.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        match self.backend.as_str() {
            "durable" => Ok(BackendKind::Durable),
            "memory" => Ok(BackendKind::Memory),
            "disabled" => Ok(BackendKind::Disabled),
            other => Err(Error::InvalidConfig(format!(
                "invalid backend '{other}' in {CONFIG_FILE_NAME}, expected \"durable\", \"memory\" or \"disabled\""
            ))),
        }
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        self.backend_kind()?;
        if self.cache_size_bytes < MIN_CACHE_SIZE_BYTES {
            return Err(Error::InvalidConfig(format!(
                "cache_size_bytes must be at least {MIN_CACHE_SIZE_BYTES}, got {}",
                self.cache_size_bytes
            )));
        }
        Ok(())
    }

    /// Default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tidepool persistence configuration
#
# Backend: "durable" (default), "memory" or "disabled"
#   "durable"  = KV log in this directory, survives restarts
#   "memory"   = server cache kept in memory for this session only
#   "disabled" = nothing is cached
backend = "durable"

# Prune least recently used queries once the server cache exceeds this
# many bytes. Minimum 1048576 (1 MiB).
cache_size_bytes = 10485760

# fsync every committed transaction (default: true)
sync_on_commit = true
"#
    }

    /// Read, parse and validate config from `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        let config: PersistenceConfig = toml::from_str(&content).map_err(|e| {
            Error::InvalidConfig(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file unless one exists.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize to TOML and write to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::serialization(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_parses_to_default() {
        let config: PersistenceConfig = toml::from_str(PersistenceConfig::default_toml()).unwrap();
        assert_eq!(config, PersistenceConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: PersistenceConfig = toml::from_str("backend = \"memory\"").unwrap();
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Memory);
        assert_eq!(config.cache_size_bytes, DEFAULT_CACHE_SIZE_BYTES);
        assert!(config.sync_on_commit);
    }

    #[test]
    fn test_write_default_if_missing_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        PersistenceConfig::write_default_if_missing(&path).unwrap();
        let config = PersistenceConfig::from_file(&path).unwrap();
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Durable);

        // Existing files are left alone.
        std::fs::write(&path, "backend = \"disabled\"\n").unwrap();
        PersistenceConfig::write_default_if_missing(&path).unwrap();
        let config = PersistenceConfig::from_file(&path).unwrap();
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Disabled);
    }

    #[test]
    fn test_write_to_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = PersistenceConfig::default()
            .with_backend("memory")
            .with_cache_size_bytes(2 * MIN_CACHE_SIZE_BYTES);
        config.write_to_file(&path).unwrap();
        assert_eq!(PersistenceConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_backend_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "backend = \"cloud\"\n").unwrap();
        let err = PersistenceConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(err.to_string().contains("cloud"));
    }

    #[test]
    fn test_small_cache_rejected() {
        let config = PersistenceConfig::default().with_cache_size_bytes(1024);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_unreadable_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = PersistenceConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
