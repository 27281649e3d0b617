//! Key-value log configuration

use crate::error::{KvError, KvResult};

/// Default smallest log size eligible for compaction (1 MiB)
pub const DEFAULT_COMPACTION_MIN_LOG_BYTES: u64 = 1024 * 1024;

/// Default dead-byte ratio that triggers compaction
pub const DEFAULT_COMPACTION_GARBAGE_RATIO: f64 = 0.5;

/// Configuration for a [`KvStore`](crate::KvStore)
///
/// Controls fsync behavior and automatic compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct KvConfig {
    /// fsync after every committed batch
    pub sync_on_commit: bool,
    /// Logs smaller than this are never compacted automatically
    pub compaction_min_log_bytes: u64,
    /// Compact when dead bytes exceed this fraction of the log, in (0, 1]
    pub compaction_garbage_ratio: f64,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig {
            sync_on_commit: true,
            compaction_min_log_bytes: DEFAULT_COMPACTION_MIN_LOG_BYTES,
            compaction_garbage_ratio: DEFAULT_COMPACTION_GARBAGE_RATIO,
        }
    }
}

impl KvConfig {
    /// Create config for testing
    ///
    /// Skips fsync and compacts small logs so tests exercise rewriting.
    pub fn for_testing() -> Self {
        KvConfig {
            sync_on_commit: false,
            compaction_min_log_bytes: 4 * 1024,
            compaction_garbage_ratio: DEFAULT_COMPACTION_GARBAGE_RATIO,
        }
    }

    /// Set fsync-on-commit
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Set the minimum log size for automatic compaction
    pub fn with_compaction_min_log_bytes(mut self, bytes: u64) -> Self {
        self.compaction_min_log_bytes = bytes;
        self
    }

    /// Set the dead-byte ratio that triggers compaction
    pub fn with_compaction_garbage_ratio(mut self, ratio: f64) -> Self {
        self.compaction_garbage_ratio = ratio;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> KvResult<()> {
        if !(self.compaction_garbage_ratio > 0.0 && self.compaction_garbage_ratio <= 1.0) {
            return Err(KvError::InvalidConfig(format!(
                "compaction_garbage_ratio must be in (0, 1], got {}",
                self.compaction_garbage_ratio
            )));
        }
        Ok(())
    }
}
