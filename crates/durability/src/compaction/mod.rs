//! Log compaction
//!
//! The log only ever grows: overwritten and deleted keys keep their old
//! records. Compaction rewrites the log as a single batch holding the live
//! entries, under the next header generation.
//!
//! # Algorithm
//!
//! 1. Write a fresh header and one `Put` batch of every live entry to a
//!    temporary file next to the log
//! 2. fsync the temporary file
//! 3. Atomically rename it over the log
//! 4. Keep appending through the temporary file's handle
//!
//! A crash before step 3 leaves the old log untouched; the stale temporary
//! file is overwritten by the next compaction.

use crate::batch::WriteBatch;
use crate::error::KvResult;
use crate::format::BatchRecord;
use crate::store::KvStore;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::time::Instant;
use tracing::info;

const COMPACTION_TMP_SUFFIX: &str = "compact";

/// Result of a compaction
#[derive(Debug, Clone, Default)]
pub struct CompactInfo {
    /// Log size before compaction
    pub bytes_before: u64,
    /// Log size after compaction
    pub bytes_after: u64,
    /// Live keys written to the new log
    pub keys_written: usize,
    /// Generation of the new log
    pub generation: u64,
    /// Duration of compaction in milliseconds
    pub duration_ms: u64,
}

impl CompactInfo {
    /// Bytes released on disk.
    pub fn reclaimed_bytes(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

impl KvStore {
    /// True once the log is large enough and mostly garbage.
    pub(crate) fn should_compact(&self) -> bool {
        let stats = self.stats();
        let config = self.config();
        if stats.log_bytes < config.compaction_min_log_bytes {
            return false;
        }
        let garbage = stats.log_bytes.saturating_sub(stats.live_bytes) as f64;
        garbage / stats.log_bytes as f64 > config.compaction_garbage_ratio
    }

    /// Rewrite the log so it holds only live entries.
    pub fn compact(&mut self) -> KvResult<CompactInfo> {
        let start = Instant::now();
        let bytes_before = self.stats().log_bytes;
        let header = self.header().next_generation();
        let log_path = self.log_path();
        let tmp_path = log_path.with_extension(COMPACTION_TMP_SUFFIX);

        let mut snapshot = WriteBatch::new();
        for (key, value) in self.entries() {
            snapshot.put(key.clone(), value.clone());
        }
        let keys_written = snapshot.len();

        // The handle follows the file through the rename, so nothing can
        // fail between replacing the log and adopting it.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        header.write_to(&mut file)?;
        if !snapshot.is_empty() {
            file.write_all(&BatchRecord::new(snapshot).to_bytes()?)?;
        }
        file.sync_all()?;
        let bytes_after = file.seek(SeekFrom::End(0))?;
        fs::rename(&tmp_path, &log_path)?;
        self.replace_log(file, header, bytes_after);

        let info = CompactInfo {
            bytes_before,
            bytes_after,
            keys_written,
            generation: header.generation,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            target: "tidepool::compaction",
            generation = info.generation,
            keys = info.keys_written,
            reclaimed_bytes = info.reclaimed_bytes(),
            duration_ms = info.duration_ms,
            "Compacted key-value log"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::KvConfig;
    use crate::store::KvStore;
    use crate::WriteBatch;
    use tempfile::tempdir;

    fn put(store: &mut KvStore, key: &str, value: &[u8]) {
        let mut batch = WriteBatch::new();
        batch.put(key, value.to_vec());
        store.write(&batch).unwrap();
    }

    #[test]
    fn test_compact_keeps_live_entries() {
        let dir = tempdir().unwrap();
        let config = KvConfig::for_testing().with_compaction_min_log_bytes(u64::MAX);
        let mut store = KvStore::open(dir.path(), config.clone()).unwrap();
        for i in 0..50u8 {
            put(&mut store, "hot", &[i; 32]);
        }
        put(&mut store, "cold", b"x");

        let info = store.compact().unwrap();
        assert!(info.reclaimed_bytes() > 0);
        assert_eq!(info.keys_written, 2);
        assert_eq!(info.generation, 1);
        assert_eq!(store.get("hot"), Some(&[49u8; 32][..]));

        put(&mut store, "after", b"y");
        drop(store);

        let store = KvStore::open(dir.path(), config).unwrap();
        assert_eq!(store.stats().generation, 1);
        assert_eq!(store.get("hot"), Some(&[49u8; 32][..]));
        assert_eq!(store.get("cold"), Some(&b"x"[..]));
        assert_eq!(store.get("after"), Some(&b"y"[..]));
    }

    #[test]
    fn test_compact_empty_store() {
        let dir = tempdir().unwrap();
        let mut store = KvStore::open(dir.path(), KvConfig::for_testing()).unwrap();
        let info = store.compact().unwrap();
        assert_eq!(info.keys_written, 0);
        assert_eq!(info.bytes_after, crate::format::LOG_HEADER_SIZE as u64);
    }

    #[test]
    fn test_write_triggers_compaction_when_mostly_garbage() {
        let dir = tempdir().unwrap();
        let config = KvConfig::for_testing()
            .with_compaction_min_log_bytes(1024)
            .with_compaction_garbage_ratio(0.5);
        let mut store = KvStore::open(dir.path(), config).unwrap();
        for i in 0..64u8 {
            put(&mut store, "k", &[i; 64]);
        }
        let stats = store.stats();
        assert!(stats.generation >= 1);
        assert!(stats.log_bytes < 64 * 64);
        assert_eq!(store.get("k"), Some(&[63u8; 64][..]));
    }
}
