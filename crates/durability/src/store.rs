//! Append-only key-value store
//!
//! The whole key space lives in an ordered in-memory map. Every committed
//! [`WriteBatch`] is appended to the log as one CRC-framed record before it is
//! applied to the map, so a batch is either fully recovered or not at all.
//! Opening a store replays the log and truncates any torn tail.

use crate::batch::{BatchOp, WriteBatch};
use crate::config::KvConfig;
use crate::error::{KvError, KvResult};
use crate::format::{BatchRecord, LogHeader, MAX_RECORD_BYTES};
use crate::reader::{read_log, ReadStopReason};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Log file name inside the store directory
pub const LOG_FILE_NAME: &str = "tidepool.kv";

/// Size counters of an open store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvStats {
    /// Bytes in the log file, header included
    pub log_bytes: u64,
    /// Sum of key and value lengths of live entries
    pub live_bytes: u64,
    /// Number of live keys
    pub key_count: usize,
    /// Compaction generation of the log
    pub generation: u64,
}

/// Durable ordered map of string keys to byte values
pub struct KvStore {
    dir: PathBuf,
    file: File,
    header: LogHeader,
    data: BTreeMap<String, Vec<u8>>,
    config: KvConfig,
    log_bytes: u64,
    live_bytes: u64,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("dir", &self.dir)
            .field("keys", &self.data.len())
            .field("log_bytes", &self.log_bytes)
            .finish()
    }
}

impl KvStore {
    /// Open the store in `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>, config: KvConfig) -> KvResult<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);

        if !path.exists() {
            let header = LogHeader::new();
            let mut file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)?;
            header.write_to(&mut file)?;
            file.sync_all()?;
            debug!(path = %path.display(), store = %header.uuid(), "Created key-value log");
            let log_bytes = file.seek(SeekFrom::End(0))?;
            return Ok(KvStore {
                dir,
                file,
                header,
                data: BTreeMap::new(),
                config,
                log_bytes,
                live_bytes: 0,
            });
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let result = read_log(&mut file)?;
        if result.needs_truncation() {
            match result.stop_reason {
                ReadStopReason::TornTail { offset } => {
                    warn!(offset, "Dropping torn record at end of key-value log")
                }
                _ => warn!(
                    valid_end = result.valid_end,
                    "Truncating partial record at end of key-value log"
                ),
            }
            file.set_len(result.valid_end)?;
            file.sync_all()?;
        }

        let mut store = KvStore {
            dir,
            file,
            header: result.header,
            data: BTreeMap::new(),
            config,
            log_bytes: result.valid_end,
            live_bytes: 0,
        };
        let replayed = result.batches.len();
        for batch in &result.batches {
            store.apply(batch);
        }
        store.file.seek(SeekFrom::End(0))?;
        debug!(
            batches = replayed,
            keys = store.data.len(),
            generation = store.header.generation,
            "Recovered key-value log"
        );
        Ok(store)
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the store was opened with.
    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// Committed value of `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Value of `key` as seen through the uncommitted `pending` batch.
    pub fn get_through(&self, pending: &WriteBatch, key: &str) -> Option<Vec<u8>> {
        match pending.resolve(key) {
            Some(resolved) => resolved.map(<[u8]>::to_vec),
            None => self.get(key).map(<[u8]>::to_vec),
        }
    }

    /// Committed entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a [u8])> + 'a {
        self.data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.as_str(), value.as_slice()))
    }

    /// Entries under `prefix` as seen through the uncommitted `pending`
    /// batch, in key order.
    pub fn scan_prefix_through(
        &self,
        pending: &WriteBatch,
        prefix: &str,
    ) -> BTreeMap<String, Vec<u8>> {
        let mut view: BTreeMap<String, Vec<u8>> = self
            .scan_prefix(prefix)
            .map(|(key, value)| (key.to_string(), value.to_vec()))
            .collect();
        pending.overlay_prefix(prefix, &mut view);
        view
    }

    /// Append `batch` to the log and apply it.
    pub fn write(&mut self, batch: &WriteBatch) -> KvResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let bytes = BatchRecord::new(batch.clone()).to_bytes()?;
        if bytes.len() > MAX_RECORD_BYTES {
            return Err(KvError::RecordTooLarge {
                bytes: bytes.len(),
                max: MAX_RECORD_BYTES,
            });
        }
        self.discard_unacknowledged_tail()?;
        if let Err(e) = self.append(&bytes) {
            if let Err(rollback) = self.discard_unacknowledged_tail() {
                warn!(error = %rollback, "Failed to drop partial record after failed append");
            }
            return Err(e.into());
        }
        self.log_bytes += bytes.len() as u64;
        self.apply(batch);
        debug!(ops = batch.len(), bytes = bytes.len(), "Committed batch");

        // The batch is durable at this point; a failed compaction leaves the
        // old log in place and is retried on a later write.
        if self.should_compact() {
            if let Err(e) = self.compact() {
                warn!(error = %e, "Compaction after commit failed");
            }
        }
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        if self.config.sync_on_commit {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cut the file back to the last acknowledged record. Bytes past it are
    /// left over from an append that failed part way.
    fn discard_unacknowledged_tail(&mut self) -> io::Result<()> {
        if self.file.metadata()?.len() != self.log_bytes {
            warn!(
                log_bytes = self.log_bytes,
                "Dropping unacknowledged bytes at end of key-value log"
            );
            self.file.set_len(self.log_bytes)?;
        }
        self.file.seek(SeekFrom::Start(self.log_bytes))?;
        Ok(())
    }

    fn apply(&mut self, batch: &WriteBatch) {
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    let added = (key.len() + value.len()) as u64;
                    if let Some(old) = self.data.insert(key.clone(), value.clone()) {
                        self.live_bytes -= (key.len() + old.len()) as u64;
                    }
                    self.live_bytes += added;
                }
                BatchOp::Delete { key } => {
                    if let Some(old) = self.data.remove(key) {
                        self.live_bytes -= (key.len() + old.len()) as u64;
                    }
                }
                BatchOp::DeletePrefix { prefix } => {
                    let doomed: Vec<String> = self
                        .scan_prefix(prefix)
                        .map(|(key, _)| key.to_string())
                        .collect();
                    for key in doomed {
                        if let Some(old) = self.data.remove(&key) {
                            self.live_bytes -= (key.len() + old.len()) as u64;
                        }
                    }
                }
            }
        }
    }

    /// Current size counters.
    pub fn stats(&self) -> KvStats {
        KvStats {
            log_bytes: self.log_bytes,
            live_bytes: self.live_bytes,
            key_count: self.data.len(),
            generation: self.header.generation,
        }
    }

    pub(crate) fn header(&self) -> &LogHeader {
        &self.header
    }

    pub(crate) fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.data
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    pub(crate) fn replace_log(&mut self, file: File, header: LogHeader, log_bytes: u64) {
        self.file = file;
        self.header = header;
        self.log_bytes = log_bytes;
    }
}
