//! Durability layer for Tidepool
//!
//! An append-only, checksummed key-value log that backs the durable
//! persistence engine:
//!
//! - Batch records: one CRC-framed record per committed [`WriteBatch`]
//! - Recovery: replay on open, truncating a torn tail left by a crash
//! - Compaction: rewrite the log as its live entries once mostly garbage

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch; // Write batches and pending-read overlays
pub mod compaction; // Log rewriting
pub mod config; // KvConfig
pub mod error; // KvError
pub mod format; // Header and record framing
pub mod reader; // Log replay
pub mod store; // KvStore

pub use batch::{BatchOp, WriteBatch};
pub use compaction::CompactInfo;
pub use config::KvConfig;
pub use error::{KvError, KvResult};
pub use format::{BatchRecord, LogHeader, RecordError};
pub use reader::{read_log, LogReadResult, ReadStopReason};
pub use store::{KvStats, KvStore, LOG_FILE_NAME};
