//! Binary on-disk format of the key-value log
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Log Header (32 bytes)              │
//! ├────────────────────────────────────┤
//! │ Batch Record 1                     │
//! ├────────────────────────────────────┤
//! │ Batch Record 2                     │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```

pub mod header;
pub mod record;

pub use header::{LogHeader, LOG_FORMAT_VERSION, LOG_HEADER_SIZE, LOG_MAGIC};
pub use record::{
    declared_length, BatchRecord, RecordError, MAX_RECORD_BYTES, RECORD_FORMAT_VERSION,
};
