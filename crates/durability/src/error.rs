//! Errors raised by the key-value log

use std::io;
use thiserror::Error;

/// Result type alias for key-value log operations
pub type KvResult<T> = std::result::Result<T, KvError>;

/// Key-value log errors
#[derive(Debug, Error)]
pub enum KvError {
    /// Underlying file operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Log file header is missing or malformed
    #[error("Invalid log header: {0}")]
    InvalidHeader(String),

    /// A record in the middle of the log failed its checksum
    #[error("Checksum mismatch at offset {offset}: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Byte offset of the record within the log
        offset: u64,
        /// Checksum stored in the record
        expected: u32,
        /// Checksum computed over the payload
        computed: u32,
    },

    /// A record before the end of the log is malformed
    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Byte offset of the record within the log
        offset: u64,
        /// What failed to validate
        reason: String,
    },

    /// Batch encodes to more than the record size limit
    #[error("Record of {bytes} bytes exceeds the {max} byte limit")]
    RecordTooLarge {
        /// Encoded record size
        bytes: usize,
        /// Largest accepted record
        max: usize,
    },

    /// Record written by an unknown format version
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    /// Batch payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<rmp_serde::encode::Error> for KvError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        KvError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for KvError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        KvError::Codec(e.to_string())
    }
}

impl From<KvError> for tidepool_core::Error {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Io(io) => tidepool_core::Error::Io(io),
            KvError::Codec(msg) => tidepool_core::Error::Serialization(msg),
            KvError::InvalidConfig(msg) => tidepool_core::Error::InvalidConfig(msg),
            too_large @ KvError::RecordTooLarge { .. } => {
                tidepool_core::Error::Serialization(too_large.to_string())
            }
            other => tidepool_core::Error::Corruption(other.to_string()),
        }
    }
}
