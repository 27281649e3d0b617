//! Batch record framing
//!
//! ```text
//! ┌─────────────────┬──────────────────┬─────────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1)   │ Payload (variable)      │ CRC32 (4)│
//! └─────────────────┴──────────────────┴─────────────────────────┴──────────┘
//! ```
//!
//! The length covers format version, payload and CRC. The payload is the
//! MessagePack encoding of a [`WriteBatch`]. The CRC covers format version
//! and payload.

use crate::batch::WriteBatch;
use crc32fast::Hasher;
use thiserror::Error;

/// Current batch record format version
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Largest record the store writes, length prefix included (64 MiB)
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// Errors produced while decoding a record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// Not enough data to parse record
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Record format is invalid
    #[error("Invalid record format")]
    InvalidFormat,

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from record
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Unsupported format version
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),

    /// Checksum was valid but the payload did not decode
    #[error("Payload decode failed: {0}")]
    Payload(String),
}

/// One committed batch as stored in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    /// The committed mutations
    pub batch: WriteBatch,
}

impl BatchRecord {
    /// Wrap a batch.
    pub fn new(batch: WriteBatch) -> Self {
        BatchRecord { batch }
    }

    /// Serialize record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let encoded = rmp_serde::to_vec(&self.batch)?;
        let mut payload = Vec::with_capacity(1 + encoded.len());
        payload.push(RECORD_FORMAT_VERSION);
        payload.extend_from_slice(&encoded);

        let crc = compute_crc(&payload);
        let total_len = payload.len() + 4;
        let mut record = Vec::with_capacity(4 + total_len);
        record.extend_from_slice(&(total_len as u32).to_le_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(&crc.to_le_bytes());
        Ok(record)
    }

    /// Deserialize a record from the front of `bytes`.
    ///
    /// Returns (record, bytes_consumed) on success.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), RecordError> {
        let length = read_u32(bytes, 0).ok_or(RecordError::InsufficientData)? as usize;
        if length == 0 {
            return Err(RecordError::InvalidFormat);
        }
        if bytes.len() < 4 + length {
            return Err(RecordError::InsufficientData);
        }
        if length < 5 {
            // Minimum: 1 byte format version + 4 bytes CRC
            return Err(RecordError::InvalidFormat);
        }

        let payload = &bytes[4..4 + length - 4];
        let stored_crc = read_u32(bytes, 4 + length - 4).ok_or(RecordError::InsufficientData)?;
        let computed_crc = compute_crc(payload);
        if computed_crc != stored_crc {
            return Err(RecordError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let format_version = payload[0];
        if format_version != RECORD_FORMAT_VERSION {
            return Err(RecordError::UnsupportedVersion(format_version));
        }

        let batch: WriteBatch = rmp_serde::from_slice(&payload[1..])
            .map_err(|e| RecordError::Payload(e.to_string()))?;
        Ok((BatchRecord { batch }, 4 + length))
    }
}

/// Length declared by the record at the front of `bytes`, if the prefix is
/// complete.
pub fn declared_length(bytes: &[u8]) -> Option<usize> {
    read_u32(bytes, 0).map(|length| length as usize)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
