//! Log replay for recovery
//!
//! The reader parses a whole log file and reports where the valid prefix
//! ends so the store can truncate a torn tail left by a crash.

use crate::batch::WriteBatch;
use crate::error::{KvError, KvResult};
use crate::format::{
    declared_length, BatchRecord, LogHeader, RecordError, LOG_FORMAT_VERSION, LOG_HEADER_SIZE,
    MAX_RECORD_BYTES,
};
use std::io::Read;

/// Why replay stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStopReason {
    /// Every byte belonged to a complete record
    EndOfData,
    /// The last record was cut short (expected after a crash)
    PartialRecord,
    /// The last record failed its checksum and reaches end of file,
    /// i.e. it was being written when the process died
    TornTail {
        /// Byte offset of the record within the file
        offset: u64,
    },
}

/// Result of reading a log file
#[derive(Debug)]
pub struct LogReadResult {
    /// Parsed header
    pub header: LogHeader,
    /// Committed batches in order
    pub batches: Vec<WriteBatch>,
    /// File offset where the valid prefix ends
    pub valid_end: u64,
    /// Why reading stopped
    pub stop_reason: ReadStopReason,
}

impl LogReadResult {
    /// True when the file holds bytes past `valid_end` that must be dropped.
    pub fn needs_truncation(&self) -> bool {
        self.stop_reason != ReadStopReason::EndOfData
    }
}

/// Read and validate a complete log.
pub fn read_log<R: Read>(reader: &mut R) -> KvResult<LogReadResult> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;
    if buffer.len() < LOG_HEADER_SIZE {
        return Err(KvError::InvalidHeader(format!(
            "log is {} bytes, shorter than its header",
            buffer.len()
        )));
    }
    let mut header_bytes = [0u8; LOG_HEADER_SIZE];
    header_bytes.copy_from_slice(&buffer[..LOG_HEADER_SIZE]);
    let header = LogHeader::from_bytes(&header_bytes)
        .filter(LogHeader::is_valid)
        .ok_or_else(|| KvError::InvalidHeader("bad magic bytes".to_string()))?;
    if header.format_version != LOG_FORMAT_VERSION {
        return Err(KvError::UnsupportedVersion(header.format_version));
    }

    let body = &buffer[LOG_HEADER_SIZE..];
    let mut batches = Vec::new();
    let mut offset = 0usize;
    let mut stop_reason = ReadStopReason::EndOfData;

    while offset < body.len() {
        let remaining = &body[offset..];
        match BatchRecord::from_bytes(remaining) {
            Ok((record, consumed)) => {
                batches.push(record.batch);
                offset += consumed;
            }
            Err(RecordError::InsufficientData) => {
                if !is_partial_tail(remaining) {
                    return Err(KvError::CorruptRecord {
                        offset: (LOG_HEADER_SIZE + offset) as u64,
                        reason: format!(
                            "declared length {:?} overruns the {} bytes left in the log",
                            declared_length(remaining),
                            remaining.len()
                        ),
                    });
                }
                stop_reason = ReadStopReason::PartialRecord;
                break;
            }
            Err(RecordError::ChecksumMismatch { expected, computed }) => {
                let file_offset = (LOG_HEADER_SIZE + offset) as u64;
                let record_len = u32::from_le_bytes([
                    remaining[0],
                    remaining[1],
                    remaining[2],
                    remaining[3],
                ]) as usize;
                if 4 + record_len == remaining.len() {
                    stop_reason = ReadStopReason::TornTail {
                        offset: file_offset,
                    };
                    break;
                }
                return Err(KvError::ChecksumMismatch {
                    offset: file_offset,
                    expected,
                    computed,
                });
            }
            Err(RecordError::UnsupportedVersion(version)) => {
                return Err(KvError::UnsupportedVersion(version as u32));
            }
            Err(e) => {
                return Err(KvError::Codec(format!(
                    "record at offset {}: {}",
                    LOG_HEADER_SIZE + offset,
                    e
                )));
            }
        }
    }

    Ok(LogReadResult {
        header,
        batches,
        valid_end: (LOG_HEADER_SIZE + offset) as u64,
        stop_reason,
    })
}

/// True when `remaining`, which holds fewer bytes than its declared length,
/// can be the start of a single record cut short by a crash. A declared
/// length beyond any record the store writes, or a complete record further
/// on, means the length prefix itself is damaged.
fn is_partial_tail(remaining: &[u8]) -> bool {
    match declared_length(remaining) {
        None => true,
        Some(length) if 4 + length > MAX_RECORD_BYTES => false,
        Some(_) => !(1..remaining.len())
            .any(|start| BatchRecord::from_bytes(&remaining[start..]).is_ok()),
    }
}
