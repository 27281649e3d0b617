//! Log file header

use std::io::{Read, Write};
use uuid::Uuid;

/// Magic bytes identifying a tidepool log file: "TDPL"
pub const LOG_MAGIC: [u8; 4] = *b"TDPL";

/// Current log file format version
pub const LOG_FORMAT_VERSION: u32 = 1;

/// Size of the log header in bytes
pub const LOG_HEADER_SIZE: usize = 32;

/// Header written once at the start of the log file
///
/// ```text
/// ┌───────────┬──────────────┬──────────────┬─────────────────┐
/// │ Magic (4) │ Version (4)  │ Generation(8)│ Store UUID (16) │
/// └───────────┴──────────────┴──────────────┴─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Magic bytes: "TDPL"
    pub magic: [u8; 4],
    /// Format version
    pub format_version: u32,
    /// Incremented every time the log is rewritten by compaction
    pub generation: u64,
    /// Identity of the store, stable across compactions
    pub store_uuid: [u8; 16],
}

impl LogHeader {
    /// Header for a brand-new store.
    pub fn new() -> Self {
        LogHeader {
            magic: LOG_MAGIC,
            format_version: LOG_FORMAT_VERSION,
            generation: 0,
            store_uuid: *Uuid::new_v4().as_bytes(),
        }
    }

    /// Header for the next compaction generation of the same store.
    pub fn next_generation(&self) -> Self {
        LogHeader {
            generation: self.generation + 1,
            ..*self
        }
    }

    /// Store identity as a UUID.
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.store_uuid)
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut bytes = [0u8; LOG_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.generation.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.store_uuid);
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; LOG_HEADER_SIZE]) -> Option<Self> {
        Some(LogHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            generation: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            store_uuid: bytes[16..32].try_into().ok()?,
        })
    }

    /// Validate the header has correct magic bytes.
    pub fn is_valid(&self) -> bool {
        self.magic == LOG_MAGIC
    }

    /// Write the header to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Read a header from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Option<Self>> {
        let mut bytes = [0u8; LOG_HEADER_SIZE];
        reader.read_exact(&mut bytes)?;
        Ok(Self::from_bytes(&bytes))
    }
}

impl Default for LogHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = LogHeader::new();
        let parsed = LogHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_valid());
        assert_eq!(parsed.format_version, LOG_FORMAT_VERSION);
    }

    #[test]
    fn test_next_generation_keeps_identity() {
        let header = LogHeader::new();
        let next = header.next_generation();
        assert_eq!(next.generation, 1);
        assert_eq!(next.uuid(), header.uuid());
    }

    #[test]
    fn test_bad_magic_is_invalid() {
        let mut bytes = LogHeader::new().to_bytes();
        bytes[0] = b'X';
        assert!(!LogHeader::from_bytes(&bytes).unwrap().is_valid());
    }

    #[test]
    fn test_read_from_short_input_fails() {
        let mut short: &[u8] = &[0u8; 8];
        assert!(LogHeader::read_from(&mut short).is_err());
    }
}
