//! Error types for the persistence cache
//!
//! Two classes of failure exist in this workspace:
//!
//! - Runtime failures (disk I/O, codec problems, bad configuration) are
//!   returned as [`Error`] through [`Result`].
//! - Programming-invariant violations (mutating outside a transaction,
//!   contradicting prune markings, removing an untracked query) are fatal and
//!   raised through [`invariant_violation`]. They never travel through
//!   `Result`, so a `?` chain cannot swallow them.
//!
//! Ordinary absence is always an `Option` or an empty collection.

use std::io;
use thiserror::Error;

/// Result type alias for persistence operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix of every invariant-violation panic message.
pub const INVARIANT_VIOLATION: &str = "invariant violation";

/// Error types for the persistence cache
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the durable backend
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a stored document failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored bytes are inconsistent (bad checksum, unexpected key layout)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// A value cannot be represented at a persistence boundary
    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A stored key did not parse as a path
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl Error {
    /// Build a serialization error from anything printable.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Error::Serialization(msg.to_string())
    }

    /// Build a corruption error from anything printable.
    pub fn corruption(msg: impl std::fmt::Display) -> Self {
        Error::Corruption(msg.to_string())
    }

    /// Returns true if this error indicates on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Abort on a broken caller contract.
///
/// Logs the message at `error` level and panics with a message starting with
/// [`INVARIANT_VIOLATION`].
#[cold]
#[track_caller]
pub fn invariant_violation(msg: impl std::fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(%location, "{}: {}", INVARIANT_VIOLATION, msg);
    panic!("{}: {}", INVARIANT_VIOLATION, msg);
}

/// Check a caller contract, aborting through [`invariant_violation`] when it
/// does not hold.
#[track_caller]
pub fn check_invariant(condition: bool, msg: impl FnOnce() -> String) {
    if !condition {
        invariant_violation(msg());
    }
}
