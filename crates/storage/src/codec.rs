//! Binary encoding of persisted documents
//!
//! Leaves, tracked queries and write records are stored as MessagePack with
//! named fields, so records stay readable if fields are appended later.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tidepool_core::{Error, Result};

/// Encode a document.
pub fn encode<T: Serialize>(document: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(document)?)
}

/// Decode a document stored under `key`.
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::corruption(format!("{key}: {e}")))
}
