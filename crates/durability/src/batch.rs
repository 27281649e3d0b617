//! Atomic write batches
//!
//! A [`WriteBatch`] is the unit of durability: it is appended to the log as a
//! single record and applied in full or not at all. While a batch is still
//! pending, [`WriteBatch::resolve`] and [`WriteBatch::overlay_prefix`] let
//! readers observe its effect on top of committed data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Insert or replace a key
    Put {
        /// Key
        key: String,
        /// Encoded value
        value: Vec<u8>,
    },
    /// Remove a key
    Delete {
        /// Key
        key: String,
    },
    /// Remove every key starting with `prefix`
    DeletePrefix {
        /// Key prefix
        prefix: String,
    },
}

impl BatchOp {
    fn affects(&self, key: &str) -> bool {
        match self {
            BatchOp::Put { key: k, .. } | BatchOp::Delete { key: k } => k == key,
            BatchOp::DeletePrefix { prefix } => key.starts_with(prefix.as_str()),
        }
    }
}

/// Ordered list of mutations committed together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// An empty batch.
    pub fn new() -> Self {
        WriteBatch::default()
    }

    /// Queue a put.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value,
        });
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    /// Queue a prefix delete.
    pub fn delete_prefix(&mut self, prefix: impl Into<String>) {
        self.ops.push(BatchOp::DeletePrefix {
            prefix: prefix.into(),
        });
    }

    /// Queued operations in order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Effect of this batch on `key`: `Some(Some(v))` when the last affecting
    /// operation is a put, `Some(None)` when it deletes the key, `None` when
    /// the batch does not touch it.
    pub fn resolve(&self, key: &str) -> Option<Option<&[u8]>> {
        self.ops
            .iter()
            .rev()
            .find(|op| op.affects(key))
            .map(|op| match op {
                BatchOp::Put { value, .. } => Some(value.as_slice()),
                _ => None,
            })
    }

    /// Apply the operations touching keys under `prefix` to `view`, which
    /// holds committed entries under the same prefix.
    pub fn overlay_prefix(&self, prefix: &str, view: &mut BTreeMap<String, Vec<u8>>) {
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } if key.starts_with(prefix) => {
                    view.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    view.remove(key);
                }
                BatchOp::DeletePrefix { prefix: doomed } => {
                    view.retain(|key, _| !key.starts_with(doomed.as_str()));
                }
                _ => {}
            }
        }
    }
}
