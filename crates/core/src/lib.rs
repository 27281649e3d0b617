//! Core types for the tidepool persistence cache
//!
//! This crate defines the in-memory algorithms every other layer builds on:
//! - Path: normalized, slash-delimited locations
//! - Value: the recursive document type and its path helpers
//! - Tree: arena-backed, path-indexed tree with parent links
//! - CompoundWrite: overlay of overlapping writes with shadowing
//! - SparseSnapshotTree: sparse accumulation of pending snapshots
//! - PruneForest: prune/keep markings consumed by cache eviction
//! - Query types: QueryParams, QuerySpec, TrackedQuery, UserWriteRecord
//! - Error: error type and the fatal invariant-violation path

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compound_write;
pub mod error;
pub mod path;
pub mod prune_forest;
pub mod query;
pub mod sparse_snapshot_tree;
pub mod tree;
pub mod value;

pub use compound_write::CompoundWrite;
pub use error::{check_invariant, invariant_violation, Error, Result, INVARIANT_VIOLATION};
pub use path::Path;
pub use prune_forest::PruneForest;
pub use query::{OrderBy, QueryBound, QueryParams, QuerySpec, TrackedQuery, UserWrite, UserWriteRecord};
pub use sparse_snapshot_tree::SparseSnapshotTree;
pub use tree::{NodeId, Tree};
pub use value::{Value, PRIORITY_KEY, VALUE_KEY};
