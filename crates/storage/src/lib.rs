//! Storage layer for Tidepool
//!
//! This crate implements the persistence engine contract and its backends:
//! - `PersistenceStorageEngine`: the trait the persistence layer drives
//! - `DurableStorageEngine`: key-value log backed, survives restarts
//! - `InMemoryStorageEngine`: server cache in memory, for ephemeral sessions
//! - `NoopStorageEngine`: stores nothing, for disabled persistence
//!
//! # Transactions
//!
//! Mutations require an open transaction. The durable backend commits a
//! transaction as one atomic log record.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod durable;
pub mod engine;
pub mod keys;
pub mod memory;
pub mod noop;

pub use durable::DurableStorageEngine;
pub use engine::PersistenceStorageEngine;
pub use memory::InMemoryStorageEngine;
pub use noop::NoopStorageEngine;
