//! Persistence engine for the tidepool offline cache
//!
//! This crate orchestrates the lower layers:
//! - TrackedQueryManager: which queries are watched, complete, prunable
//! - CachePolicy: when and how aggressively to prune
//! - Clock: source of `last_use` stamps
//! - PersistenceManager: the facade the sync layer drives, plus its config
//!
//! The engine is the only component that knows about:
//! - Backend selection (durable, in-memory, disabled)
//! - Pairing server-cache updates with tracked query bookkeeping

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache_policy;
pub mod clock;
pub mod persistence;
pub mod tracked_query_manager;

pub use cache_policy::{CachePolicy, LruCachePolicy, NoopCachePolicy};
pub use clock::{Clock, SystemClock, TestClock};
pub use persistence::{BackendKind, CacheNode, PersistenceConfig, PersistenceManager};
pub use tracked_query_manager::{TrackedQueryManager, TrackedQueryMap};
