//! Tidepool - offline persistence cache for a realtime database client
//!
//! Tidepool remembers unacknowledged user writes, keeps a materialized copy
//! of previously seen server data, tracks which queries that copy fully
//! answers, and evicts data nobody watches once the cache grows too large.
//!
//! # Quick Start
//!
//! ```ignore
//! use tidepool::{PersistenceManager, QuerySpec, Value};
//!
//! let mut pm = PersistenceManager::open_dir("/tmp/tidepool")?;
//! let spec = QuerySpec::new("rooms/eros");
//! pm.run_in_transaction(|pm| {
//!     pm.set_query_active(&spec)?;
//!     pm.update_server_cache(&spec, &Value::from("hi"))
//! })?;
//! let node = pm.server_cache(&spec)?;
//! assert!(node.complete);
//! ```
//!
//! # Architecture
//!
//! - `tidepool-core`: paths, values, trees and query types
//! - `tidepool-durability`: the append-only KV log
//! - `tidepool-storage`: the storage engine trait and its backends
//! - `tidepool-engine`: tracked queries, cache policy and the manager

pub use tidepool_core::{
    CompoundWrite, Error, Path, PruneForest, QueryParams, QuerySpec, Result, SparseSnapshotTree,
    TrackedQuery, Tree, UserWriteRecord, Value,
};
pub use tidepool_engine::{
    CacheNode, CachePolicy, Clock, LruCachePolicy, NoopCachePolicy, PersistenceConfig,
    PersistenceManager, SystemClock, TestClock, TrackedQueryManager,
};
pub use tidepool_storage::{
    DurableStorageEngine, InMemoryStorageEngine, NoopStorageEngine, PersistenceStorageEngine,
};
