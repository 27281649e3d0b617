//! Storage engine contract
//!
//! This module defines the [`PersistenceStorageEngine`] trait that the
//! persistence layer drives. Backends are chosen once at construction and
//! injected as `Arc<dyn PersistenceStorageEngine>`.
//!
//! # Transactions
//!
//! Every mutating method requires an open transaction. Calling one outside
//! a transaction, or beginning a transaction while another is open, is an
//! invariant violation and panics. Reads may happen at any time; inside a
//! transaction they observe the transaction's own uncommitted writes.

use std::collections::BTreeSet;
use tidepool_core::{CompoundWrite, Path, PruneForest, Result, TrackedQuery, UserWriteRecord, Value};

/// Durable state of the offline cache
///
/// Thread safety: implementations synchronize internally, but the
/// transaction discipline assumes a single logical caller.
pub trait PersistenceStorageEngine: Send + Sync {
    /// Persist an unacknowledged overwrite.
    fn save_user_overwrite(&self, path: &Path, value: &Value, write_id: i64) -> Result<()>;

    /// Persist an unacknowledged merge.
    fn save_user_merge(&self, path: &Path, merge: &CompoundWrite, write_id: i64) -> Result<()>;

    /// Forget the write record `write_id`. Unknown ids are ignored.
    fn remove_user_write(&self, write_id: i64) -> Result<()>;

    /// Every persisted write record, ordered by write id.
    fn load_user_writes(&self) -> Result<Vec<UserWriteRecord>>;

    /// Forget every write record.
    fn remove_all_user_writes(&self) -> Result<()>;

    /// Cached server data at `path`, null when nothing is cached.
    fn server_cache(&self, path: &Path) -> Result<Value>;

    /// Replace the cached server data at `path`.
    fn overwrite_server_cache(&self, path: &Path, value: &Value) -> Result<()>;

    /// Merge into the cached server data at `path`.
    ///
    /// An object overwrites each of its children at `path/child`, leaving
    /// other children alone. Any other value overwrites `path`.
    fn merge_into_server_cache(&self, path: &Path, value: &Value) -> Result<()>;

    /// Overwrite `path/<write path>` for every write in `merge`.
    fn merge_compound_write_into_server_cache(
        &self,
        path: &Path,
        merge: &CompoundWrite,
    ) -> Result<()>;

    /// Approximate footprint of the server cache.
    fn server_cache_estimated_size_in_bytes(&self) -> Result<u64>;

    /// Insert or replace a tracked query record.
    fn save_tracked_query(&self, query: &TrackedQuery) -> Result<()>;

    /// Delete a tracked query record together with its tracked keys.
    fn delete_tracked_query(&self, query_id: u64) -> Result<()>;

    /// Every persisted tracked query.
    fn load_tracked_queries(&self) -> Result<Vec<TrackedQuery>>;

    /// Mark every active tracked query inactive with `last_use`.
    fn reset_previously_active_tracked_queries(&self, last_use: u64) -> Result<()>;

    /// Replace the tracked keys of `query_id`.
    fn save_tracked_query_keys(&self, query_id: u64, keys: &BTreeSet<String>) -> Result<()>;

    /// Add and remove tracked keys of `query_id`.
    fn update_tracked_query_keys(
        &self,
        query_id: u64,
        added: &BTreeSet<String>,
        removed: &BTreeSet<String>,
    ) -> Result<()>;

    /// Tracked keys of `query_id`.
    fn load_tracked_query_keys(&self, query_id: u64) -> Result<BTreeSet<String>>;

    /// Union of the tracked keys of every id in `query_ids`.
    fn load_tracked_query_keys_for(&self, query_ids: &BTreeSet<u64>) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        for query_id in query_ids {
            keys.extend(self.load_tracked_query_keys(*query_id)?);
        }
        Ok(keys)
    }

    /// Evict cached data below `root` as marked by `forest`, whose paths are
    /// relative to `root`.
    ///
    /// A leaf is removed when the leaf-most marking on its route is prune.
    fn prune_cache(&self, root: &Path, forest: &PruneForest) -> Result<()>;

    /// Open a transaction.
    fn begin_transaction(&self);

    /// Mark the open transaction for commit.
    fn set_transaction_successful(&self);

    /// Close the open transaction, committing it if it was marked
    /// successful and discarding it otherwise.
    fn end_transaction(&self) -> Result<()>;
}
