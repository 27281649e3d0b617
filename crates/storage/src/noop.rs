//! Storage engine used when persistence is disabled
//!
//! Every mutator is inert and every accessor returns empty. Transactions
//! are not tracked.

use crate::engine::PersistenceStorageEngine;
use std::collections::BTreeSet;
use tidepool_core::{CompoundWrite, Path, PruneForest, Result, TrackedQuery, UserWriteRecord, Value};

/// Persistence engine that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorageEngine;

impl NoopStorageEngine {
    /// The engine.
    pub fn new() -> Self {
        NoopStorageEngine
    }
}

impl PersistenceStorageEngine for NoopStorageEngine {
    fn save_user_overwrite(&self, _path: &Path, _value: &Value, _write_id: i64) -> Result<()> {
        Ok(())
    }

    fn save_user_merge(&self, _path: &Path, _merge: &CompoundWrite, _write_id: i64) -> Result<()> {
        Ok(())
    }

    fn remove_user_write(&self, _write_id: i64) -> Result<()> {
        Ok(())
    }

    fn load_user_writes(&self) -> Result<Vec<UserWriteRecord>> {
        Ok(Vec::new())
    }

    fn remove_all_user_writes(&self) -> Result<()> {
        Ok(())
    }

    fn server_cache(&self, _path: &Path) -> Result<Value> {
        Ok(Value::Null)
    }

    fn overwrite_server_cache(&self, _path: &Path, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn merge_into_server_cache(&self, _path: &Path, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn merge_compound_write_into_server_cache(
        &self,
        _path: &Path,
        _merge: &CompoundWrite,
    ) -> Result<()> {
        Ok(())
    }

    fn server_cache_estimated_size_in_bytes(&self) -> Result<u64> {
        Ok(0)
    }

    fn save_tracked_query(&self, _query: &TrackedQuery) -> Result<()> {
        Ok(())
    }

    fn delete_tracked_query(&self, _query_id: u64) -> Result<()> {
        Ok(())
    }

    fn load_tracked_queries(&self) -> Result<Vec<TrackedQuery>> {
        Ok(Vec::new())
    }

    fn reset_previously_active_tracked_queries(&self, _last_use: u64) -> Result<()> {
        Ok(())
    }

    fn save_tracked_query_keys(&self, _query_id: u64, _keys: &BTreeSet<String>) -> Result<()> {
        Ok(())
    }

    fn update_tracked_query_keys(
        &self,
        _query_id: u64,
        _added: &BTreeSet<String>,
        _removed: &BTreeSet<String>,
    ) -> Result<()> {
        Ok(())
    }

    fn load_tracked_query_keys(&self, _query_id: u64) -> Result<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }

    fn prune_cache(&self, _root: &Path, _forest: &PruneForest) -> Result<()> {
        Ok(())
    }

    fn begin_transaction(&self) {}

    fn set_transaction_successful(&self) {}

    fn end_transaction(&self) -> Result<()> {
        Ok(())
    }
}
