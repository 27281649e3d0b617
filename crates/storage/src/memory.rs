//! Ephemeral storage engine
//!
//! Keeps the server cache as one in-memory [`Value`] and tracked keys in a
//! map. Write records and tracked queries are not retained: saving them only
//! checks the transaction discipline, and loading returns nothing. Mutations
//! apply immediately, so ending an unsuccessful transaction does not roll
//! them back.

use crate::engine::PersistenceStorageEngine;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tidepool_core::{
    invariant_violation, CompoundWrite, Path, PruneForest, Result, TrackedQuery, UserWriteRecord,
    Value, PRIORITY_KEY,
};
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryState {
    server_cache: Value,
    tracked_query_keys: BTreeMap<u64, BTreeSet<String>>,
    in_transaction: bool,
}

impl MemoryState {
    fn verify_in_transaction(&self, operation: &str) {
        if !self.in_transaction {
            invariant_violation(format!("{operation} called outside of a transaction"));
        }
    }
}

/// Persistence engine that forgets everything on drop
#[derive(Debug, Default)]
pub struct InMemoryStorageEngine {
    state: Mutex<MemoryState>,
}

impl InMemoryStorageEngine {
    /// An empty engine.
    pub fn new() -> Self {
        InMemoryStorageEngine::default()
    }
}

/// Copy of `value` without null children.
fn without_nulls(value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    rebuild(map.iter().map(|(key, child)| (key.as_str(), without_nulls(child))))
}

/// Assemble an object from `children`, dropping nulls and applying
/// priorities after the content they annotate.
fn rebuild<'a>(children: impl Iterator<Item = (&'a str, Value)>) -> Value {
    let mut result = Value::Null;
    let mut priority = None;
    for (key, child) in children {
        if child.is_null() {
            continue;
        }
        if key == PRIORITY_KEY {
            priority = Some(child);
        } else {
            result.update_child(&Path::new(key), child);
        }
    }
    if let Some(priority) = priority {
        result.update_child(&Path::new(PRIORITY_KEY), priority);
    }
    result
}

/// Copy of `value`, located at `relative` below the prune root, with every
/// leaf whose leaf-most marking is prune removed.
fn prune_value(value: &Value, relative: &Path, forest: &PruneForest) -> Value {
    if !forest.affects_path(relative) || forest.should_keep(relative) {
        return value.clone();
    }
    match value {
        Value::Object(map) => rebuild(
            map.iter()
                .map(|(key, child)| (key.as_str(), prune_value(child, &relative.child(key), forest))),
        ),
        _ if forest.should_prune_unkept_descendants(relative) => Value::Null,
        leaf => leaf.clone(),
    }
}

impl PersistenceStorageEngine for InMemoryStorageEngine {
    fn save_user_overwrite(&self, _path: &Path, _value: &Value, _write_id: i64) -> Result<()> {
        self.state.lock().verify_in_transaction("save_user_overwrite");
        Ok(())
    }

    fn save_user_merge(&self, _path: &Path, _merge: &CompoundWrite, _write_id: i64) -> Result<()> {
        self.state.lock().verify_in_transaction("save_user_merge");
        Ok(())
    }

    fn remove_user_write(&self, _write_id: i64) -> Result<()> {
        self.state.lock().verify_in_transaction("remove_user_write");
        Ok(())
    }

    fn load_user_writes(&self) -> Result<Vec<UserWriteRecord>> {
        Ok(Vec::new())
    }

    fn remove_all_user_writes(&self) -> Result<()> {
        self.state.lock().verify_in_transaction("remove_all_user_writes");
        Ok(())
    }

    fn server_cache(&self, path: &Path) -> Result<Value> {
        Ok(self.state.lock().server_cache.get_child(path).clone())
    }

    fn overwrite_server_cache(&self, path: &Path, value: &Value) -> Result<()> {
        let mut state = self.state.lock();
        state.verify_in_transaction("overwrite_server_cache");
        state.server_cache.update_child(path, without_nulls(value));
        Ok(())
    }

    fn merge_into_server_cache(&self, path: &Path, value: &Value) -> Result<()> {
        let mut state = self.state.lock();
        state.verify_in_transaction("merge_into_server_cache");
        match value {
            Value::Object(children) => {
                for (key, child) in children {
                    state
                        .server_cache
                        .update_child(&path.child(key), without_nulls(child));
                }
            }
            other => state.server_cache.update_child(path, other.clone()),
        }
        Ok(())
    }

    fn merge_compound_write_into_server_cache(
        &self,
        path: &Path,
        merge: &CompoundWrite,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.verify_in_transaction("merge_compound_write_into_server_cache");
        for (relative, value) in merge.writes() {
            state
                .server_cache
                .update_child(&path.child_path(&relative), without_nulls(&value));
        }
        Ok(())
    }

    fn server_cache_estimated_size_in_bytes(&self) -> Result<u64> {
        Ok(self.state.lock().server_cache.estimated_size())
    }

    fn save_tracked_query(&self, _query: &TrackedQuery) -> Result<()> {
        self.state.lock().verify_in_transaction("save_tracked_query");
        Ok(())
    }

    fn delete_tracked_query(&self, query_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.verify_in_transaction("delete_tracked_query");
        state.tracked_query_keys.remove(&query_id);
        Ok(())
    }

    fn load_tracked_queries(&self) -> Result<Vec<TrackedQuery>> {
        Ok(Vec::new())
    }

    fn reset_previously_active_tracked_queries(&self, _last_use: u64) -> Result<()> {
        self.state
            .lock()
            .verify_in_transaction("reset_previously_active_tracked_queries");
        Ok(())
    }

    fn save_tracked_query_keys(&self, query_id: u64, keys: &BTreeSet<String>) -> Result<()> {
        let mut state = self.state.lock();
        state.verify_in_transaction("save_tracked_query_keys");
        state.tracked_query_keys.insert(query_id, keys.clone());
        Ok(())
    }

    fn update_tracked_query_keys(
        &self,
        query_id: u64,
        added: &BTreeSet<String>,
        removed: &BTreeSet<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.verify_in_transaction("update_tracked_query_keys");
        let tracked = state.tracked_query_keys.entry(query_id).or_default();
        tracked.extend(added.iter().cloned());
        for key in removed {
            tracked.remove(key);
        }
        Ok(())
    }

    fn load_tracked_query_keys(&self, query_id: u64) -> Result<BTreeSet<String>> {
        Ok(self
            .state
            .lock()
            .tracked_query_keys
            .get(&query_id)
            .cloned()
            .unwrap_or_default())
    }

    fn prune_cache(&self, root: &Path, forest: &PruneForest) -> Result<()> {
        let mut state = self.state.lock();
        state.verify_in_transaction("prune_cache");
        if !forest.prunes_anything() {
            return Ok(());
        }
        let pruned = prune_value(state.server_cache.get_child(root), &Path::root(), forest);
        state.server_cache.update_child(root, pruned);
        debug!(root = %root, "Pruned in-memory server cache");
        Ok(())
    }

    fn begin_transaction(&self) {
        let mut state = self.state.lock();
        if state.in_transaction {
            invariant_violation(
                "begin_transaction called while a transaction is already in progress",
            );
        }
        state.in_transaction = true;
    }

    fn set_transaction_successful(&self) {
        self.state
            .lock()
            .verify_in_transaction("set_transaction_successful");
    }

    fn end_transaction(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.verify_in_transaction("end_transaction");
        state.in_transaction = false;
        Ok(())
    }
}
