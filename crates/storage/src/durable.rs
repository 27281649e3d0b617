//! Durable storage engine backed by the key-value log
//!
//! Server-cache data is stored one leaf per key under `/<path>/` (see
//! [`keys`](crate::keys)). A transaction buffers its mutations in a
//! [`WriteBatch`] which is appended to the log as one atomic record when the
//! transaction ends successfully. Reads inside a transaction see the
//! buffered mutations.

use crate::codec;
use crate::engine::PersistenceStorageEngine;
use crate::keys;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path as FsPath;
use tidepool_core::{
    invariant_violation, CompoundWrite, Path, PruneForest, Result, TrackedQuery, UserWriteRecord,
    Value, PRIORITY_KEY, VALUE_KEY,
};
use tidepool_durability::{KvConfig, KvStats, KvStore, WriteBatch};
use tracing::{debug, warn};

struct Transaction {
    batch: WriteBatch,
    successful: bool,
}

struct DurableState {
    store: KvStore,
    transaction: Option<Transaction>,
}

impl DurableState {
    fn batch_mut(&mut self, operation: &str) -> &mut WriteBatch {
        match &mut self.transaction {
            Some(transaction) => &mut transaction.batch,
            None => invariant_violation(format!(
                "{operation} called outside of a transaction"
            )),
        }
    }

    fn contains(&self, key: &str) -> bool {
        match &self.transaction {
            Some(transaction) => self.store.get_through(&transaction.batch, key).is_some(),
            None => self.store.get(key).is_some(),
        }
    }

    fn scan(&self, prefix: &str) -> BTreeMap<String, Vec<u8>> {
        match &self.transaction {
            Some(transaction) => self.store.scan_prefix_through(&transaction.batch, prefix),
            None => self
                .store
                .scan_prefix(prefix)
                .map(|(key, value)| (key.to_string(), value.to_vec()))
                .collect(),
        }
    }

    /// Queue the mutations replacing the server cache at `path` with
    /// `value`. Encoding happens first so a failure queues nothing.
    fn queue_overwrite(&mut self, operation: &str, path: &Path, value: &Value) -> Result<()> {
        let mut puts = Vec::new();
        let mut failure = None;
        value.visit_leaves(&mut |relative, leaf| {
            if failure.is_some() {
                return;
            }
            match codec::encode(leaf) {
                Ok(bytes) => puts.push((keys::server_cache_key(&path.child_path(relative)), bytes)),
                Err(e) => failure = Some(e),
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        // A leaf stored at an ancestor would shadow the new data. The
        // parent of a priority write keeps its leaf.
        let keeps_parent_leaf = matches!(path.base_name(), PRIORITY_KEY | VALUE_KEY);
        let parent = path.parent();
        let stale: Vec<String> = path
            .ancestors()
            .into_iter()
            .filter(|ancestor| !(keeps_parent_leaf && *ancestor == parent))
            .map(|ancestor| keys::server_cache_key(&ancestor))
            .filter(|key| self.contains(key))
            .collect();

        // A node's own leaf replaces its children; the priority stays.
        let replaces_children = path.base_name() == VALUE_KEY && !value.is_null();
        let replaced_children: Vec<String> = if replaces_children {
            let parent_key = keys::server_cache_prefix(&parent);
            let priority_key = keys::server_cache_key(&parent.child(PRIORITY_KEY));
            self.scan(&parent_key)
                .into_keys()
                .filter(|key| *key != parent_key && *key != priority_key)
                .collect()
        } else {
            Vec::new()
        };

        let batch = self.batch_mut(operation);
        batch.delete_prefix(keys::server_cache_prefix(path));
        for key in replaced_children {
            batch.delete(key);
        }
        for key in stale {
            batch.delete(key);
        }
        for (key, bytes) in puts {
            batch.put(key, bytes);
        }
        Ok(())
    }
}

/// Persistence engine storing everything in a [`KvStore`]
pub struct DurableStorageEngine {
    state: Mutex<DurableState>,
}

impl std::fmt::Debug for DurableStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DurableStorageEngine")
            .field("store", &state.store)
            .field("in_transaction", &state.transaction.is_some())
            .finish()
    }
}

impl DurableStorageEngine {
    /// Open (or create) the store in `dir`.
    pub fn open(dir: impl AsRef<FsPath>, config: KvConfig) -> Result<Self> {
        let store = KvStore::open(dir, config)?;
        Ok(Self::from_store(store))
    }

    /// Wrap an already opened store.
    pub fn from_store(store: KvStore) -> Self {
        DurableStorageEngine {
            state: Mutex::new(DurableState {
                store,
                transaction: None,
            }),
        }
    }

    /// Size counters of the underlying log.
    pub fn stats(&self) -> KvStats {
        self.state.lock().store.stats()
    }

    /// Rewrite the underlying log so it holds only live entries.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.transaction.is_some() {
            invariant_violation("compact called inside a transaction");
        }
        state.store.compact()?;
        Ok(())
    }
}

impl PersistenceStorageEngine for DurableStorageEngine {
    fn save_user_overwrite(&self, path: &Path, value: &Value, write_id: i64) -> Result<()> {
        let record = UserWriteRecord::overwrite(write_id, path.clone(), value.clone(), true);
        let bytes = codec::encode(&record)?;
        self.state
            .lock()
            .batch_mut("save_user_overwrite")
            .put(keys::user_write_key(write_id), bytes);
        Ok(())
    }

    fn save_user_merge(&self, path: &Path, merge: &CompoundWrite, write_id: i64) -> Result<()> {
        let record = UserWriteRecord::merge(write_id, path.clone(), merge.clone());
        let bytes = codec::encode(&record)?;
        self.state
            .lock()
            .batch_mut("save_user_merge")
            .put(keys::user_write_key(write_id), bytes);
        Ok(())
    }

    fn remove_user_write(&self, write_id: i64) -> Result<()> {
        self.state
            .lock()
            .batch_mut("remove_user_write")
            .delete(keys::user_write_key(write_id));
        Ok(())
    }

    fn load_user_writes(&self) -> Result<Vec<UserWriteRecord>> {
        let entries = self.state.lock().scan(keys::USER_WRITE_RECORDS_PREFIX);
        let mut records = entries
            .iter()
            .map(|(key, bytes)| codec::decode::<UserWriteRecord>(key, bytes))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|record| record.write_id);
        Ok(records)
    }

    fn remove_all_user_writes(&self) -> Result<()> {
        self.state
            .lock()
            .batch_mut("remove_all_user_writes")
            .delete_prefix(keys::USER_WRITE_RECORDS_PREFIX);
        Ok(())
    }

    fn server_cache(&self, path: &Path) -> Result<Value> {
        let entries = self.state.lock().scan(&keys::server_cache_prefix(path));
        let mut result = Value::Null;
        let mut priorities = Vec::new();
        for (key, bytes) in &entries {
            let Some(relative) = Path::relative(path, &keys::server_cache_path(key)) else {
                continue;
            };
            let leaf: Value = codec::decode(key, bytes)?;
            // Priorities attach to their sibling content, so they go last.
            if relative.base_name() == PRIORITY_KEY {
                priorities.push((relative, leaf));
            } else {
                result.update_child(&relative, leaf);
            }
        }
        for (relative, priority) in priorities {
            result.update_child(&relative, priority);
        }
        Ok(result)
    }

    fn overwrite_server_cache(&self, path: &Path, value: &Value) -> Result<()> {
        self.state
            .lock()
            .queue_overwrite("overwrite_server_cache", path, value)
    }

    fn merge_into_server_cache(&self, path: &Path, value: &Value) -> Result<()> {
        let mut state = self.state.lock();
        match value {
            Value::Object(children) => {
                for (key, child) in children {
                    state.queue_overwrite("merge_into_server_cache", &path.child(key), child)?;
                }
                Ok(())
            }
            other => state.queue_overwrite("merge_into_server_cache", path, other),
        }
    }

    fn merge_compound_write_into_server_cache(
        &self,
        path: &Path,
        merge: &CompoundWrite,
    ) -> Result<()> {
        let mut state = self.state.lock();
        // Checked up front so an empty merge outside a transaction still fails.
        state.batch_mut("merge_compound_write_into_server_cache");
        for (relative, value) in merge.writes() {
            state.queue_overwrite(
                "merge_compound_write_into_server_cache",
                &path.child_path(&relative),
                &value,
            )?;
        }
        Ok(())
    }

    fn server_cache_estimated_size_in_bytes(&self) -> Result<u64> {
        let entries = self.state.lock().scan(&keys::server_cache_prefix(&Path::root()));
        Ok(entries
            .iter()
            .map(|(key, value)| (key.len() + value.len()) as u64)
            .sum())
    }

    fn save_tracked_query(&self, query: &TrackedQuery) -> Result<()> {
        let bytes = codec::encode(query)?;
        self.state
            .lock()
            .batch_mut("save_tracked_query")
            .put(keys::tracked_query_key(query.query_id), bytes);
        Ok(())
    }

    fn delete_tracked_query(&self, query_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let batch = state.batch_mut("delete_tracked_query");
        batch.delete(keys::tracked_query_key(query_id));
        batch.delete_prefix(keys::tracked_query_keys_prefix(query_id));
        Ok(())
    }

    fn load_tracked_queries(&self) -> Result<Vec<TrackedQuery>> {
        let entries = self.state.lock().scan(keys::TRACKED_QUERIES_PREFIX);
        entries
            .iter()
            .map(|(key, bytes)| codec::decode(key, bytes))
            .collect()
    }

    fn reset_previously_active_tracked_queries(&self, last_use: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.batch_mut("reset_previously_active_tracked_queries");
        let entries = state.scan(keys::TRACKED_QUERIES_PREFIX);
        let mut updates = Vec::new();
        for (key, bytes) in &entries {
            let query: TrackedQuery = codec::decode(key, bytes)?;
            if query.active {
                let reset = query.updated_last_use(last_use, false);
                updates.push((key.clone(), codec::encode(&reset)?));
            }
        }
        debug!(count = updates.len(), "Reset previously active tracked queries");
        let batch = state.batch_mut("reset_previously_active_tracked_queries");
        for (key, bytes) in updates {
            batch.put(key, bytes);
        }
        Ok(())
    }

    fn save_tracked_query_keys(&self, query_id: u64, keys: &BTreeSet<String>) -> Result<()> {
        let mut state = self.state.lock();
        let batch = state.batch_mut("save_tracked_query_keys");
        batch.delete_prefix(keys::tracked_query_keys_prefix(query_id));
        for key in keys {
            batch.put(keys::tracked_query_key_entry(query_id, key), key.as_bytes().to_vec());
        }
        Ok(())
    }

    fn update_tracked_query_keys(
        &self,
        query_id: u64,
        added: &BTreeSet<String>,
        removed: &BTreeSet<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let batch = state.batch_mut("update_tracked_query_keys");
        for key in removed {
            batch.delete(keys::tracked_query_key_entry(query_id, key));
        }
        for key in added {
            batch.put(keys::tracked_query_key_entry(query_id, key), key.as_bytes().to_vec());
        }
        Ok(())
    }

    fn load_tracked_query_keys(&self, query_id: u64) -> Result<BTreeSet<String>> {
        let entries = self.state.lock().scan(&keys::tracked_query_keys_prefix(query_id));
        entries
            .into_iter()
            .map(|(key, bytes)| {
                String::from_utf8(bytes).map_err(|e| {
                    tidepool_core::Error::corruption(format!("{key}: tracked key is not UTF-8: {e}"))
                })
            })
            .collect()
    }

    fn prune_cache(&self, root: &Path, forest: &PruneForest) -> Result<()> {
        let mut state = self.state.lock();
        state.batch_mut("prune_cache");
        if !forest.prunes_anything() {
            return Ok(());
        }
        let entries = state.scan(&keys::server_cache_prefix(root));
        let doomed: Vec<String> = entries
            .into_keys()
            .filter(|key| {
                Path::relative(root, &keys::server_cache_path(key))
                    .is_some_and(|relative| forest.should_prune_unkept_descendants(&relative))
            })
            .collect();
        debug!(root = %root, leaves = doomed.len(), "Pruning server cache");
        let batch = state.batch_mut("prune_cache");
        for key in doomed {
            batch.delete(key);
        }
        Ok(())
    }

    fn begin_transaction(&self) {
        let mut state = self.state.lock();
        if state.transaction.is_some() {
            invariant_violation(
                "begin_transaction called while a transaction is already in progress",
            );
        }
        state.transaction = Some(Transaction {
            batch: WriteBatch::new(),
            successful: false,
        });
        debug!("Starting transaction");
    }

    fn set_transaction_successful(&self) {
        match &mut self.state.lock().transaction {
            Some(transaction) => transaction.successful = true,
            None => invariant_violation("set_transaction_successful called outside of a transaction"),
        }
    }

    fn end_transaction(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(transaction) = state.transaction.take() else {
            invariant_violation("end_transaction called outside of a transaction");
        };
        if !transaction.successful {
            warn!(
                ops = transaction.batch.len(),
                "Transaction not marked successful, discarding its writes"
            );
            return Ok(());
        }
        state.store.write(&transaction.batch)?;
        debug!(ops = transaction.batch.len(), "Transaction committed");
        Ok(())
    }
}
