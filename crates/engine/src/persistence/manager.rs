//! Orchestration of the offline cache
//!
//! [`PersistenceManager`] is the single entry point the sync layer talks
//! to. It applies user writes and server updates to the storage engine,
//! keeps the [`TrackedQueryManager`] in step, and every few server updates
//! asks the [`CachePolicy`] whether the cache must shrink.
//!
//! Mutating calls must run inside [`PersistenceManager::run_in_transaction`].

use super::config::{BackendKind, PersistenceConfig, CONFIG_FILE_NAME};
use crate::cache_policy::{CachePolicy, LruCachePolicy, NoopCachePolicy};
use crate::clock::{Clock, SystemClock};
use crate::tracked_query_manager::TrackedQueryManager;
use std::collections::BTreeSet;
use std::path::Path as FsPath;
use std::sync::Arc;
use tidepool_core::{
    check_invariant, CompoundWrite, Path, QuerySpec, Result, UserWriteRecord, Value,
};
use tidepool_durability::KvConfig;
use tidepool_storage::{
    DurableStorageEngine, InMemoryStorageEngine, NoopStorageEngine, PersistenceStorageEngine,
};
use tracing::{debug, info};

/// Cached server data for one query
#[derive(Debug, Clone, PartialEq)]
pub struct CacheNode {
    /// Cached data at the query location, restricted to the known keys
    /// when `filtered` is set
    pub value: Value,
    /// The data fully represents the query's server value
    pub complete: bool,
    /// `value` holds only the tracked or known-complete children
    pub filtered: bool,
}

/// Offline cache facade over a storage engine
pub struct PersistenceManager {
    storage: Arc<dyn PersistenceStorageEngine>,
    tracked_query_manager: TrackedQueryManager,
    cache_policy: Box<dyn CachePolicy>,
    server_cache_updates_since_last_prune_check: u64,
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("tracked_query_manager", &self.tracked_query_manager)
            .field(
                "server_cache_updates_since_last_prune_check",
                &self.server_cache_updates_since_last_prune_check,
            )
            .finish()
    }
}

impl PersistenceManager {
    /// Build over an already selected backend.
    pub fn new(
        storage: Arc<dyn PersistenceStorageEngine>,
        clock: Arc<dyn Clock>,
        cache_policy: Box<dyn CachePolicy>,
    ) -> Result<Self> {
        let tracked_query_manager = TrackedQueryManager::new(storage.clone(), clock)?;
        Ok(PersistenceManager {
            storage,
            tracked_query_manager,
            cache_policy,
            server_cache_updates_since_last_prune_check: 0,
        })
    }

    /// Open the backend named by `config` in `dir`.
    ///
    /// The durable backend is paired with an LRU cache policy; the memory
    /// and disabled backends never prune.
    pub fn open(dir: impl AsRef<FsPath>, config: PersistenceConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref();
        let kind = config.backend_kind()?;
        let storage: Arc<dyn PersistenceStorageEngine> = match kind {
            BackendKind::Durable => {
                let kv_config = KvConfig::default().with_sync_on_commit(config.sync_on_commit);
                Arc::new(DurableStorageEngine::open(dir, kv_config)?)
            }
            BackendKind::Memory => Arc::new(InMemoryStorageEngine::new()),
            BackendKind::Disabled => Arc::new(NoopStorageEngine::new()),
        };
        let cache_policy: Box<dyn CachePolicy> = match kind {
            BackendKind::Durable => Box::new(LruCachePolicy::new(config.cache_size_bytes)),
            BackendKind::Memory | BackendKind::Disabled => Box::new(NoopCachePolicy),
        };
        info!(dir = %dir.display(), backend = ?kind, "Opened persistence");
        Self::new(storage, Arc::new(SystemClock), cache_policy)
    }

    /// Open `dir` using its `tidepool.toml`, creating a default one first
    /// when it is missing.
    pub fn open_dir(dir: impl AsRef<FsPath>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let config_path = dir.join(CONFIG_FILE_NAME);
        PersistenceConfig::write_default_if_missing(&config_path)?;
        let config = PersistenceConfig::from_file(&config_path)?;
        Self::open(dir, config)
    }

    /// The underlying storage engine.
    pub fn storage(&self) -> &Arc<dyn PersistenceStorageEngine> {
        &self.storage
    }

    /// The tracked query index.
    pub fn tracked_query_manager(&self) -> &TrackedQueryManager {
        &self.tracked_query_manager
    }

    // ========================================================================
    // User writes
    // ========================================================================

    /// Persist an unacknowledged overwrite.
    pub fn save_user_overwrite(&self, path: &Path, value: &Value, write_id: i64) -> Result<()> {
        self.storage.save_user_overwrite(path, value, write_id)
    }

    /// Persist an unacknowledged merge.
    pub fn save_user_merge(&self, path: &Path, merge: &CompoundWrite, write_id: i64) -> Result<()> {
        self.storage.save_user_merge(path, merge, write_id)
    }

    /// Forget an acknowledged or reverted write.
    pub fn remove_user_write(&self, write_id: i64) -> Result<()> {
        self.storage.remove_user_write(write_id)
    }

    /// Forget every pending write.
    pub fn remove_all_user_writes(&self) -> Result<()> {
        self.storage.remove_all_user_writes()
    }

    /// Pending writes in write-id order.
    pub fn load_user_writes(&self) -> Result<Vec<UserWriteRecord>> {
        self.storage.load_user_writes()
    }

    /// Fold an acknowledged overwrite into the server cache.
    ///
    /// Skipped when an active default query covers `path`: its listener
    /// will receive the authoritative server data.
    pub fn apply_user_write_to_server_cache(&mut self, path: &Path, value: &Value) -> Result<()> {
        if self.tracked_query_manager.has_active_default_query(path) {
            return Ok(());
        }
        self.storage.overwrite_server_cache(path, value)?;
        self.tracked_query_manager.ensure_complete_tracked_query(path)
    }

    /// Fold an acknowledged merge into the server cache, one write at a time.
    pub fn apply_user_merge_to_server_cache(
        &mut self,
        path: &Path,
        merge: &CompoundWrite,
    ) -> Result<()> {
        for (relative, value) in merge.writes() {
            self.apply_user_write_to_server_cache(&path.child_path(&relative), &value)?;
        }
        Ok(())
    }

    // ========================================================================
    // Server cache
    // ========================================================================

    /// Cached data for `spec` together with its completeness.
    ///
    /// A complete filtered query returns only its tracked keys. An
    /// incomplete query returns only the children known to be complete.
    pub fn server_cache(&self, spec: &QuerySpec) -> Result<CacheNode> {
        let (complete, known_keys) = if self.tracked_query_manager.is_query_complete(spec) {
            let tracked = self
                .tracked_query_manager
                .find_tracked_query(spec)
                .filter(|query| !spec.loads_all_data() && query.complete);
            let keys = match tracked {
                Some(query) => Some(self.storage.load_tracked_query_keys(query.query_id)?),
                None => None,
            };
            (true, keys)
        } else {
            let keys = self
                .tracked_query_manager
                .get_known_complete_children(&spec.path)?;
            (false, Some(keys))
        };

        let cached = self.storage.server_cache(&spec.path)?;
        let node = match known_keys {
            Some(keys) => {
                let mut filtered = Value::Null;
                for key in &keys {
                    let child = Path::new(key);
                    filtered.update_child(&child, cached.get_child(&child).clone());
                }
                CacheNode {
                    value: filtered,
                    complete,
                    filtered: true,
                }
            }
            None => CacheNode {
                value: cached,
                complete,
                filtered: false,
            },
        };
        Ok(node)
    }

    /// Store server data received for `spec` and mark it complete.
    ///
    /// Unfiltered data replaces the cache at the query path; filtered data
    /// is merged child by child.
    pub fn update_server_cache(&mut self, spec: &QuerySpec, value: &Value) -> Result<()> {
        if spec.loads_all_data() {
            self.storage.overwrite_server_cache(&spec.path, value)?;
        } else {
            self.storage.merge_into_server_cache(&spec.path, value)?;
        }
        self.set_query_complete(spec)?;
        self.do_prune_check_after_server_update()
    }

    /// Store a server merge at `path`.
    pub fn update_server_cache_with_merge(
        &mut self,
        path: &Path,
        merge: &CompoundWrite,
    ) -> Result<()> {
        self.storage
            .merge_compound_write_into_server_cache(path, merge)?;
        self.do_prune_check_after_server_update()
    }

    // ========================================================================
    // Tracked queries
    // ========================================================================

    /// A listener started watching `spec`.
    pub fn set_query_active(&mut self, spec: &QuerySpec) -> Result<()> {
        self.tracked_query_manager.set_query_active(spec)
    }

    /// A listener stopped watching `spec`.
    pub fn set_query_inactive(&mut self, spec: &QuerySpec) -> Result<()> {
        self.tracked_query_manager.set_query_inactive(spec)
    }

    /// Record that the cache now fully represents `spec`. An unfiltered
    /// query also completes every query tracked below it.
    pub fn set_query_complete(&mut self, spec: &QuerySpec) -> Result<()> {
        if spec.loads_all_data() {
            self.tracked_query_manager.set_queries_complete(&spec.path)
        } else {
            self.tracked_query_manager.set_query_complete_if_exists(spec)
        }
    }

    /// Replace the keys matched by the active filtered query `spec`.
    pub fn set_tracked_query_keys(&self, spec: &QuerySpec, keys: &BTreeSet<String>) -> Result<()> {
        let query_id = self.active_filtered_query_id(spec);
        self.storage.save_tracked_query_keys(query_id, keys)
    }

    /// Add and remove keys matched by the active filtered query `spec`.
    pub fn update_tracked_query_keys(
        &self,
        spec: &QuerySpec,
        added: &BTreeSet<String>,
        removed: &BTreeSet<String>,
    ) -> Result<()> {
        let query_id = self.active_filtered_query_id(spec);
        self.storage
            .update_tracked_query_keys(query_id, added, removed)
    }

    fn active_filtered_query_id(&self, spec: &QuerySpec) -> u64 {
        check_invariant(!spec.loads_all_data(), || {
            format!("keys are only tracked for filtered queries, not {}", spec.path)
        });
        match self.tracked_query_manager.find_tracked_query(spec) {
            Some(query) if query.active => query.query_id,
            _ => tidepool_core::invariant_violation(format!(
                "keys are only tracked for active queries, not {}",
                spec.path
            )),
        }
    }

    // ========================================================================
    // Pruning and transactions
    // ========================================================================

    fn do_prune_check_after_server_update(&mut self) -> Result<()> {
        self.server_cache_updates_since_last_prune_check += 1;
        if !self
            .cache_policy
            .should_check_cache_size(self.server_cache_updates_since_last_prune_check)
        {
            return Ok(());
        }
        debug!("Reached prune check threshold");
        self.server_cache_updates_since_last_prune_check = 0;

        let mut cache_size = self.storage.server_cache_estimated_size_in_bytes()?;
        debug!(cache_size, "Cache size");
        while self.cache_policy.should_prune(
            cache_size,
            self.tracked_query_manager.count_of_prunable_queries(),
        ) {
            let forest = self
                .tracked_query_manager
                .prune_old_queries(self.cache_policy.as_ref())?;
            if !forest.prunes_anything() {
                break;
            }
            self.storage.prune_cache(&Path::root(), &forest)?;
            cache_size = self.storage.server_cache_estimated_size_in_bytes()?;
            debug!(cache_size, "Cache size after prune");
        }
        Ok(())
    }

    /// Run `f` inside one storage transaction, committing only when it
    /// returns `Ok`.
    pub fn run_in_transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.storage.begin_transaction();
        let result = f(self);
        if result.is_ok() {
            self.storage.set_transaction_successful();
        }
        let ended = self.storage.end_transaction();
        let value = result?;
        ended?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use serde_json::json;
    use tidepool_core::{Error, QueryParams};

    fn v(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    fn p(s: &str) -> Path {
        Path::new(s)
    }

    fn memory_manager(policy: Box<dyn CachePolicy>) -> PersistenceManager {
        PersistenceManager::new(
            Arc::new(InMemoryStorageEngine::new()),
            Arc::new(TestClock::new(1)),
            policy,
        )
        .unwrap()
    }

    fn filtered(path: &str) -> QuerySpec {
        QuerySpec::with_params(path, QueryParams::default().limit_first(2))
    }

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_update_server_cache_marks_complete() {
        let mut pm = memory_manager(Box::new(NoopCachePolicy));
        let spec = QuerySpec::new("rooms");
        pm.run_in_transaction(|pm| {
            pm.set_query_active(&spec)?;
            pm.update_server_cache(&spec, &v(json!({"a": 1, "b": 2})))
        })
        .unwrap();

        let node = pm.server_cache(&spec).unwrap();
        assert!(node.complete);
        assert!(!node.filtered);
        assert_eq!(node.value, v(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_incomplete_query_returns_known_complete_children() {
        let mut pm = memory_manager(Box::new(NoopCachePolicy));
        pm.run_in_transaction(|pm| {
            pm.set_query_active(&QuerySpec::new("rooms/a"))?;
            pm.update_server_cache(&QuerySpec::new("rooms/a"), &v(json!({"x": 1})))?;
            pm.update_server_cache_with_merge(
                &p("rooms"),
                &CompoundWrite::new().add_write(&p("b"), Value::Int(2)),
            )
        })
        .unwrap();

        let node = pm.server_cache(&QuerySpec::new("rooms")).unwrap();
        assert!(!node.complete);
        assert!(node.filtered);
        assert_eq!(node.value, v(json!({"a": {"x": 1}})));
    }

    #[test]
    fn test_complete_filtered_query_returns_tracked_keys() {
        let mut pm = memory_manager(Box::new(NoopCachePolicy));
        let spec = filtered("list");
        pm.run_in_transaction(|pm| {
            pm.set_query_active(&spec)?;
            pm.update_server_cache(&spec, &v(json!({"k1": 1, "k2": 2})))?;
            pm.set_tracked_query_keys(&spec, &keys(&["k1", "k2"]))?;
            pm.update_tracked_query_keys(&spec, &keys(&["k3"]), &keys(&["k1"]))
        })
        .unwrap();

        let node = pm.server_cache(&spec).unwrap();
        assert!(node.complete);
        assert!(node.filtered);
        // k3 is tracked but not cached, so it reads as absent.
        assert_eq!(node.value, v(json!({"k2": 2})));
    }

    #[test]
    fn test_apply_user_write_skipped_under_active_default_query() {
        let mut pm = memory_manager(Box::new(NoopCachePolicy));
        pm.run_in_transaction(|pm| {
            pm.set_query_active(&QuerySpec::new("a"))?;
            pm.apply_user_write_to_server_cache(&p("a/b"), &Value::Int(1))?;
            pm.apply_user_write_to_server_cache(&p("z"), &Value::Int(2))
        })
        .unwrap();

        assert_eq!(pm.storage().server_cache(&p("a/b")).unwrap(), Value::Null);
        assert_eq!(pm.storage().server_cache(&p("z")).unwrap(), Value::Int(2));
        assert!(pm
            .tracked_query_manager()
            .is_query_complete(&QuerySpec::new("z")));
    }

    #[test]
    fn test_apply_user_merge_writes_each_child() {
        let mut pm = memory_manager(Box::new(NoopCachePolicy));
        let merge = CompoundWrite::new()
            .add_write(&p("x"), Value::Int(1))
            .add_write(&p("y/z"), Value::Int(2));
        pm.run_in_transaction(|pm| pm.apply_user_merge_to_server_cache(&p("m"), &merge))
            .unwrap();

        assert_eq!(
            pm.storage().server_cache(&p("m")).unwrap(),
            v(json!({"x": 1, "y": {"z": 2}}))
        );
        assert!(pm
            .tracked_query_manager()
            .is_query_complete(&QuerySpec::new("m/y/z")));
        assert!(!pm
            .tracked_query_manager()
            .is_query_complete(&QuerySpec::new("m")));
    }

    #[test]
    fn test_failed_transaction_reports_closure_error() {
        let mut pm = memory_manager(Box::new(NoopCachePolicy));
        let err = pm
            .run_in_transaction(|_| -> Result<()> { Err(Error::corruption("boom")) })
            .unwrap_err();
        assert!(err.is_corruption());
        // The transaction was closed, so a new one can start.
        pm.run_in_transaction(|pm| pm.set_query_active(&QuerySpec::new("a")))
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_tracking_keys_of_unfiltered_query_is_fatal() {
        let mut pm = memory_manager(Box::new(NoopCachePolicy));
        let spec = QuerySpec::new("a");
        let _ = pm.run_in_transaction(|pm| {
            pm.set_query_active(&spec)?;
            pm.set_tracked_query_keys(&spec, &keys(&["k"]))
        });
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_tracking_keys_of_inactive_query_is_fatal() {
        let mut pm = memory_manager(Box::new(NoopCachePolicy));
        let spec = filtered("a");
        let _ = pm.run_in_transaction(|pm| {
            pm.set_query_active(&spec)?;
            pm.set_query_inactive(&spec)?;
            pm.update_tracked_query_keys(&spec, &keys(&["k"]), &BTreeSet::new())
        });
    }

    #[test]
    fn test_prune_check_evicts_inactive_queries() {
        // Any cache is over a zero-byte budget.
        let mut pm = memory_manager(Box::new(LruCachePolicy::new(0)));
        pm.run_in_transaction(|pm| {
            for i in 0..5 {
                let spec = QuerySpec::new(format!("q{i}"));
                pm.set_query_active(&spec)?;
                pm.update_server_cache(&spec, &Value::Int(i))?;
                pm.set_query_inactive(&spec)?;
            }
            let live = QuerySpec::new("live");
            pm.set_query_active(&live)?;
            // Push past the update threshold to force a size check.
            for _ in 0..1000 {
                pm.update_server_cache(&live, &Value::from("data"))?;
            }
            Ok(())
        })
        .unwrap();

        // Every inactive query was pruned away; the active one survives.
        assert_eq!(pm.tracked_query_manager().count_of_prunable_queries(), 0);
        for i in 0..5 {
            assert_eq!(
                pm.storage().server_cache(&p(&format!("q{i}"))).unwrap(),
                Value::Null
            );
        }
        assert_eq!(
            pm.storage().server_cache(&p("live")).unwrap(),
            Value::from("data")
        );
    }

    #[test]
    fn test_open_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig::for_testing().with_backend("disabled");
        let mut pm = PersistenceManager::open(dir.path(), config).unwrap();
        pm.run_in_transaction(|pm| pm.apply_user_write_to_server_cache(&p("a"), &Value::Int(1)))
            .unwrap();
        assert_eq!(pm.storage().server_cache(&p("a")).unwrap(), Value::Null);

        let bad = PersistenceConfig::for_testing().with_backend("cloud");
        assert!(PersistenceManager::open(dir.path(), bad).is_err());
    }

    #[test]
    fn test_open_dir_writes_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        PersistenceManager::open_dir(&data).unwrap();
        assert!(data.join(CONFIG_FILE_NAME).exists());
        assert!(data.join(tidepool_durability::LOG_FILE_NAME).exists());
    }
}
