//! Bookkeeping of watched queries
//!
//! Every query a listener has watched is tracked with two flags:
//! `complete` (the cache fully represents its server data) and `active`
//! (a listener watches it right now). Records live in a path-indexed
//! [`Tree`] mirrored into the storage engine. Inactive queries are
//! candidates for pruning, oldest `last_use` first.
//!
//! All mutating methods write through to the storage engine, so the caller
//! must hold an open transaction.

use crate::cache_policy::CachePolicy;
use crate::clock::Clock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tidepool_core::{
    check_invariant, Path, PruneForest, QueryParams, QuerySpec, Result, TrackedQuery, Tree,
};
use tidepool_storage::PersistenceStorageEngine;
use tracing::debug;

/// Tracked queries sharing a path, keyed by their parameters
pub type TrackedQueryMap = BTreeMap<QueryParams, TrackedQuery>;

fn has_default_complete(queries: &TrackedQueryMap) -> bool {
    queries
        .get(&QueryParams::default())
        .is_some_and(|query| query.complete)
}

fn has_active_default(queries: &TrackedQueryMap) -> bool {
    queries
        .get(&QueryParams::default())
        .is_some_and(|query| query.active)
}

fn is_prunable(query: &TrackedQuery) -> bool {
    !query.active
}

fn assert_valid_tracked_query(spec: &QuerySpec) {
    check_invariant(!spec.loads_all_data() || spec.is_default(), || {
        format!("cannot track non-default query at {} that loads all data", spec.path)
    });
}

/// In-memory index of tracked queries, persisted through a storage engine
pub struct TrackedQueryManager {
    storage: Arc<dyn PersistenceStorageEngine>,
    clock: Arc<dyn Clock>,
    tracked_query_tree: Tree<TrackedQueryMap>,
    next_query_id: u64,
}

impl std::fmt::Debug for TrackedQueryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedQueryManager")
            .field("next_query_id", &self.next_query_id)
            .finish()
    }
}

impl TrackedQueryManager {
    /// Load persisted queries. Queries active in a previous session are
    /// first reset to inactive, in their own transaction.
    pub fn new(storage: Arc<dyn PersistenceStorageEngine>, clock: Arc<dyn Clock>) -> Result<Self> {
        storage.begin_transaction();
        let reset = storage.reset_previously_active_tracked_queries(clock.now_millis());
        if reset.is_ok() {
            storage.set_transaction_successful();
        }
        storage.end_transaction()?;
        reset?;

        let mut manager = TrackedQueryManager {
            storage,
            clock,
            tracked_query_tree: Tree::new(),
            next_query_id: 0,
        };
        let queries = manager.storage.load_tracked_queries()?;
        debug!(count = queries.len(), "Loaded tracked queries");
        for query in queries {
            manager.next_query_id = manager.next_query_id.max(query.query_id + 1);
            manager.cache_tracked_query(query);
        }
        Ok(manager)
    }

    /// Record for `spec` after normalization.
    pub fn find_tracked_query(&self, spec: &QuerySpec) -> Option<&TrackedQuery> {
        let normalized = spec.normalized();
        self.tracked_query_tree
            .get_value_at(&normalized.path)
            .and_then(|queries| queries.get(&normalized.params))
    }

    /// Stop tracking `spec`. The query must be tracked.
    pub fn remove_tracked_query(&mut self, spec: &QuerySpec) -> Result<()> {
        let normalized = spec.normalized();
        let Some(query_id) = self.find_tracked_query(&normalized).map(|q| q.query_id) else {
            tidepool_core::invariant_violation(format!(
                "cannot remove untracked query at {}",
                normalized.path
            ));
        };
        self.storage.delete_tracked_query(query_id)?;
        if let Some(queries) = self.tracked_query_tree.get_value_at_mut(&normalized.path) {
            queries.remove(&normalized.params);
            if queries.is_empty() {
                self.tracked_query_tree.set_value_at(&normalized.path, None);
            }
        }
        Ok(())
    }

    /// Mark `spec` as watched by a listener.
    pub fn set_query_active(&mut self, spec: &QuerySpec) -> Result<()> {
        self.set_query_active_flag(spec, true)
    }

    /// Mark `spec` as no longer watched. The query must be tracked.
    pub fn set_query_inactive(&mut self, spec: &QuerySpec) -> Result<()> {
        self.set_query_active_flag(spec, false)
    }

    /// Update the activity flag and `last_use` of `spec`, tracking it as a
    /// new incomplete query when it is being activated for the first time.
    pub fn set_query_active_flag(&mut self, spec: &QuerySpec, active: bool) -> Result<()> {
        let normalized = spec.normalized();
        let last_use = self.clock.now_millis();
        let updated = match self.find_tracked_query(&normalized) {
            Some(existing) => existing.updated_last_use(last_use, active),
            None => {
                check_invariant(active, || {
                    format!(
                        "cannot deactivate untracked query at {}",
                        normalized.path
                    )
                });
                let query_id = self.next_query_id;
                self.next_query_id += 1;
                TrackedQuery::new(query_id, normalized, last_use, false, active)
            }
        };
        self.save_tracked_query(updated)
    }

    /// Mark `spec` complete if it is tracked.
    pub fn set_query_complete_if_exists(&mut self, spec: &QuerySpec) -> Result<()> {
        match self.find_tracked_query(spec) {
            Some(query) if !query.complete => {
                let updated = query.set_complete();
                self.save_tracked_query(updated)
            }
            _ => Ok(()),
        }
    }

    /// Mark every tracked query at or below `path` complete.
    pub fn set_queries_complete(&mut self, path: &Path) -> Result<()> {
        let mut incomplete = Vec::new();
        self.tracked_query_tree.call_on_each(path, |_, queries| {
            incomplete.extend(
                queries
                    .values()
                    .filter(|query| !query.complete)
                    .map(TrackedQuery::set_complete),
            );
        });
        for query in incomplete {
            self.save_tracked_query(query)?;
        }
        Ok(())
    }

    /// True when the cache fully represents `spec`: either a default query
    /// at or above its path is complete, or its own filtered record is.
    pub fn is_query_complete(&self, spec: &QuerySpec) -> bool {
        if self.included_in_default_complete_query(&spec.path) {
            return true;
        }
        if spec.loads_all_data() {
            return false;
        }
        self.tracked_query_tree
            .get_value_at(&spec.path)
            .and_then(|queries| queries.get(&spec.params))
            .is_some_and(|query| query.complete)
    }

    /// Child keys of `path` whose data is known to be complete. `path`
    /// itself must not be complete.
    pub fn get_known_complete_children(&self, path: &Path) -> Result<BTreeSet<String>> {
        check_invariant(!self.is_query_complete(&QuerySpec::new(path.clone())), || {
            format!("{path} is fully complete")
        });

        let mut complete_children = BTreeSet::new();
        let Some(node) = self.tracked_query_tree.get_child(path) else {
            return Ok(complete_children);
        };

        let filtered_ids = self.filtered_query_ids_at_path(path);
        if !filtered_ids.is_empty() {
            complete_children.extend(self.storage.load_tracked_query_keys_for(&filtered_ids)?);
        }

        for (key, child) in self.tracked_query_tree.children(node) {
            if self
                .tracked_query_tree
                .node_value(child)
                .is_some_and(has_default_complete)
            {
                complete_children.insert(key.to_string());
            }
        }
        Ok(complete_children)
    }

    /// Track `path` as a complete default query unless a complete default
    /// query already covers it.
    pub fn ensure_complete_tracked_query(&mut self, path: &Path) -> Result<()> {
        if self.included_in_default_complete_query(path) {
            return Ok(());
        }
        let spec = QuerySpec::new(path.clone());
        let updated = match self.find_tracked_query(&spec) {
            Some(existing) => {
                check_invariant(!existing.complete, || {
                    format!("complete default query at {path} was not detected")
                });
                existing.set_complete()
            }
            None => {
                let query_id = self.next_query_id;
                self.next_query_id += 1;
                // Never watched, so it ranks oldest for pruning.
                TrackedQuery::new(query_id, spec, 0, true, false)
            }
        };
        self.save_tracked_query(updated)
    }

    /// True when an active default query exists at or above `path`.
    pub fn has_active_default_query(&self, path: &Path) -> bool {
        self.tracked_query_tree
            .find_root_most_matching_path(path, has_active_default)
            .is_some()
    }

    /// Number of inactive queries.
    pub fn count_of_prunable_queries(&self) -> u64 {
        self.queries_matching(is_prunable).len() as u64
    }

    /// Stop tracking the least recently used inactive queries and describe
    /// the cache locations to evict.
    ///
    /// The oldest prunable queries are marked prune and removed. Remaining
    /// prunable queries and every active query are marked keep.
    pub fn prune_old_queries(&mut self, policy: &dyn CachePolicy) -> Result<PruneForest> {
        let mut prunable = self.queries_matching(is_prunable);
        let count_to_prune = count_to_prune(policy, prunable.len() as u64) as usize;
        debug!(
            prunable = prunable.len(),
            count_to_prune, "Pruning old queries"
        );

        prunable.sort_by_key(|query| query.last_use);
        let mut forest = PruneForest::new();
        for query in &prunable[..count_to_prune] {
            forest.prune(&query.query_spec.path);
            self.remove_tracked_query(&query.query_spec)?;
        }
        for query in &prunable[count_to_prune..] {
            forest.keep(&query.query_spec.path);
        }

        let unprunable = self.queries_matching(|query| !is_prunable(query));
        debug!(unprunable = unprunable.len(), "Keeping active queries");
        for query in &unprunable {
            forest.keep(&query.query_spec.path);
        }
        Ok(forest)
    }

    fn included_in_default_complete_query(&self, path: &Path) -> bool {
        self.tracked_query_tree
            .find_root_most_matching_path(path, has_default_complete)
            .is_some()
    }

    fn filtered_query_ids_at_path(&self, path: &Path) -> BTreeSet<u64> {
        self.tracked_query_tree
            .get_value_at(path)
            .map(|queries| {
                queries
                    .values()
                    .filter(|query| !query.query_spec.loads_all_data())
                    .map(|query| query.query_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn cache_tracked_query(&mut self, query: TrackedQuery) {
        assert_valid_tracked_query(&query.query_spec);
        let path = query.query_spec.path.clone();
        if self.tracked_query_tree.get_value_at(&path).is_none() {
            self.tracked_query_tree
                .set_value_at(&path, TrackedQueryMap::new());
        }
        if let Some(queries) = self.tracked_query_tree.get_value_at_mut(&path) {
            if let Some(existing) = queries.get(&query.query_spec.params) {
                check_invariant(existing.query_id == query.query_id, || {
                    format!(
                        "query at {path} tracked under ids {} and {}",
                        existing.query_id, query.query_id
                    )
                });
            }
            queries.insert(query.query_spec.params.clone(), query);
        }
    }

    fn save_tracked_query(&mut self, query: TrackedQuery) -> Result<()> {
        self.storage.save_tracked_query(&query)?;
        self.cache_tracked_query(query);
        Ok(())
    }

    fn queries_matching(&self, predicate: impl Fn(&TrackedQuery) -> bool) -> Vec<TrackedQuery> {
        let mut matching = Vec::new();
        self.tracked_query_tree.call_on_each(&Path::root(), |_, queries| {
            matching.extend(queries.values().filter(|&query| predicate(query)).cloned());
        });
        matching
    }
}

fn count_to_prune(policy: &dyn CachePolicy, prunable_count: u64) -> u64 {
    let percent_to_keep = 1.0 - policy.percent_of_queries_to_prune_at_once();
    let count_to_keep = ((prunable_count as f64 * percent_to_keep) as u64)
        .min(policy.max_number_of_queries_to_keep());
    prunable_count - count_to_keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_policy::{LruCachePolicy, NoopCachePolicy};
    use crate::clock::TestClock;
    use tidepool_core::QueryBound;
    use tidepool_storage::InMemoryStorageEngine;

    struct Fixture {
        storage: Arc<InMemoryStorageEngine>,
        clock: Arc<TestClock>,
        manager: TrackedQueryManager,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorageEngine::new());
        let clock = Arc::new(TestClock::new(1000));
        let manager = TrackedQueryManager::new(storage.clone(), clock.clone()).unwrap();
        storage.begin_transaction();
        Fixture {
            storage,
            clock,
            manager,
        }
    }

    fn filtered(path: &str) -> QuerySpec {
        QuerySpec::with_params(path, QueryParams::default().limit_first(3))
    }

    fn p(s: &str) -> Path {
        Path::new(s)
    }

    #[test]
    fn test_activating_new_query_tracks_it() {
        let mut f = fixture();
        let spec = QuerySpec::new("a");
        f.manager.set_query_active(&spec).unwrap();

        let query = f.manager.find_tracked_query(&spec).unwrap();
        assert!(query.active);
        assert!(!query.complete);
        assert_eq!(query.last_use, 1000);
        assert_eq!(query.query_id, 0);
    }

    #[test]
    fn test_loads_all_data_specs_are_normalized() {
        let mut f = fixture();
        let ordered = QuerySpec::with_params(
            "a",
            QueryParams::default().order_by(tidepool_core::OrderBy::Key),
        );
        f.manager.set_query_active(&ordered).unwrap();
        assert!(f.manager.find_tracked_query(&QuerySpec::new("a")).is_some());
        assert!(f.manager.has_active_default_query(&p("a/b")));
    }

    #[test]
    fn test_deactivation_updates_last_use() {
        let mut f = fixture();
        let spec = QuerySpec::new("a");
        f.manager.set_query_active(&spec).unwrap();
        f.clock.advance(50);
        f.manager.set_query_inactive(&spec).unwrap();
        let query = f.manager.find_tracked_query(&spec).unwrap();
        assert!(!query.active);
        assert_eq!(query.last_use, 1050);
        assert_eq!(f.manager.count_of_prunable_queries(), 1);
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_deactivating_untracked_query_is_fatal() {
        let mut f = fixture();
        let _ = f.manager.set_query_inactive(&QuerySpec::new("nope"));
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_removing_untracked_query_is_fatal() {
        let mut f = fixture();
        let _ = f.manager.remove_tracked_query(&QuerySpec::new("nope"));
    }

    #[test]
    fn test_remove_tracked_query() {
        let mut f = fixture();
        let spec = filtered("a");
        f.manager.set_query_active(&spec).unwrap();
        f.manager.remove_tracked_query(&spec).unwrap();
        assert!(f.manager.find_tracked_query(&spec).is_none());
    }

    #[test]
    fn test_completeness_is_inherited_from_default_ancestors() {
        let mut f = fixture();
        f.manager.set_query_active(&QuerySpec::new("a")).unwrap();
        assert!(!f.manager.is_query_complete(&QuerySpec::new("a/b")));

        f.manager.set_query_complete_if_exists(&QuerySpec::new("a")).unwrap();
        assert!(f.manager.is_query_complete(&QuerySpec::new("a")));
        assert!(f.manager.is_query_complete(&QuerySpec::new("a/b/c")));
        assert!(f.manager.is_query_complete(&filtered("a/b")));
        assert!(!f.manager.is_query_complete(&QuerySpec::new("b")));
    }

    #[test]
    fn test_filtered_completeness_is_exact() {
        let mut f = fixture();
        let spec = filtered("a");
        f.manager.set_query_active(&spec).unwrap();
        f.manager.set_query_complete_if_exists(&spec).unwrap();
        assert!(f.manager.is_query_complete(&spec));
        assert!(!f.manager.is_query_complete(&QuerySpec::new("a")));
        let other = QuerySpec::with_params("a", QueryParams::default().limit_last(3));
        assert!(!f.manager.is_query_complete(&other));
    }

    #[test]
    fn test_set_queries_complete_covers_subtree() {
        let mut f = fixture();
        f.manager.set_query_active(&filtered("a/b")).unwrap();
        f.manager.set_query_active(&QuerySpec::new("a/c/d")).unwrap();
        f.manager.set_query_active(&QuerySpec::new("z")).unwrap();
        f.manager.set_queries_complete(&p("a")).unwrap();

        assert!(f.manager.find_tracked_query(&filtered("a/b")).unwrap().complete);
        assert!(f.manager.find_tracked_query(&QuerySpec::new("a/c/d")).unwrap().complete);
        assert!(!f.manager.find_tracked_query(&QuerySpec::new("z")).unwrap().complete);
    }

    #[test]
    fn test_ensure_complete_tracked_query() {
        let mut f = fixture();
        f.manager.ensure_complete_tracked_query(&p("a")).unwrap();
        let query = f.manager.find_tracked_query(&QuerySpec::new("a")).unwrap();
        assert!(query.complete);
        assert!(!query.active);
        assert!(f.manager.is_query_complete(&QuerySpec::new("a")));

        // Upgrades an existing incomplete record in place.
        f.manager.set_query_active(&QuerySpec::new("b")).unwrap();
        let id = f.manager.find_tracked_query(&QuerySpec::new("b")).unwrap().query_id;
        f.manager.ensure_complete_tracked_query(&p("b")).unwrap();
        let query = f.manager.find_tracked_query(&QuerySpec::new("b")).unwrap();
        assert!(query.complete && query.active);
        assert_eq!(query.query_id, id);

        // Covered paths are left alone.
        f.manager.ensure_complete_tracked_query(&p("a/x")).unwrap();
        assert!(f.manager.find_tracked_query(&QuerySpec::new("a/x")).is_none());
    }

    #[test]
    fn test_known_complete_children() {
        let mut f = fixture();
        let spec = filtered("a");
        f.manager.set_query_active(&spec).unwrap();
        let id = f.manager.find_tracked_query(&spec).unwrap().query_id;
        f.storage
            .save_tracked_query_keys(id, &BTreeSet::from(["k1".to_string(), "k2".to_string()]))
            .unwrap();
        f.manager.ensure_complete_tracked_query(&p("a/c")).unwrap();
        f.manager.set_query_active(&QuerySpec::new("a/d")).unwrap();

        let children = f.manager.get_known_complete_children(&p("a")).unwrap();
        let expected: BTreeSet<String> =
            ["c", "k1", "k2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(children, expected);

        assert!(f
            .manager
            .get_known_complete_children(&p("untracked"))
            .unwrap()
            .is_empty());
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_known_complete_children_of_complete_path_is_fatal() {
        let mut f = fixture();
        f.manager.ensure_complete_tracked_query(&p("a")).unwrap();
        let _ = f.manager.get_known_complete_children(&p("a/b"));
    }

    #[test]
    fn test_prune_old_queries_evicts_least_recently_used() {
        let mut f = fixture();
        for (i, name) in ["q0", "q1", "q2", "q3", "q4"].iter().enumerate() {
            f.clock.set(100 + i as u64);
            let spec = QuerySpec::new(*name);
            f.manager.set_query_active(&spec).unwrap();
            f.manager.set_query_inactive(&spec).unwrap();
        }
        f.manager.set_query_active(&QuerySpec::new("live")).unwrap();

        let forest = f
            .manager
            .prune_old_queries(&LruCachePolicy::new(0))
            .unwrap();

        // 5 prunable, keep floor(5 * 0.8) = 4, prune 1.
        assert!(forest.should_prune_unkept_descendants(&p("q0")));
        for kept in ["q1", "q2", "q3", "q4", "live"] {
            assert!(forest.should_keep(&p(kept)), "{kept} should be kept");
        }
        assert!(f.manager.find_tracked_query(&QuerySpec::new("q0")).is_none());
        assert_eq!(f.manager.count_of_prunable_queries(), 4);
    }

    #[test]
    fn test_prune_old_queries_with_noop_policy_prunes_nothing() {
        let mut f = fixture();
        let spec = QuerySpec::new("a");
        f.manager.set_query_active(&spec).unwrap();
        f.manager.set_query_inactive(&spec).unwrap();
        let forest = f.manager.prune_old_queries(&NoopCachePolicy).unwrap();
        assert!(!forest.prunes_anything());
        assert!(forest.should_keep(&p("a")));
    }

    #[test]
    fn test_count_to_prune() {
        let policy = LruCachePolicy::new(0);
        assert_eq!(count_to_prune(&policy, 0), 0);
        assert_eq!(count_to_prune(&policy, 10), 2);
        assert_eq!(count_to_prune(&policy, 2000), 1000);
    }

    #[test]
    fn test_filtered_and_default_queries_share_a_path() {
        let mut f = fixture();
        let bounded = QuerySpec::with_params(
            "a",
            QueryParams::default().start_at(QueryBound::new(1)),
        );
        f.manager.set_query_active(&bounded).unwrap();
        f.manager.set_query_active(&QuerySpec::new("a")).unwrap();
        f.manager.set_query_inactive(&bounded).unwrap();
        assert_eq!(f.manager.count_of_prunable_queries(), 1);
        assert_ne!(
            f.manager.find_tracked_query(&bounded).unwrap().query_id,
            f.manager.find_tracked_query(&QuerySpec::new("a")).unwrap().query_id
        );
    }
}
