//! Integration tests for PersistenceManager over the durable backend
//!
//! These tests verify state that must survive a restart:
//! - Server cache contents and query completeness
//! - Pending user writes
//! - Tracked queries, reset to inactive on reopen
//! - Eviction of least recently used queries

use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path as FsPath;
use std::sync::Arc;
use tempfile::TempDir;
use tidepool_core::{CompoundWrite, Path, QueryParams, QuerySpec, Value};
use tidepool_durability::KvConfig;
use tidepool_engine::{
    CachePolicy, LruCachePolicy, NoopCachePolicy, PersistenceConfig, PersistenceManager,
    TestClock, TrackedQueryManager,
};
use tidepool_storage::{DurableStorageEngine, InMemoryStorageEngine, PersistenceStorageEngine};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn open(dir: &FsPath, clock: Arc<TestClock>, policy: Box<dyn CachePolicy>) -> PersistenceManager {
    let storage = DurableStorageEngine::open(dir, KvConfig::for_testing()).unwrap();
    PersistenceManager::new(Arc::new(storage), clock, policy).unwrap()
}

fn v(json: serde_json::Value) -> Value {
    Value::from(json)
}

#[test]
fn test_complete_query_survives_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let spec = QuerySpec::new("rooms/eros");

    {
        let mut pm = open(dir.path(), Arc::new(TestClock::new(10)), Box::new(NoopCachePolicy));
        pm.run_in_transaction(|pm| {
            pm.storage()
                .overwrite_server_cache(&Path::new("rooms/eros"), &v(json!({"desc": "hi"})))?;
            pm.set_query_active(&spec)?;
            pm.set_query_complete(&spec)
        })
        .unwrap();
    }

    let pm = open(dir.path(), Arc::new(TestClock::new(20)), Box::new(NoopCachePolicy));
    let node = pm.server_cache(&spec).unwrap();
    assert!(node.complete);
    assert!(!node.filtered);
    assert_eq!(node.value, v(json!({"desc": "hi"})));

    let tracked = pm.tracked_query_manager().find_tracked_query(&spec).unwrap();
    assert!(!tracked.active, "queries are reset to inactive on reopen");
    assert_eq!(tracked.last_use, 20);
}

#[test]
fn test_user_writes_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let mut pm = open(dir.path(), Arc::new(TestClock::new(1)), Box::new(NoopCachePolicy));
        pm.run_in_transaction(|pm| {
            pm.save_user_overwrite(&Path::new("a"), &Value::Int(1), 2)?;
            pm.save_user_merge(
                &Path::new("b"),
                &CompoundWrite::new().add_write(&Path::new("c"), Value::from("x")),
                1,
            )?;
            pm.save_user_overwrite(&Path::new("gone"), &Value::Int(3), 3)?;
            pm.remove_user_write(3)
        })
        .unwrap();
    }

    let mut pm = open(dir.path(), Arc::new(TestClock::new(1)), Box::new(NoopCachePolicy));
    let writes = pm.load_user_writes().unwrap();
    let ids: Vec<i64> = writes.iter().map(|w| w.write_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(!writes[0].is_overwrite());
    assert_eq!(writes[1].overwrite_value(), Some(&Value::Int(1)));

    pm.run_in_transaction(|pm| pm.remove_all_user_writes()).unwrap();
    assert!(pm.load_user_writes().unwrap().is_empty());
}

#[test]
fn test_query_ids_continue_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let mut pm = open(dir.path(), Arc::new(TestClock::new(1)), Box::new(NoopCachePolicy));
        pm.run_in_transaction(|pm| {
            pm.set_query_active(&QuerySpec::new("a"))?;
            pm.set_query_active(&QuerySpec::new("b"))
        })
        .unwrap();
    }

    let mut pm = open(dir.path(), Arc::new(TestClock::new(2)), Box::new(NoopCachePolicy));
    pm.run_in_transaction(|pm| pm.set_query_active(&QuerySpec::new("c")))
        .unwrap();
    let qm = pm.tracked_query_manager();
    let ids: BTreeSet<u64> = ["a", "b", "c"]
        .iter()
        .map(|path| qm.find_tracked_query(&QuerySpec::new(*path)).unwrap().query_id)
        .collect();
    assert_eq!(ids, BTreeSet::from([0, 1, 2]));
}

#[test]
fn test_uncommitted_transaction_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    {
        let mut pm = open(dir.path(), Arc::new(TestClock::new(1)), Box::new(NoopCachePolicy));
        let result = pm.run_in_transaction(|pm| -> tidepool_core::Result<()> {
            pm.storage()
                .overwrite_server_cache(&Path::new("a"), &Value::Int(1))?;
            Err(tidepool_core::Error::corruption("abort"))
        });
        assert!(result.is_err());
    }

    let pm = open(dir.path(), Arc::new(TestClock::new(1)), Box::new(NoopCachePolicy));
    assert_eq!(pm.storage().server_cache(&Path::new("a")).unwrap(), Value::Null);
}

#[test]
fn test_filtered_query_keys_survive_restart() {
    let dir = TempDir::new().unwrap();
    let spec = QuerySpec::with_params("list", QueryParams::default().limit_last(2));
    {
        let mut pm = open(dir.path(), Arc::new(TestClock::new(1)), Box::new(NoopCachePolicy));
        pm.run_in_transaction(|pm| {
            pm.set_query_active(&spec)?;
            pm.update_server_cache(&spec, &v(json!({"x": 1, "y": 2, "z": 3})))?;
            pm.set_tracked_query_keys(&spec, &BTreeSet::from(["y".to_string(), "z".to_string()]))
        })
        .unwrap();
    }

    let pm = open(dir.path(), Arc::new(TestClock::new(2)), Box::new(NoopCachePolicy));
    let node = pm.server_cache(&spec).unwrap();
    assert!(node.complete);
    assert!(node.filtered);
    assert_eq!(node.value, v(json!({"y": 2, "z": 3})));

    // The unfiltered parent only knows the filtered query's keys.
    let parent = pm.server_cache(&QuerySpec::new("list")).unwrap();
    assert!(!parent.complete);
    assert_eq!(parent.value, v(json!({"y": 2, "z": 3})));
}

#[test]
fn test_size_check_prunes_durable_cache() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(TestClock::new(0));
    let mut pm = open(dir.path(), clock.clone(), Box::new(LruCachePolicy::new(0)));

    pm.run_in_transaction(|pm| {
        for i in 0..10 {
            clock.set(i);
            let spec = QuerySpec::new(format!("old/{i}"));
            pm.set_query_active(&spec)?;
            pm.update_server_cache(&spec, &v(json!({"payload": i})))?;
            pm.set_query_inactive(&spec)?;
        }
        let live = QuerySpec::new("live");
        pm.set_query_active(&live)?;
        for n in 0..1000 {
            pm.update_server_cache(&live, &Value::Int(n))?;
        }
        Ok(())
    })
    .unwrap();

    let qm = pm.tracked_query_manager();
    assert_eq!(qm.count_of_prunable_queries(), 0);
    assert!(qm.has_active_default_query(&Path::new("live")));
    assert_eq!(pm.storage().server_cache(&Path::new("old")).unwrap(), Value::Null);
    assert_eq!(
        pm.storage().server_cache(&Path::new("live")).unwrap(),
        Value::Int(999)
    );
}

#[test]
fn test_open_with_config_file() {
    let dir = TempDir::new().unwrap();
    let config = PersistenceConfig::for_testing().with_backend("memory");
    config
        .write_to_file(&dir.path().join(tidepool_engine::persistence::CONFIG_FILE_NAME))
        .unwrap();

    let mut pm = PersistenceManager::open_dir(dir.path()).unwrap();
    pm.run_in_transaction(|pm| pm.apply_user_write_to_server_cache(&Path::new("a"), &Value::Int(1)))
        .unwrap();
    assert_eq!(pm.storage().server_cache(&Path::new("a")).unwrap(), Value::Int(1));
    // The memory backend leaves no log behind.
    assert!(!dir.path().join(tidepool_durability::LOG_FILE_NAME).exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prune_never_touches_active_queries(
        uses in prop::collection::vec((0u64..1000, any::<bool>()), 1..40)
    ) {
        let storage = Arc::new(InMemoryStorageEngine::new());
        let clock = Arc::new(TestClock::new(0));
        let mut manager = TrackedQueryManager::new(storage.clone(), clock.clone()).unwrap();
        storage.begin_transaction();

        let mut active = 0u64;
        for (i, (last_use, is_active)) in uses.iter().enumerate() {
            clock.set(*last_use);
            let spec = QuerySpec::new(format!("q{i}"));
            manager.set_query_active(&spec).unwrap();
            if *is_active {
                active += 1;
            } else {
                manager.set_query_inactive(&spec).unwrap();
            }
        }
        let prunable = uses.len() as u64 - active;
        let policy = LruCachePolicy::new(0);

        let forest = manager.prune_old_queries(&policy).unwrap();
        let expected_kept =
            (prunable as f64 * (1.0 - policy.percent_of_queries_to_prune_at_once())) as u64;
        prop_assert_eq!(manager.count_of_prunable_queries(), expected_kept);
        prop_assert_eq!(forest.prunes_anything(), expected_kept < prunable);

        for (i, (_, is_active)) in uses.iter().enumerate() {
            let spec = QuerySpec::new(format!("q{i}"));
            if *is_active {
                prop_assert!(manager.find_tracked_query(&spec).is_some());
                prop_assert!(forest.should_keep(&spec.path));
            }
        }
        storage.end_transaction().unwrap();
    }
}
