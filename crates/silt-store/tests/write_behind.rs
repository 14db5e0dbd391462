//! End-to-end behavior of the session store over the SQLite backend.

mod common;

use std::time::Duration;

use silt_store::delta::{InMemorySession, RequestMeta};
use silt_store::{
    CacheConfig, EngineConfig, NullBackend, SessionStore, SqliteBackend, StoreConfig,
};

use common::{SETTINGS, wait_until};

fn store_config() -> StoreConfig {
    StoreConfig::new()
        .with_node_id("node-1")
        .with_app("/app")
        .with_engine(
            EngineConfig::new()
                .with_core_pool_size(1)
                .with_max_pool_size(2)
                .with_queue_thresholds_pct(vec![50, 100])
                .with_queue_capacity(100),
        )
        .with_cache(
            CacheConfig::new()
                .with_idle_timeout(Duration::from_secs(900))
                .with_sweep_interval(Duration::from_secs(300)),
        )
}

fn sqlite_store() -> (tempfile::TempDir, SessionStore<SqliteBackend>) {
    let dir = tempfile::tempdir().unwrap();
    let backend = SqliteBackend::open(dir.path().join("sessions.db")).unwrap();
    let store = SessionStore::new(backend, store_config()).unwrap();
    (dir, store)
}

#[test]
fn test_write_behind_end_to_end() {
    let (_dir, store) = sqlite_store();
    store.start();

    let mut session = InMemorySession::new("s-1");
    session.insert("a", "1").unwrap();
    session.insert("b", "2").unwrap();
    store.examine(&session, None).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        store.metrics().persists_completed == 1
    }));

    let stored = store.load("s-1").unwrap().unwrap();
    assert_eq!(stored.fields.len(), 2);
    assert_eq!(stored.fields["a"].update_count, 1);
    assert_eq!(stored.fields["b"].update_count, 1);
    assert_eq!(stored.header.unwrap().node_id, "node-1");

    // next request: b changes, c appears, a stays put
    session.touch();
    session.insert("b", "3").unwrap();
    session.insert("c", "4").unwrap();
    let meta = RequestMeta::new().with_user_agent("test-agent");
    store.examine(&session, Some(&meta)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        store.metrics().persists_completed == 2
    }));

    let stored = store.load("s-1").unwrap().unwrap();
    // a was not re-persisted: its update count is untouched
    assert_eq!(stored.fields["a"].update_count, 1);
    assert_eq!(stored.fields["b"].update_count, 2);
    assert_eq!(stored.fields["b"].data.as_deref(), Some(br#""3""#.as_slice()));
    assert_eq!(stored.fields["c"].update_count, 1);
    assert_eq!(
        stored.header.unwrap().user_agent.as_deref(),
        Some("test-agent")
    );

    store.stop();
}

#[test]
fn test_examine_persists_synchronously_without_start() {
    let (_dir, store) = sqlite_store();

    let mut session = InMemorySession::new("s-1");
    session.insert("a", "1").unwrap();
    store.examine(&session, None).unwrap();

    // no engine running: the fallback already persisted
    let stored = store.load("s-1").unwrap().unwrap();
    assert!(stored.fields.contains_key("a"));
    assert_eq!(store.metrics().persists_completed, 1);
}

#[test]
fn test_unchanged_session_is_not_repersisted() {
    let (_dir, store) = sqlite_store();

    let mut session = InMemorySession::new("s-1");
    session.insert("a", "1").unwrap();
    store.examine(&session, None).unwrap();
    assert_eq!(store.metrics().persists_completed, 1);

    // same fields, same activity timestamps: clean capture, no persist
    store.examine(&session, None).unwrap();
    assert_eq!(store.metrics().persists_completed, 1);
    assert_eq!(store.metrics().mutations_examined, 1);
}

#[test]
fn test_remove_clears_backend_and_cache() {
    let (_dir, store) = sqlite_store();

    let mut session = InMemorySession::new("s-1");
    session.insert("a", "1").unwrap();
    store.examine(&session, None).unwrap();
    assert!(store.cache().contains("s-1"));

    store.remove("s-1").unwrap();
    assert!(store.load("s-1").unwrap().is_none());
    assert!(!store.cache().contains("s-1"));
}

#[test]
fn test_expired_keys_surface_through_store() {
    let (_dir, store) = sqlite_store();

    let mut stale = InMemorySession::new("s-stale").with_max_idle_secs(-60);
    stale.insert("a", "1").unwrap();
    store.examine(&stale, None).unwrap();

    let mut fresh = InMemorySession::new("s-fresh");
    fresh.insert("a", "1").unwrap();
    store.examine(&fresh, None).unwrap();

    let expired = store.expired_keys().unwrap();
    assert!(expired.contains("s-stale"));
    assert!(!expired.contains("s-fresh"));
}

#[test]
fn test_flush_forces_persist() {
    let (_dir, store) = sqlite_store();

    let record = store.record("s-1").unwrap();
    let mut session = InMemorySession::new("s-1");
    session.insert("a", "1").unwrap();
    record.lock().capture(&session, None, &SETTINGS);

    store.flush("s-1").unwrap();
    assert!(store.load("s-1").unwrap().is_some());
    assert!(!record.lock().is_dirty());
}

#[test]
fn test_sweeper_evicts_idle_records() {
    let config = StoreConfig::new().with_cache(
        CacheConfig::new()
            .with_idle_timeout(Duration::ZERO)
            .with_sweep_interval(Duration::from_millis(10)),
    );
    let store = SessionStore::new(NullBackend, config).unwrap();
    store.start();

    let mut session = InMemorySession::new("s-1");
    session.insert("a", "1").unwrap();
    store.examine(&session, None).unwrap();

    assert!(wait_until(Duration::from_secs(2), || store.cache().is_empty()));
    store.stop();
}

#[test]
fn test_hydrated_record_seeds_change_detection() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sessions.db");

    let mut session = InMemorySession::new("s-1");
    session.insert("a", "1").unwrap();

    {
        let backend = SqliteBackend::open(&db).unwrap();
        let store = SessionStore::new(backend, store_config()).unwrap();
        store.examine(&session, None).unwrap();
    }

    // a fresh store hydrates the baseline from disk: an identical session
    // examines clean and is not persisted again
    let backend = SqliteBackend::open(&db).unwrap();
    let store = SessionStore::new(backend, store_config()).unwrap();
    store.examine(&session, None).unwrap();
    assert_eq!(store.metrics().persists_completed, 0);
    assert!(store.cache().contains("s-1"));
}

#[test]
fn test_runtime_reconfiguration() {
    let store = SessionStore::new(NullBackend, StoreConfig::default()).unwrap();

    store.set_queue_capacity(10);
    store.set_worker_idle_timeout(Duration::from_secs(1));
    store.set_sweep_interval(Duration::from_secs(1));
    assert!(store.set_queue_thresholds_pct(vec![10; 10]).is_ok());
    assert!(store.set_queue_thresholds_pct(vec![10, 20]).is_err());

    // idle timeout applies to the very next sweep
    let _record = store.record("s-1").unwrap();
    std::thread::sleep(Duration::from_millis(5));
    store.set_idle_timeout(Duration::ZERO);
    assert_eq!(store.cache().sweep_once(), 1);
    assert!(store.cache().is_empty());
}

#[test]
fn test_metrics_snapshot_gauges() {
    let (_dir, store) = sqlite_store();

    let mut session = InMemorySession::new("s-1");
    session.insert("a", "1").unwrap();
    store.examine(&session, None).unwrap();

    let snapshot = store.metrics();
    assert_eq!(snapshot.cache_size, 1);
    assert_eq!(snapshot.mutations_examined, 1);
    assert_eq!(snapshot.persists_completed, 1);
    assert_eq!(snapshot.queue_depth, 0);
}
