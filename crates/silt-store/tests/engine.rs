//! Concurrency behavior of the write-behind engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use silt_store::delta::PersistState;
use silt_store::{EngineConfig, MetricsGauges, StoreMetrics, WriteBehindEngine};

use common::{FailBackend, GateBackend, dirty_record, wait_until};

fn single_worker_config(queue_capacity: usize) -> EngineConfig {
    EngineConfig::new()
        .with_core_pool_size(1)
        .with_max_pool_size(1)
        .with_queue_thresholds_pct(vec![100])
        .with_queue_capacity(queue_capacity)
        .with_lock_timeout(Duration::from_millis(100))
}

#[test]
fn test_concurrent_submits_enqueue_once() {
    let backend = Arc::new(GateBackend::closed());
    let metrics = Arc::new(StoreMetrics::new());
    let engine =
        WriteBehindEngine::new(Arc::clone(&backend), Arc::clone(&metrics), &single_worker_config(10))
            .unwrap();
    engine.start();

    // the single worker takes the first record and blocks inside persist
    let busy = dirty_record("s-busy");
    engine.submit(&busy);
    assert!(wait_until(Duration::from_secs(2), || {
        busy.persist_state() == PersistState::Storing
    }));

    // the second record sits in the queue in the queued state
    let waiting = dirty_record("s-waiting");
    engine.submit(&waiting);
    assert_eq!(metrics.records_queued(), 2);
    assert_eq!(waiting.persist_state(), PersistState::Queued);

    // a storm of duplicate submissions must not enqueue it again
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let record = Arc::clone(&waiting);
            std::thread::spawn(move || engine.submit(&record))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(metrics.records_queued(), 2);

    backend.release();
    assert!(wait_until(Duration::from_secs(2), || {
        metrics.persists_completed() == 2
    }));
    let persisted = backend.persisted();
    assert!(persisted.contains(&"s-busy".to_string()));
    assert!(persisted.contains(&"s-waiting".to_string()));

    engine.shutdown();
}

#[test]
fn test_rejected_record_rolls_back_to_none() {
    let backend = Arc::new(GateBackend::closed());
    let metrics = Arc::new(StoreMetrics::new());
    let engine =
        WriteBehindEngine::new(Arc::clone(&backend), Arc::clone(&metrics), &single_worker_config(1))
            .unwrap();
    engine.start();

    let busy = dirty_record("s-busy");
    engine.submit(&busy);
    assert!(wait_until(Duration::from_secs(2), || {
        busy.persist_state() == PersistState::Storing
    }));

    // fills the single queue slot
    let queued = dirty_record("s-queued");
    engine.submit(&queued);
    assert_eq!(queued.persist_state(), PersistState::Queued);

    // rejected: dropped and rolled back, never an error and never stuck
    let rejected = dirty_record("s-rejected");
    engine.submit(&rejected);
    assert_eq!(rejected.persist_state(), PersistState::None);
    assert_eq!(metrics.queue_rejections(), 1);
    assert_eq!(metrics.records_queued(), 2);

    backend.release();
    assert!(wait_until(Duration::from_secs(2), || {
        metrics.persists_completed() == 2
    }));
    assert!(!backend.persisted().contains(&"s-rejected".to_string()));

    engine.shutdown();
}

#[test]
fn test_submit_without_running_engine_persists_synchronously() {
    let backend = Arc::new(GateBackend::opened());
    let metrics = Arc::new(StoreMetrics::new());
    let engine =
        WriteBehindEngine::new(Arc::clone(&backend), Arc::clone(&metrics), &single_worker_config(10))
            .unwrap();

    let record = dirty_record("s-1");
    engine.submit(&record);

    assert_eq!(backend.persisted(), vec!["s-1".to_string()]);
    assert_eq!(record.persist_state(), PersistState::None);
    assert!(!record.lock().is_dirty());
    assert_eq!(metrics.persists_completed(), 1);
}

#[test]
fn test_persist_failure_is_absorbed() {
    let metrics = Arc::new(StoreMetrics::new());
    let engine = WriteBehindEngine::new(
        Arc::new(FailBackend),
        Arc::clone(&metrics),
        &single_worker_config(10),
    )
    .unwrap();

    let record = dirty_record("s-1");
    engine.flush(&record);

    // the record is not stuck: state advanced, delta dropped
    assert_eq!(record.persist_state(), PersistState::None);
    assert!(!record.lock().is_dirty());
    let snapshot = metrics.snapshot(MetricsGauges::default());
    assert_eq!(snapshot.persist_failures, 1);
    assert_eq!(snapshot.persists_completed, 0);
}

#[test]
fn test_shutdown_drops_queued_work_and_rolls_back() {
    let backend = Arc::new(GateBackend::closed());
    let metrics = Arc::new(StoreMetrics::new());
    let engine =
        WriteBehindEngine::new(Arc::clone(&backend), Arc::clone(&metrics), &single_worker_config(10))
            .unwrap();
    engine.start();

    let busy = dirty_record("s-busy");
    engine.submit(&busy);
    assert!(wait_until(Duration::from_secs(2), || {
        busy.persist_state() == PersistState::Storing
    }));

    let queued = dirty_record("s-queued");
    engine.submit(&queued);
    assert_eq!(queued.persist_state(), PersistState::Queued);

    // shutdown blocks on the in-flight persist, so run it on the side
    let shutting_down = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.shutdown())
    };

    // the queued-but-unstarted record is abandoned and rolled back
    assert!(wait_until(Duration::from_secs(2), || {
        queued.persist_state() == PersistState::None
    }));

    backend.release();
    shutting_down.join().unwrap();

    // the in-flight persist ran to completion; the abandoned one never did
    let persisted = backend.persisted();
    assert!(persisted.contains(&"s-busy".to_string()));
    assert!(!persisted.contains(&"s-queued".to_string()));
    assert!(!engine.is_running());
}

#[test]
fn test_lock_contention_skips_enqueue() {
    let backend = Arc::new(GateBackend::opened());
    let metrics = Arc::new(StoreMetrics::new());
    let engine = WriteBehindEngine::new(
        Arc::clone(&backend),
        Arc::clone(&metrics),
        &single_worker_config(10).with_lock_timeout(Duration::from_millis(10)),
    )
    .unwrap();
    engine.start();

    let record = dirty_record("s-1");
    let guard = record.lock();
    engine.submit(&record);
    // the caller could not get the lock within the timeout and skipped
    assert_eq!(metrics.records_queued(), 0);
    assert_eq!(record.persist_state(), PersistState::None);
    drop(guard);

    engine.submit(&record);
    assert!(wait_until(Duration::from_secs(2), || {
        metrics.persists_completed() == 1
    }));

    engine.shutdown();
}
