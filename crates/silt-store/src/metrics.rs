//! Counters and timings for the write-behind pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Shared counters updated by the facade, the engine and its workers.
///
/// Everything is atomic; recording never takes a lock. Gauges that live
/// elsewhere (queue depth, cache size, worker counts) are folded in when a
/// [`MetricsSnapshot`] is taken.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    mutations_examined: AtomicU64,
    records_queued: AtomicU64,
    queue_rejections: AtomicU64,
    lock_skips: AtomicU64,
    persists_completed: AtomicU64,
    persist_failures: AtomicU64,
    persist_ms_last: AtomicU64,
    persist_ms_max: AtomicU64,
    persist_ms_total: AtomicU64,
    queue_wait_ms_last: AtomicU64,
    queue_wait_ms_max: AtomicU64,
    queue_wait_ms_total: AtomicU64,
    lock_wait_ms_max: AtomicU64,
    queue_depth_peak: AtomicU64,
}

impl StoreMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// A record was examined for changes.
    pub fn record_mutation(&self) {
        self.mutations_examined.fetch_add(1, Ordering::Relaxed);
    }

    /// A record was enqueued; `queue_depth` is the depth after the enqueue.
    pub fn record_queued(&self, queue_depth: usize) {
        self.records_queued.fetch_add(1, Ordering::Relaxed);
        self.queue_depth_peak
            .fetch_max(queue_depth as u64, Ordering::Relaxed);
    }

    /// An enqueue was rejected by a full queue.
    pub fn record_rejection(&self) {
        self.queue_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// An operation was skipped because a record lock was contended.
    pub fn record_lock_skip(&self) {
        self.lock_skips.fetch_add(1, Ordering::Relaxed);
    }

    /// A persist finished.
    pub fn record_persist(&self, elapsed: Duration, ok: bool) {
        if ok {
            self.persists_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
        }
        let ms = elapsed.as_millis() as u64;
        self.persist_ms_last.store(ms, Ordering::Relaxed);
        self.persist_ms_max.fetch_max(ms, Ordering::Relaxed);
        self.persist_ms_total.fetch_add(ms, Ordering::Relaxed);
    }

    /// A dequeued record had waited `elapsed` in the queue.
    pub fn record_queue_wait(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.queue_wait_ms_last.store(ms, Ordering::Relaxed);
        self.queue_wait_ms_max.fetch_max(ms, Ordering::Relaxed);
        self.queue_wait_ms_total.fetch_add(ms, Ordering::Relaxed);
    }

    /// A record lock was acquired after waiting `elapsed`.
    pub fn record_lock_wait(&self, elapsed: Duration) {
        self.lock_wait_ms_max
            .fetch_max(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.mutations_examined.store(0, Ordering::Relaxed);
        self.records_queued.store(0, Ordering::Relaxed);
        self.queue_rejections.store(0, Ordering::Relaxed);
        self.lock_skips.store(0, Ordering::Relaxed);
        self.persists_completed.store(0, Ordering::Relaxed);
        self.persist_failures.store(0, Ordering::Relaxed);
        self.persist_ms_last.store(0, Ordering::Relaxed);
        self.persist_ms_max.store(0, Ordering::Relaxed);
        self.persist_ms_total.store(0, Ordering::Relaxed);
        self.queue_wait_ms_last.store(0, Ordering::Relaxed);
        self.queue_wait_ms_max.store(0, Ordering::Relaxed);
        self.queue_wait_ms_total.store(0, Ordering::Relaxed);
        self.lock_wait_ms_max.store(0, Ordering::Relaxed);
        self.queue_depth_peak.store(0, Ordering::Relaxed);
    }

    /// Number of records enqueued so far.
    pub fn records_queued(&self) -> u64 {
        self.records_queued.load(Ordering::Relaxed)
    }

    /// Number of persists completed so far.
    pub fn persists_completed(&self) -> u64 {
        self.persists_completed.load(Ordering::Relaxed)
    }

    /// Number of enqueues rejected so far.
    pub fn queue_rejections(&self) -> u64 {
        self.queue_rejections.load(Ordering::Relaxed)
    }

    /// Take a snapshot, folding in gauges owned elsewhere.
    pub fn snapshot(&self, gauges: MetricsGauges) -> MetricsSnapshot {
        let persists = self.persists_completed.load(Ordering::Relaxed);
        let queued = self.records_queued.load(Ordering::Relaxed);
        let persist_total = self.persist_ms_total.load(Ordering::Relaxed);
        let queue_wait_total = self.queue_wait_ms_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            mutations_examined: self.mutations_examined.load(Ordering::Relaxed),
            records_queued: queued,
            queue_rejections: self.queue_rejections.load(Ordering::Relaxed),
            lock_skips: self.lock_skips.load(Ordering::Relaxed),
            persists_completed: persists,
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            persist_ms_last: self.persist_ms_last.load(Ordering::Relaxed),
            persist_ms_max: self.persist_ms_max.load(Ordering::Relaxed),
            persist_ms_total: persist_total,
            persist_ms_avg: avg(persist_total, persists),
            queue_wait_ms_last: self.queue_wait_ms_last.load(Ordering::Relaxed),
            queue_wait_ms_max: self.queue_wait_ms_max.load(Ordering::Relaxed),
            queue_wait_ms_total: queue_wait_total,
            queue_wait_ms_avg: avg(queue_wait_total, queued),
            lock_wait_ms_max: self.lock_wait_ms_max.load(Ordering::Relaxed),
            queue_depth: gauges.queue_depth,
            queue_depth_peak: self.queue_depth_peak.load(Ordering::Relaxed),
            cache_size: gauges.cache_size,
            workers_live: gauges.workers_live,
            workers_active: gauges.workers_active,
            workers_target: gauges.workers_target,
        }
    }
}

fn avg(total: u64, count: u64) -> u64 {
    if count == 0 { 0 } else { total / count }
}

/// Point-in-time gauges owned by the engine and cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsGauges {
    /// Records currently queued.
    pub queue_depth: usize,
    /// Records currently cached.
    pub cache_size: usize,
    /// Worker threads alive.
    pub workers_live: usize,
    /// Worker threads currently persisting.
    pub workers_active: usize,
    /// Worker count the adaptive sizing is steering toward.
    pub workers_target: usize,
}

/// Serializable point-in-time view of the pipeline's counters and gauges.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub mutations_examined: u64,
    pub records_queued: u64,
    pub queue_rejections: u64,
    pub lock_skips: u64,
    pub persists_completed: u64,
    pub persist_failures: u64,
    pub persist_ms_last: u64,
    pub persist_ms_max: u64,
    pub persist_ms_total: u64,
    pub persist_ms_avg: u64,
    pub queue_wait_ms_last: u64,
    pub queue_wait_ms_max: u64,
    pub queue_wait_ms_total: u64,
    pub queue_wait_ms_avg: u64,
    pub lock_wait_ms_max: u64,
    pub queue_depth: usize,
    pub queue_depth_peak: u64,
    pub cache_size: usize,
    pub workers_live: usize,
    pub workers_active: usize,
    pub workers_target: usize,
}
