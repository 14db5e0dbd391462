//! Write-behind engine: bounded queue plus an adaptively-sized worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use silt_delta::{DeltaRecord, PersistState};
use tracing::{debug, error, info, warn};

use crate::backend::SessionBackend;
use crate::config::EngineConfig;
use crate::error::{Result, StoreError};
use crate::metrics::StoreMetrics;
use crate::queue::{Dequeue, PersistJob, PersistQueue};

struct EngineInner<B> {
    backend: Arc<B>,
    queue: PersistQueue,
    metrics: Arc<StoreMetrics>,
    running: AtomicBool,
    /// Worker count the adaptive sizing is steering toward.
    target: AtomicUsize,
    /// Worker threads alive.
    live: AtomicUsize,
    /// Worker threads currently persisting.
    active: AtomicUsize,
    core_pool: AtomicUsize,
    max_pool: AtomicUsize,
    worker_idle_ms: AtomicU64,
    lock_timeout_ms: AtomicU64,
    /// Occupancy thresholds as configured (percent of capacity).
    thresholds_pct: RwLock<Vec<u32>>,
    /// Thresholds resolved against the current capacity; last step unbounded.
    thresholds_abs: RwLock<Vec<usize>>,
    /// Serializes pool-size adjustments; producers that lose the race skip.
    adjuster: Mutex<()>,
    worker_seq: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B> EngineInner<B> {
    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.load(Ordering::Relaxed))
    }

    fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms.load(Ordering::Relaxed))
    }
}

/// Drains dirty records into the durable backend without blocking callers.
///
/// Submissions go through a bounded FIFO queue; a pool of worker threads
/// drains it. After every enqueue the pool is resized against a table of
/// queue-occupancy thresholds, growing one step per threshold crossed and
/// shrinking (with hysteresis) when occupancy falls back. A submission
/// against a full queue is rejected: the delta is dropped and the record's
/// state rolled back, on the expectation that the same key will be mutated
/// and re-submitted soon.
pub struct WriteBehindEngine<B> {
    inner: Arc<EngineInner<B>>,
}

impl<B> Clone for WriteBehindEngine<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: SessionBackend + 'static> WriteBehindEngine<B> {
    /// Create an engine. Workers are not spawned until [`start`](Self::start).
    pub fn new(
        backend: Arc<B>,
        metrics: Arc<StoreMetrics>,
        config: &EngineConfig,
    ) -> Result<Self> {
        if config.max_pool_size == 0 {
            return Err(StoreError::InvalidConfig(
                "max_pool_size must be at least 1".to_string(),
            ));
        }
        if config.queue_thresholds_pct.len() != config.max_pool_size {
            return Err(StoreError::InvalidConfig(format!(
                "queue_thresholds_pct length {} must equal max_pool_size {}",
                config.queue_thresholds_pct.len(),
                config.max_pool_size
            )));
        }

        let engine = Self {
            inner: Arc::new(EngineInner {
                backend,
                queue: PersistQueue::new(config.queue_capacity),
                metrics,
                running: AtomicBool::new(false),
                target: AtomicUsize::new(config.core_pool_size.min(config.max_pool_size)),
                live: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                core_pool: AtomicUsize::new(config.core_pool_size),
                max_pool: AtomicUsize::new(config.max_pool_size),
                worker_idle_ms: AtomicU64::new(config.worker_idle_timeout.as_millis() as u64),
                lock_timeout_ms: AtomicU64::new(config.lock_timeout.as_millis() as u64),
                thresholds_pct: RwLock::new(config.queue_thresholds_pct.clone()),
                thresholds_abs: RwLock::new(Vec::new()),
                adjuster: Mutex::new(()),
                worker_seq: AtomicU64::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        };
        engine.resolve_thresholds();
        Ok(engine)
    }

    /// Spawn the core worker pool and begin draining the queue.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.queue.reopen();
        let target = self
            .inner
            .core_pool
            .load(Ordering::SeqCst)
            .min(self.inner.max_pool.load(Ordering::SeqCst));
        self.inner.target.store(target, Ordering::SeqCst);
        while self.inner.live.load(Ordering::SeqCst) < target {
            self.spawn_worker();
        }
        info!(workers = target, "Write-behind engine started");
    }

    /// Stop the engine immediately.
    ///
    /// Queued-but-unstarted records are dropped (their state rolled back,
    /// best-effort); in-flight persists run to completion before their
    /// workers exit. No graceful drain of the queue is attempted.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let dropped = self.inner.queue.close();
        let abandoned = dropped.len();
        for job in dropped {
            rollback(&self.inner, &job.record);
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        info!(abandoned, "Write-behind engine stopped");
    }

    /// Whether the engine is accepting submissions.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Examine a record's queue state and hand it to the worker pool.
    ///
    /// Skips without waiting when the record is already queued or its lock
    /// is contended; in either case some other thread is on it, and a
    /// future write will retrigger. Falls back to a synchronous persist when
    /// the engine is not running.
    pub fn submit(&self, record: &Arc<DeltaRecord>) {
        if !self.is_running() {
            debug!(
                session_id = %record.id(),
                "No running engine, persisting record synchronously"
            );
            self.flush(record);
            return;
        }

        // cheap pre-check before taking the lock
        if record.persist_state() == PersistState::Queued {
            debug!(session_id = %record.id(), "Skipping enqueue of already-queued record");
            return;
        }

        match record.try_lock_for(self.inner.lock_timeout()) {
            Ok(mut guard) => {
                self.inner.metrics.record_lock_wait(record.last_lock_wait());
                if guard.state() == PersistState::Queued {
                    // another thread beat us to it
                    debug!(session_id = %record.id(), "Skipping enqueue of already-queued record");
                    return;
                }
                guard.set_state(PersistState::Queued);
            }
            Err(_) => {
                // a persist or mutation is in flight; the record will likely
                // be revisited on a future write
                self.inner.metrics.record_lock_skip();
                debug!(
                    session_id = %record.id(),
                    owner = ?record.lock_owner(),
                    "Could not lock record for enqueue, skipping"
                );
                return;
            }
        }

        match self.inner.queue.try_push(PersistJob::new(Arc::clone(record))) {
            Ok(depth) => {
                self.inner.metrics.record_queued(depth);
                debug!(session_id = %record.id(), queue_depth = depth, "Queued record for persistence");
                self.adjust_pool(depth);
            }
            Err(job) => {
                self.inner.metrics.record_rejection();
                error!(
                    session_id = %job.record.id(),
                    "Persistence queue full, dropping delta; record state rolled back"
                );
                rollback(&self.inner, &job.record);
            }
        }
    }

    /// Persist a record synchronously if it is dirty.
    ///
    /// Lock contention and backend failures are absorbed (logged and
    /// counted), matching the fire-and-forget contract of the async path.
    pub fn flush(&self, record: &Arc<DeltaRecord>) {
        run_persist(&self.inner, record, false);
    }

    /// Records currently queued.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    /// Worker threads alive.
    pub fn workers_live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Worker threads currently persisting.
    pub fn workers_active(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Worker count the adaptive sizing is steering toward.
    pub fn workers_target(&self) -> usize {
        self.inner.target.load(Ordering::SeqCst)
    }

    /// Bounded wait used when taking record locks.
    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout()
    }

    /// Set the core pool size. When running, immediately steers the pool to
    /// at least this many workers.
    pub fn set_core_pool_size(&self, size: usize) {
        let _adjust = self.inner.adjuster.lock();
        self.inner.core_pool.store(size, Ordering::SeqCst);
        if self.inner.running.load(Ordering::SeqCst) {
            let target = size.min(self.inner.max_pool.load(Ordering::SeqCst)).max(1);
            self.inner.target.store(target, Ordering::SeqCst);
            while self.inner.live.load(Ordering::SeqCst) < target {
                self.spawn_worker();
            }
        }
    }

    /// Set the maximum pool size and re-resolve the occupancy thresholds.
    pub fn set_max_pool_size(&self, size: usize) {
        let _adjust = self.inner.adjuster.lock();
        let size = size.max(1);
        self.inner.max_pool.store(size, Ordering::SeqCst);
        if self.inner.target.load(Ordering::SeqCst) > size {
            self.inner.target.store(size, Ordering::SeqCst);
        }
        drop(_adjust);
        self.resolve_thresholds();
    }

    /// Set the idle time after which a worker above the target exits.
    pub fn set_worker_idle_timeout(&self, timeout: Duration) {
        self.inner
            .worker_idle_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set the bounded wait used when taking record locks.
    pub fn set_lock_timeout(&self, timeout: Duration) {
        self.inner
            .lock_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set the queue bound. Applies to subsequent submissions.
    pub fn set_queue_capacity(&self, capacity: usize) {
        self.inner.queue.set_capacity(capacity);
        self.resolve_thresholds();
    }

    /// Replace the occupancy thresholds (percentages of queue capacity).
    ///
    /// Length must equal the maximum pool size.
    pub fn set_queue_thresholds_pct(&self, thresholds: Vec<u32>) -> Result<()> {
        let max_pool = self.inner.max_pool.load(Ordering::SeqCst);
        if thresholds.len() != max_pool {
            return Err(StoreError::InvalidConfig(format!(
                "queue_thresholds_pct length {} must equal max_pool_size {max_pool}",
                thresholds.len()
            )));
        }
        *self.inner.thresholds_pct.write() = thresholds;
        self.resolve_thresholds();
        Ok(())
    }

    /// Resolve the percentage thresholds against the current capacity.
    /// The last step is forced unbounded so the table always has an answer.
    fn resolve_thresholds(&self) {
        let capacity = self.inner.queue.capacity();
        let pct = self.inner.thresholds_pct.read();
        let mut resolved: Vec<usize> = pct
            .iter()
            .map(|p| capacity.saturating_mul(*p as usize) / 100)
            .collect();
        if let Some(last) = resolved.last_mut() {
            *last = usize::MAX;
        }
        *self.inner.thresholds_abs.write() = resolved;
    }

    /// Smallest pool step whose occupancy threshold covers `queue_depth`.
    fn target_for_depth(&self, queue_depth: usize) -> usize {
        let thresholds = self.inner.thresholds_abs.read();
        let mut target = 0;
        for threshold in thresholds.iter() {
            target += 1;
            if queue_depth <= *threshold {
                break;
            }
        }
        target.min(self.inner.max_pool.load(Ordering::SeqCst))
    }

    /// Steer the worker pool toward the occupancy-derived target.
    ///
    /// Invoked after every enqueue. Only one producer adjusts at a time; a
    /// producer that cannot take the adjuster lock skips: another has
    /// already done the work or will shortly. Scaling down applies
    /// hysteresis: the pool only shrinks when the computed target is at
    /// least two steps below the current one, and never below one worker.
    fn adjust_pool(&self, queue_depth: usize) {
        let computed = self.target_for_depth(queue_depth);
        if computed == self.inner.target.load(Ordering::SeqCst) {
            return;
        }

        let Some(_adjust) = self.inner.adjuster.try_lock() else {
            return;
        };

        let current = self.inner.target.load(Ordering::SeqCst);
        let mut target = computed;
        if target < current {
            if target < 2 {
                // never shrink below one worker
                target = 1;
            } else {
                // require a two-step drop before shrinking
                target += 1;
            }
        }
        if target == current {
            return;
        }

        self.inner.target.store(target, Ordering::SeqCst);
        debug!(
            from = current,
            to = target,
            queue_depth,
            "Adjusted persistence worker target"
        );
        if self.inner.running.load(Ordering::SeqCst) {
            while self.inner.live.load(Ordering::SeqCst) < target {
                self.spawn_worker();
            }
        }
    }

    fn spawn_worker(&self) {
        let id = self.inner.worker_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let inner = Arc::clone(&self.inner);
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("silt-persist-{id}"))
            .spawn(move || worker_main(inner));
        match spawned {
            Ok(handle) => {
                let mut handles = self.inner.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(e) => {
                self.inner.live.fetch_sub(1, Ordering::SeqCst);
                error!(error = %e, "Could not spawn persistence worker");
            }
        }
    }
}

fn worker_main<B: SessionBackend>(inner: Arc<EngineInner<B>>) {
    debug!("Persistence worker started");
    loop {
        match inner.queue.pop(inner.worker_idle_timeout()) {
            Dequeue::Job(job) => {
                inner.metrics.record_queue_wait(job.queued_at.elapsed());
                inner.active.fetch_add(1, Ordering::Relaxed);
                run_persist(&inner, &job.record, true);
                inner.active.fetch_sub(1, Ordering::Relaxed);
            }
            Dequeue::Idle => {
                if try_retire(&inner) {
                    debug!("Idle persistence worker exiting");
                    return;
                }
            }
            Dequeue::Closed => {
                inner.live.fetch_sub(1, Ordering::SeqCst);
                debug!("Persistence worker shut down");
                return;
            }
        }
    }
}

/// Decrement `live` only while it exceeds the target, so concurrent idle
/// workers cannot overshoot the shrink.
fn try_retire<B>(inner: &EngineInner<B>) -> bool {
    let target = inner.target.load(Ordering::SeqCst);
    let mut live = inner.live.load(Ordering::SeqCst);
    while live > target {
        match inner
            .live
            .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => return true,
            Err(actual) => live = actual,
        }
    }
    false
}

/// Lock a record and, if dirty, drive it through one full persist cycle.
///
/// The worker path re-queues on lock contention so a consumed job cannot
/// strand a record in the queued state; the synchronous path just skips.
/// The delta is cleared even when the backend fails: state advances, the
/// failure is logged, and durability of that delta is lost until the key
/// mutates again.
fn run_persist<B: SessionBackend>(
    inner: &EngineInner<B>,
    record: &Arc<DeltaRecord>,
    requeue_on_contention: bool,
) {
    let mut guard = match record.try_lock_for(inner.lock_timeout()) {
        Ok(guard) => guard,
        Err(_) => {
            inner.metrics.record_lock_skip();
            if requeue_on_contention {
                debug!(
                    session_id = %record.id(),
                    owner = ?record.lock_owner(),
                    "Record busy, re-queuing for a later persist"
                );
                if inner
                    .queue
                    .try_push(PersistJob::new(Arc::clone(record)))
                    .is_err()
                {
                    rollback(inner, record);
                }
            } else {
                debug!(
                    session_id = %record.id(),
                    owner = ?record.lock_owner(),
                    "Record busy, skipping synchronous flush"
                );
            }
            return;
        }
    };

    if !guard.is_dirty() {
        if guard.state() == PersistState::Queued {
            guard.set_state(PersistState::None);
        }
        debug!(session_id = %record.id(), "Record is clean, nothing to persist");
        return;
    }

    // the synchronous path enters the cycle here; the worker path arrives
    // already queued
    if guard.state() == PersistState::None {
        guard.set_state(PersistState::Queued);
    }
    guard.set_state(PersistState::Storing);

    let started = Instant::now();
    let result = inner.backend.persist(guard.delta());
    let elapsed = started.elapsed();

    guard.set_state(PersistState::Stored);
    guard.clear_after_persist();
    guard.set_state(PersistState::None);
    drop(guard);

    match result {
        Ok(()) => {
            inner.metrics.record_persist(elapsed, true);
            debug!(
                session_id = %record.id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Persisted record"
            );
        }
        Err(e) => {
            inner.metrics.record_persist(elapsed, false);
            warn!(
                session_id = %record.id(),
                error = %e,
                "Persist failed; delta dropped until the record mutates again"
            );
        }
    }
}

/// Best-effort rollback of a record stuck in the queued state.
///
/// Deliberately forces the state without transition validation: a concurrent
/// re-queue can race this, and the original behavior tolerates it.
fn rollback<B>(inner: &EngineInner<B>, record: &Arc<DeltaRecord>) {
    match record.try_lock_for(inner.lock_timeout()) {
        Ok(mut guard) => guard.force_unqueued(),
        Err(_) => {
            // another thread owns the record; let it sort the state out
            debug!(
                session_id = %record.id(),
                "Could not lock record for state rollback"
            );
        }
    }
}
