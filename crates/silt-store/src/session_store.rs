//! The host-facing store: examine-and-maybe-queue, force flush, lookup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use silt_delta::{CaptureSettings, DeltaRecord, RequestMeta, SessionState};
use tracing::debug;

use crate::backend::{SessionBackend, StoredRecord};
use crate::cache::RecordCache;
use crate::config::StoreConfig;
use crate::engine::WriteBehindEngine;
use crate::error::Result;
use crate::metrics::{MetricsGauges, MetricsSnapshot, StoreMetrics};

/// Write-behind session store.
///
/// Ties together the record cache, the write-behind engine and a durable
/// backend. Callers feed live sessions through [`examine`](Self::examine);
/// the store computes the field-level delta against the last durable
/// baseline and, when dirty, hands the record to the engine for
/// asynchronous persistence. Nothing on this surface blocks on the backend
/// except [`flush`](Self::flush) and the lookup methods.
pub struct SessionStore<B: SessionBackend + 'static> {
    backend: Arc<B>,
    cache: Arc<RecordCache>,
    engine: WriteBehindEngine<B>,
    metrics: Arc<StoreMetrics>,
    node_id: String,
    app: String,
    header_time_skew: Duration,
}

impl<B: SessionBackend + 'static> SessionStore<B> {
    /// Create a store. Workers and the sweeper start with
    /// [`start`](Self::start).
    pub fn new(backend: B, config: StoreConfig) -> Result<Self> {
        let backend = Arc::new(backend);
        let metrics = Arc::new(StoreMetrics::new());
        let engine = WriteBehindEngine::new(Arc::clone(&backend), Arc::clone(&metrics), &config.engine)?;
        Ok(Self {
            backend,
            cache: Arc::new(RecordCache::new(&config.cache)),
            engine,
            metrics,
            node_id: config.node_id,
            app: config.app,
            header_time_skew: config.header_time_skew,
        })
    }

    /// Spawn the engine's worker pool and the cache sweeper.
    pub fn start(&self) {
        self.engine.start();
        self.cache.start_sweeper();
        self.metrics.reset();
    }

    /// Stop the engine and the sweeper.
    ///
    /// Queued-but-unstarted work is dropped; no graceful drain is attempted.
    pub fn stop(&self) {
        self.engine.shutdown();
        self.cache.stop_sweeper();
    }

    /// Examine a live session for changes and queue it for persistence if
    /// anything changed.
    ///
    /// Lock contention means another thread is already processing this
    /// record's changes and is handled by skipping, not waiting. Sessions
    /// with no fields, and invalidated sessions, are ignored.
    pub fn examine(
        &self,
        source: &dyn SessionState,
        request: Option<&RequestMeta>,
    ) -> Result<()> {
        if !source.is_valid() {
            // an invalid session has already removed itself
            return Ok(());
        }
        if source.field_keys().is_empty() {
            return Ok(());
        }

        let record = self.cache.get_or_load(source.id(), &*self.backend)?;
        let dirty = match record.try_lock_for(self.engine.lock_timeout()) {
            Ok(mut guard) => {
                self.metrics.record_lock_wait(record.last_lock_wait());
                guard.capture(
                    source,
                    request,
                    &CaptureSettings {
                        node_id: &self.node_id,
                        app: &self.app,
                        time_skew: self.header_time_skew,
                    },
                );
                record.touch();
                // the cached baseline keeps only checksums and lengths
                guard.wipe_field_payloads();

                let dirty = guard.is_dirty();
                if dirty {
                    self.metrics.record_mutation();
                    debug!(
                        session_id = %guard.id(),
                        modified = guard.modified().len(),
                        removed = guard.removed().len(),
                        payload_size = guard.payload_size(),
                        "Captured session delta"
                    );
                } else {
                    debug!(session_id = %guard.id(), "Session unchanged since last capture");
                }
                dirty
            }
            Err(_) => {
                self.metrics.record_lock_skip();
                debug!(
                    session_id = %source.id(),
                    owner = ?record.lock_owner(),
                    "Another thread is processing this record, skipping examination"
                );
                false
            }
        };

        if dirty {
            self.engine.submit(&record);
        }
        Ok(())
    }

    /// Persist a record synchronously if it is dirty.
    pub fn flush(&self, id: &str) -> Result<()> {
        let record = self.cache.get_or_load(id, &*self.backend)?;
        self.engine.flush(&record);
        Ok(())
    }

    /// Load a record's durable form from the backend.
    pub fn load(&self, id: &str) -> Result<Option<StoredRecord>> {
        self.backend.load(id)
    }

    /// Remove a record from the backend and the cache.
    pub fn remove(&self, id: &str) -> Result<()> {
        self.backend.remove(id)?;
        self.cache.remove(id);
        debug!(session_id = %id, "Removed session from backend and cache");
        Ok(())
    }

    /// Keys of records whose expiry has passed, per the backend.
    pub fn expired_keys(&self) -> Result<HashSet<String>> {
        self.backend.expired_keys()
    }

    /// Whether the durable backend is reachable.
    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// The record cache.
    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    /// Fetch a cached record, loading from the backend on a miss.
    pub fn record(&self, id: &str) -> Result<Arc<DeltaRecord>> {
        self.cache.get_or_load(id, &*self.backend)
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(MetricsGauges {
            queue_depth: self.engine.queue_depth(),
            cache_size: self.cache.len(),
            workers_live: self.engine.workers_live(),
            workers_active: self.engine.workers_active(),
            workers_target: self.engine.workers_target(),
        })
    }

    /// Zero the metric counters.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    // Hot-reconfigurable settings. Everything below takes effect without a
    // restart.

    /// Set the engine's core pool size.
    pub fn set_core_pool_size(&self, size: usize) {
        self.engine.set_core_pool_size(size);
    }

    /// Set the engine's maximum pool size.
    pub fn set_max_pool_size(&self, size: usize) {
        self.engine.set_max_pool_size(size);
    }

    /// Set the worker idle timeout.
    pub fn set_worker_idle_timeout(&self, timeout: Duration) {
        self.engine.set_worker_idle_timeout(timeout);
    }

    /// Set the persistence queue bound.
    pub fn set_queue_capacity(&self, capacity: usize) {
        self.engine.set_queue_capacity(capacity);
    }

    /// Set the pool-sizing occupancy thresholds (percent of capacity).
    pub fn set_queue_thresholds_pct(&self, thresholds: Vec<u32>) -> Result<()> {
        self.engine.set_queue_thresholds_pct(thresholds)
    }

    /// Set the idle-eviction timeout.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.cache.set_idle_timeout(timeout);
    }

    /// Set the sweeper interval.
    pub fn set_sweep_interval(&self, interval: Duration) {
        self.cache.set_sweep_interval(interval);
    }
}

impl<B: SessionBackend + 'static> Drop for SessionStore<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
