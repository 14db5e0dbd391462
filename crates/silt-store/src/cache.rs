//! Concurrent record cache with idle-time eviction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use silt_delta::DeltaRecord;
use tracing::{debug, info, warn};

use crate::backend::SessionBackend;
use crate::config::CacheConfig;
use crate::error::Result;

/// Concurrent map of record key to [`DeltaRecord`], with a background
/// sweeper that evicts idle entries.
///
/// Lookups, inserts and removals on different keys never block each other.
/// The sweeper wakes on a fixed interval and evicts records idle beyond the
/// configured timeout, but only when it can take the record's lock without
/// blocking, so eviction never races an in-flight examine or persist and
/// never stalls behind a busy worker. Eviction removes the entry from the
/// map only; it is not a persistence trigger.
#[derive(Debug)]
pub struct RecordCache {
    map: DashMap<String, Arc<DeltaRecord>>,
    /// Serializes backend loads so a miss storm cannot load the same record
    /// repeatedly.
    load_lock: Mutex<()>,
    idle_timeout_ms: AtomicU64,
    sweep_interval_ms: AtomicU64,
    sweeper: Mutex<Option<SweeperHandle>>,
}

#[derive(Debug)]
struct SweeperHandle {
    stop: Arc<StopSignal>,
    thread: std::thread::JoinHandle<()>,
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl RecordCache {
    /// Create a cache. The sweeper is not started until
    /// [`start_sweeper`](Self::start_sweeper).
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            map: DashMap::new(),
            load_lock: Mutex::new(()),
            idle_timeout_ms: AtomicU64::new(config.idle_timeout.as_millis() as u64),
            sweep_interval_ms: AtomicU64::new(config.sweep_interval.as_millis() as u64),
            sweeper: Mutex::new(None),
        }
    }

    /// Look up a record.
    pub fn get(&self, id: &str) -> Option<Arc<DeltaRecord>> {
        self.map.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert a record, replacing any previous entry.
    pub fn put(&self, id: impl Into<String>, record: Arc<DeltaRecord>) {
        self.map.insert(id.into(), record);
    }

    /// Remove a record from the map.
    pub fn remove(&self, id: &str) -> Option<Arc<DeltaRecord>> {
        self.map.remove(id).map(|(_, record)| record)
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether a record is cached.
    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    /// Fetch a record, loading it from the backend on a miss.
    ///
    /// A miss creates either a hydrated record (payloads wiped, change
    /// detection runs off checksums) or an empty shell if the backend has
    /// nothing for the key.
    pub fn get_or_load(&self, id: &str, backend: &dyn SessionBackend) -> Result<Arc<DeltaRecord>> {
        if let Some(record) = self.get(id) {
            return Ok(record);
        }

        let _load = self.load_lock.lock();
        // another thread may have finished the load while we waited
        if let Some(record) = self.get(id) {
            return Ok(record);
        }

        let record = DeltaRecord::new(id);
        match backend.load(id)? {
            Some(stored) => {
                let mut guard = record.lock();
                guard.hydrate(stored.header, stored.fields);
                guard.wipe_field_payloads();
                drop(guard);
                debug!(session_id = %id, "Record loaded from backend into cache");
            }
            None => {
                debug!(session_id = %id, "Record not in backend, caching empty shell");
            }
        }

        let record = Arc::new(record);
        self.map.insert(id.to_string(), Arc::clone(&record));
        Ok(record)
    }

    /// Configured idle-eviction timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    /// Adjust the idle-eviction timeout. Takes effect on the next pass.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Adjust the sweeper interval. Takes effect after the current sleep.
    pub fn set_sweep_interval(&self, interval: Duration) {
        self.sweep_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Run one eviction pass. Returns the number of records evicted.
    ///
    /// Called periodically by the sweeper thread; public so hosts and tests
    /// can force a pass.
    pub fn sweep_once(&self) -> usize {
        let idle_timeout = self.idle_timeout();

        let candidates: Vec<String> = self
            .map
            .iter()
            .filter(|entry| entry.value().idle() >= idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in candidates {
            let Some(record) = self.get(&id) else {
                continue;
            };
            // Never wait: a record being examined or persisted right now is
            // not one we should evict.
            match record.try_lock() {
                Some(_guard) => {
                    // re-check under the lock; it may have been touched since
                    // the scan
                    if record.idle() >= idle_timeout {
                        self.map.remove(&id);
                        evicted += 1;
                        debug!(session_id = %id, "Evicted idle record from cache");
                    }
                }
                None => {
                    debug!(session_id = %id, "Skipping eviction of locked record");
                }
            }
        }

        if evicted > 0 {
            debug!(evicted, cache_size = self.map.len(), "Sweeper pass completed");
        }
        evicted
    }

    /// Start the background sweeper. No-op if already running.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let stop = Arc::new(StopSignal::default());
        // hold the cache weakly so an abandoned cache can still be dropped
        let cache = Arc::downgrade(self);
        let signal = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("silt-sweeper".to_string())
            .spawn(move || {
                info!("Record cache sweeper started");
                loop {
                    let interval = match cache.upgrade() {
                        Some(cache) => {
                            Duration::from_millis(cache.sweep_interval_ms.load(Ordering::Relaxed))
                        }
                        None => break,
                    };
                    let mut stopped = signal.stopped.lock();
                    if !*stopped {
                        signal.wake.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    match cache.upgrade() {
                        Some(cache) => {
                            cache.sweep_once();
                        }
                        None => break,
                    }
                }
                info!("Record cache sweeper stopped");
            });

        match thread {
            Ok(thread) => *sweeper = Some(SweeperHandle { stop, thread }),
            Err(e) => warn!(error = %e, "Could not start cache sweeper thread"),
        }
    }

    /// Stop the background sweeper and wait for it to exit.
    pub fn stop_sweeper(&self) {
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            *handle.stop.stopped.lock() = true;
            handle.stop.wake.notify_all();
            let _ = handle.thread.join();
        }
    }
}

impl Drop for RecordCache {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}
