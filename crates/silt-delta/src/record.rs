//! The per-record delta accumulator and its lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::{DeltaError, Result};
use crate::field::{FieldRecord, checksum};
use crate::header::{HeaderSnapshot, RequestMeta};
use crate::source::SessionState;
use crate::state::PersistState;

/// Ambient context for a delta capture.
#[derive(Debug, Clone)]
pub struct CaptureSettings<'a> {
    /// Node performing the capture.
    pub node_id: &'a str,
    /// Application the record belongs to.
    pub app: &'a str,
    /// Skew window for header activity timestamps.
    pub time_skew: Duration,
}

/// Borrowed view of a record's pending delta, handed to a backend.
#[derive(Debug)]
pub struct DeltaView<'a> {
    /// Record key.
    pub id: &'a str,
    /// Header snapshot, if one has been captured.
    pub header: Option<&'a HeaderSnapshot>,
    /// Whether the header changed since the last persist.
    pub header_changed: bool,
    /// Fields changed since the last persist.
    pub modified: &'a HashMap<String, FieldRecord>,
    /// Field keys deleted since the last persist.
    pub removed: &'a HashSet<String>,
}

/// Mutable state of a record, reachable only through [`RecordGuard`].
#[derive(Debug, Default)]
struct DeltaState {
    header: Option<HeaderSnapshot>,
    header_changed: bool,
    /// Last known durable form of every field, the comparison baseline.
    fields: HashMap<String, FieldRecord>,
    /// Fields changed since the last persist.
    modified: HashMap<String, FieldRecord>,
    /// Field keys deleted since the last persist.
    removed: HashSet<String>,
    /// Fields seen in the most recent capture.
    field_count: usize,
    /// Total serialized bytes seen in the most recent capture.
    payload_size: usize,
}

/// Per-key accumulator of the last durable baseline and the pending delta.
///
/// All mutation goes through [`RecordGuard`], obtained from [`lock`],
/// [`try_lock_for`] or [`try_lock`]; holding the lock is enforced by
/// construction. The persistence state lives beside the data lock so the
/// engine's already-queued pre-check stays cheap, but transitions are only
/// reachable through the guard.
///
/// [`lock`]: DeltaRecord::lock
/// [`try_lock_for`]: DeltaRecord::try_lock_for
/// [`try_lock`]: DeltaRecord::try_lock
#[derive(Debug)]
pub struct DeltaRecord {
    id: String,
    state: AtomicU8,
    /// Millisecond epoch of the last access; drives idle eviction only.
    last_access_ms: AtomicI64,
    last_lock_wait_ms: AtomicU64,
    max_lock_wait_ms: AtomicU64,
    /// Current lock holder, for diagnostics.
    owner: Mutex<Option<String>>,
    inner: Mutex<DeltaState>,
}

impl DeltaRecord {
    /// Create an empty record.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: AtomicU8::new(PersistState::None as u8),
            last_access_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            last_lock_wait_ms: AtomicU64::new(0),
            max_lock_wait_ms: AtomicU64::new(0),
            owner: Mutex::new(None),
            inner: Mutex::new(DeltaState::default()),
        }
    }

    /// Record key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current persistence state. Readable without the lock; mutable only
    /// through the guard.
    pub fn persist_state(&self) -> PersistState {
        PersistState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Acquire the lock, blocking indefinitely.
    pub fn lock(&self) -> RecordGuard<'_> {
        let started = Instant::now();
        let state = self.inner.lock();
        self.admit(started.elapsed());
        RecordGuard {
            record: self,
            state,
        }
    }

    /// Acquire the lock, giving up after `timeout`.
    ///
    /// Returns a distinguishable [`DeltaError::LockTimeout`] on contention
    /// rather than blocking the caller indefinitely.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<RecordGuard<'_>> {
        let started = Instant::now();
        match self.inner.try_lock_for(timeout) {
            Some(state) => {
                self.admit(started.elapsed());
                Ok(RecordGuard {
                    record: self,
                    state,
                })
            }
            None => Err(DeltaError::LockTimeout {
                record_id: self.id.clone(),
                timeout,
            }),
        }
    }

    /// Acquire the lock only if it is free right now.
    ///
    /// Used by the cache sweeper, which must never block behind a busy
    /// worker.
    pub fn try_lock(&self) -> Option<RecordGuard<'_>> {
        let state = self.inner.try_lock()?;
        self.admit(Duration::ZERO);
        Some(RecordGuard {
            record: self,
            state,
        })
    }

    /// Thread currently holding the lock, for diagnostics.
    pub fn lock_owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    /// Mark the record as accessed now.
    pub fn touch(&self) {
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// How long the record has been idle.
    pub fn idle(&self) -> Duration {
        let last = self.last_access_ms.load(Ordering::Acquire);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    /// Wait time of the most recent lock acquisition.
    pub fn last_lock_wait(&self) -> Duration {
        Duration::from_millis(self.last_lock_wait_ms.load(Ordering::Relaxed))
    }

    /// Longest observed wait for this record's lock.
    pub fn max_lock_wait(&self) -> Duration {
        Duration::from_millis(self.max_lock_wait_ms.load(Ordering::Relaxed))
    }

    fn admit(&self, waited: Duration) {
        let waited_ms = waited.as_millis() as u64;
        self.last_lock_wait_ms.store(waited_ms, Ordering::Relaxed);
        self.max_lock_wait_ms.fetch_max(waited_ms, Ordering::Relaxed);
        *self.owner.lock() = Some(current_thread_label());
    }
}

fn current_thread_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

/// Exclusive access to a record's delta state.
///
/// Dropping the guard releases the lock and clears the owner diagnostic.
pub struct RecordGuard<'a> {
    record: &'a DeltaRecord,
    state: MutexGuard<'a, DeltaState>,
}

impl RecordGuard<'_> {
    /// Record key.
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Current persistence state.
    pub fn state(&self) -> PersistState {
        self.record.persist_state()
    }

    /// Transition the persistence state.
    ///
    /// # Panics
    ///
    /// Panics on an illegal transition. That is a programming error in the
    /// engine, not a recoverable condition.
    pub fn set_state(&mut self, next: PersistState) {
        let current = self.record.persist_state();
        assert!(
            current.can_transition_to(next),
            "illegal persistence state transition {current} -> {next} for record {}",
            self.record.id
        );
        self.record.state.store(next as u8, Ordering::Release);
    }

    /// Force the state back to [`PersistState::None`] without validation.
    ///
    /// Only for the enqueue-rejection rollback and shutdown drain, which
    /// tolerate racing a concurrent re-queue. Everything else must use
    /// [`set_state`](Self::set_state).
    pub fn force_unqueued(&mut self) {
        self.record
            .state
            .store(PersistState::None as u8, Ordering::Release);
    }

    /// Whether anything is pending persistence.
    pub fn is_dirty(&self) -> bool {
        self.state.header_changed
            || !self.state.modified.is_empty()
            || !self.state.removed.is_empty()
    }

    /// Whether the header changed since the last persist.
    pub fn header_changed(&self) -> bool {
        self.state.header_changed
    }

    /// Most recently captured header.
    pub fn header(&self) -> Option<&HeaderSnapshot> {
        self.state.header.as_ref()
    }

    /// Baseline field records.
    pub fn fields(&self) -> &HashMap<String, FieldRecord> {
        &self.state.fields
    }

    /// Fields changed since the last persist.
    pub fn modified(&self) -> &HashMap<String, FieldRecord> {
        &self.state.modified
    }

    /// Field keys deleted since the last persist.
    pub fn removed(&self) -> &HashSet<String> {
        &self.state.removed
    }

    /// Fields seen in the most recent capture.
    pub fn field_count(&self) -> usize {
        self.state.field_count
    }

    /// Total serialized bytes seen in the most recent capture.
    pub fn payload_size(&self) -> usize {
        self.state.payload_size
    }

    /// Borrowed view of the pending delta for a backend.
    pub fn delta(&self) -> DeltaView<'_> {
        DeltaView {
            id: &self.record.id,
            header: self.state.header.as_ref(),
            header_changed: self.state.header_changed,
            modified: &self.state.modified,
            removed: &self.state.removed,
        }
    }

    /// Compare the live record against the baseline and fold the differences
    /// into the pending delta.
    ///
    /// A field counts as changed when it has no baseline, its length differs,
    /// or its checksum differs; changed fields enter `modified` and replace
    /// the baseline. Baseline fields absent from the source move to
    /// `removed`. Fields that fail to encode are skipped with a warning:
    /// one poison field must not block persistence of the rest.
    ///
    /// Pending changes accumulate across captures; only
    /// [`clear_after_persist`](Self::clear_after_persist) resets them.
    pub fn capture(
        &mut self,
        source: &dyn SessionState,
        request: Option<&RequestMeta>,
        settings: &CaptureSettings<'_>,
    ) {
        let new_header = HeaderSnapshot::capture(source, request, settings.node_id, settings.app);
        let changed = match &self.state.header {
            None => true,
            Some(old) => old.differs_from(&new_header, settings.time_skew),
        };
        self.state.header_changed = self.state.header_changed || changed;
        self.state.header = Some(new_header);

        self.state.field_count = 0;
        self.state.payload_size = 0;

        let keys = source.field_keys();
        let mut live: HashSet<String> = HashSet::with_capacity(keys.len());
        for key in keys {
            // A field that fails to encode is still live: it must not be
            // treated as removed.
            live.insert(key.clone());
            let encoded = match source.encode_field(&key) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(
                        record_id = %self.record.id,
                        field = %key,
                        error = %e,
                        "skipping field that failed to encode"
                    );
                    continue;
                }
            };

            self.state.field_count += 1;
            self.state.payload_size += encoded.bytes.len();

            let new_checksum = checksum(&encoded.bytes);
            let (changed, update_count) = match self.state.fields.get(&key) {
                None => (true, 1),
                Some(baseline) => (
                    baseline.differs_from(encoded.bytes.len(), &new_checksum),
                    baseline.update_count + 1,
                ),
            };
            if changed {
                let record = FieldRecord::from_encoded(&key, update_count, encoded);
                self.state.modified.insert(key.clone(), record.clone());
                self.state.fields.insert(key.clone(), record);
            }
            self.state.removed.remove(&key);
        }

        let dead: Vec<String> = self
            .state
            .fields
            .keys()
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect();
        for key in dead {
            self.state.fields.remove(&key);
            self.state.modified.remove(&key);
            self.state.removed.insert(key);
        }
    }

    /// Drop the pending delta after a persist.
    ///
    /// The baseline is retained as the comparison point for future captures.
    pub fn clear_after_persist(&mut self) {
        self.state.header_changed = false;
        self.state.modified.clear();
        self.state.removed.clear();
    }

    /// Install a baseline loaded from the durable store.
    pub fn hydrate(&mut self, header: Option<HeaderSnapshot>, fields: HashMap<String, FieldRecord>) {
        self.state.header = header;
        self.state.header_changed = false;
        self.state.fields = fields;
        self.state.modified.clear();
        self.state.removed.clear();
    }

    /// Drop the payload bytes of every baseline field to bound memory.
    ///
    /// Change detection keeps working off checksum and length. Pending
    /// `modified` entries keep their payloads, since those are still needed for
    /// persistence.
    pub fn wipe_field_payloads(&mut self) {
        for record in self.state.fields.values_mut() {
            record.data = None;
        }
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        *self.record.owner.lock() = None;
    }
}
