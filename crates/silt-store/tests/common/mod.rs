//! Shared fixtures for integration tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use silt_store::delta::{CaptureSettings, DeltaRecord, DeltaView, InMemorySession};
use silt_store::{Result, SessionBackend, StoreError, StoredRecord};

pub const SETTINGS: CaptureSettings<'static> = CaptureSettings {
    node_id: "node-1",
    app: "/app",
    time_skew: Duration::from_secs(60),
};

/// Build a record with one captured (dirty) field.
pub fn dirty_record(id: &str) -> Arc<DeltaRecord> {
    let mut session = InMemorySession::new(id);
    session.insert("a", "1").unwrap();
    let record = DeltaRecord::new(id);
    record.lock().capture(&session, None, &SETTINGS);
    Arc::new(record)
}

/// Poll `condition` until it holds or the deadline passes.
pub fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Backend whose `persist` blocks until the gate is released, so tests can
/// hold a worker mid-persist deterministically.
pub struct GateBackend {
    open: Mutex<bool>,
    released: Condvar,
    persisted: Mutex<Vec<String>>,
}

impl GateBackend {
    pub fn closed() -> Self {
        Self {
            open: Mutex::new(false),
            released: Condvar::new(),
            persisted: Mutex::new(Vec::new()),
        }
    }

    pub fn opened() -> Self {
        Self {
            open: Mutex::new(true),
            released: Condvar::new(),
            persisted: Mutex::new(Vec::new()),
        }
    }

    pub fn release(&self) {
        *self.open.lock() = true;
        self.released.notify_all();
    }

    pub fn persisted(&self) -> Vec<String> {
        self.persisted.lock().clone()
    }
}

impl SessionBackend for GateBackend {
    fn persist(&self, delta: DeltaView<'_>) -> Result<()> {
        let mut open = self.open.lock();
        while !*open {
            self.released.wait(&mut open);
        }
        drop(open);
        self.persisted.lock().push(delta.id.to_string());
        Ok(())
    }

    fn load(&self, _id: &str) -> Result<Option<StoredRecord>> {
        Ok(None)
    }

    fn remove(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn expired_keys(&self) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Backend whose `persist` always fails.
#[derive(Default)]
pub struct FailBackend;

impl SessionBackend for FailBackend {
    fn persist(&self, _delta: DeltaView<'_>) -> Result<()> {
        Err(StoreError::Backend("induced failure".to_string()))
    }

    fn load(&self, _id: &str) -> Result<Option<StoredRecord>> {
        Ok(None)
    }

    fn remove(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn expired_keys(&self) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    fn is_available(&self) -> bool {
        false
    }
}
