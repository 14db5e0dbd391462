//! Durable backend trait for pluggable session persistence.
//!
//! This module defines the `SessionBackend` trait that decouples the
//! write-behind engine from a concrete durable store. The bundled
//! [`SqliteBackend`](crate::SqliteBackend) implements it over SQLite;
//! hosts with their own storage implement it directly.

use std::collections::{HashMap, HashSet};

use silt_delta::{DeltaView, FieldRecord, HeaderSnapshot};

use crate::error::Result;

/// A record's durable form, as reassembled from the backend.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Persisted header, if one exists.
    pub header: Option<HeaderSnapshot>,
    /// Persisted fields, keyed by field name.
    pub fields: HashMap<String, FieldRecord>,
}

/// Trait for durable session storage.
///
/// All methods must be safe to call from multiple worker threads
/// concurrently for independent keys.
pub trait SessionBackend: Send + Sync {
    /// Persist a record's pending delta: upsert the header and every
    /// modified field, delete every removed field key.
    fn persist(&self, delta: DeltaView<'_>) -> Result<()>;

    /// Load a record's durable form.
    ///
    /// Returns `Ok(None)` if the record does not exist.
    fn load(&self, id: &str) -> Result<Option<StoredRecord>>;

    /// Delete a record and its fields.
    fn remove(&self, id: &str) -> Result<()>;

    /// Keys of records whose expiry has passed.
    fn expired_keys(&self) -> Result<HashSet<String>>;

    /// Whether the backend is reachable and ready for use.
    fn is_available(&self) -> bool;
}

/// A no-op backend for cache-only operation and tests.
#[derive(Debug, Clone, Default)]
pub struct NullBackend;

impl SessionBackend for NullBackend {
    fn persist(&self, _delta: DeltaView<'_>) -> Result<()> {
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
