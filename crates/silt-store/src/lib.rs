//! Write-behind session store for silt.
//!
//! A caching layer that sits in front of a durable store for
//! frequently-mutated, coarse-grained records. Mutations are absorbed in
//! memory, reduced to a field-level delta against the last durable
//! baseline, and persisted asynchronously, without persisting the same
//! state twice and without unbounded memory or thread growth under load.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SessionStore                                                    │
//! │  ├── RecordCache      concurrent map + idle-eviction sweeper     │
//! │  ├── WriteBehindEngine bounded queue + adaptive worker pool      │
//! │  └── SessionBackend   durable store (SQLite bundled)             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use silt_store::{SessionStore, SqliteBackend, StoreConfig};
//! use silt_store::delta::InMemorySession;
//!
//! let backend = SqliteBackend::open("sessions.db")?;
//! let store = SessionStore::new(backend, StoreConfig::default())?;
//! store.start();
//!
//! let mut session = InMemorySession::new("session-1");
//! session.insert("cart", vec!["item-1"])?;
//!
//! // compute the delta and queue it for asynchronous persistence
//! store.examine(&session, None)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Queue saturation and record-lock contention are absorbed by design:
//! they surface as logs and metrics, never as caller-visible errors.
//! Write-behind is fire-and-forget.

mod backend;
mod cache;
mod config;
mod engine;
mod error;
mod metrics;
mod queue;
mod session_store;
mod sqlite;

pub use backend::{NullBackend, SessionBackend, StoredRecord};
pub use cache::RecordCache;
pub use config::{CacheConfig, EngineConfig, StoreConfig};
pub use engine::WriteBehindEngine;
pub use error::{Result, StoreError};
pub use metrics::{MetricsGauges, MetricsSnapshot, StoreMetrics};
pub use session_store::SessionStore;
pub use sqlite::SqliteBackend;

/// Re-export of the delta-tracking layer.
pub use silt_delta as delta;
