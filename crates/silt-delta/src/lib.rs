//! Field-level delta tracking for session records.
//!
//! This crate provides the per-record machinery underneath a write-behind
//! session store:
//! - [`DeltaRecord`]: accumulator of the last durable baseline plus the
//!   modified/removed field sets pending persistence, guarded by a lock
//!   with bounded-timeout acquisition
//! - [`PersistState`]: the queued/storing state machine that keeps a record
//!   from being enqueued or persisted twice concurrently
//! - [`SessionState`]: the trait a record type implements so its fields can
//!   be enumerated and encoded for change detection
//!
//! # Example
//!
//! ```rust,ignore
//! use silt_delta::{CaptureSettings, DeltaRecord, InMemorySession};
//!
//! let record = DeltaRecord::new("session-1");
//! let mut guard = record.lock();
//! guard.capture(&session, None, &settings);
//! if guard.is_dirty() {
//!     // hand the record to the write-behind engine
//! }
//! ```

mod error;
mod field;
mod header;
mod record;
mod source;
mod state;

pub use error::{DeltaError, Result};
pub use field::FieldRecord;
pub use header::{HeaderSnapshot, RequestMeta};
pub use record::{CaptureSettings, DeltaRecord, DeltaView, RecordGuard};
pub use source::{EncodedField, InMemorySession, SessionState};
pub use state::PersistState;
