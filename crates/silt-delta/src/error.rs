//! Error types for delta tracking.

use std::time::Duration;

/// Error type for delta-record operations.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    /// The record's lock could not be acquired within the timeout.
    ///
    /// Expected under concurrency: callers skip the operation and rely on
    /// a later write to retrigger it.
    #[error("could not obtain lock for record {record_id} within {timeout:?}")]
    LockTimeout {
        /// Record whose lock was contended.
        record_id: String,
        /// How long the caller was willing to wait.
        timeout: Duration,
    },

    /// A single field failed to encode.
    ///
    /// Isolated per field: delta capture skips the field and continues.
    #[error("could not encode field {key}: {reason}")]
    FieldEncode {
        /// Key of the field that failed.
        key: String,
        /// Underlying encoder message.
        reason: String,
    },
}

/// Result type for delta-record operations.
pub type Result<T> = std::result::Result<T, DeltaError>;
