//! Error types for store operations.

use silt_delta::DeltaError;

/// Error type for store operations.
///
/// Lock contention and queue saturation are deliberately absent: both are
/// expected under load and surface only as logs and metrics, never as
/// caller-visible failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The durable backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// The durable backend is not available.
    #[error("backend is not available")]
    Unavailable,

    /// SQLite error from the bundled backend.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Error from the delta layer.
    #[error(transparent)]
    Delta(#[from] DeltaError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
