//! Storage error types.

use harvest_core::CaptureError;
use thiserror::Error;

/// Errors that can occur while writing snapshots.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error (creating directories, reserving or writing files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The writer queue is full; the snapshot was dropped.
    #[error("Write queue full, dropped snapshot for {0}")]
    QueueFull(String),

    /// The writer thread is gone.
    #[error("Writer closed")]
    WriterClosed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<StorageError> for CaptureError {
    fn from(err: StorageError) -> Self {
        CaptureError::PersistenceFailure(err.to_string())
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
