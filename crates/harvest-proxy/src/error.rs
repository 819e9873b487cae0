//! Error types for the capture proxy.

use harvest_storage::StorageError;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Snapshot storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
