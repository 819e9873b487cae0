//! Error types for capture, classification and persistence.

use thiserror::Error;

/// Capture error type.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The event sequencer has no iterator for this kind of exchange.
    #[error("Unsupported exchange kind: {0}")]
    UnsupportedExchangeKind(String),

    /// Upstream host name could not be resolved.
    #[error("Resolution failure: {0}")]
    ResolutionFailure(String),

    /// Upstream connection could not be established or was lost.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// Upstream did not answer in time.
    #[error("Response timeout: {0}")]
    ResponseTimeout(String),

    /// Proxy-level failure without an underlying network cause.
    #[error("Proxy error: {0}")]
    GenericProxyError(String),

    /// Snapshot could not be written.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Control command name is not part of the command set.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Control command parameter could not be interpreted.
    #[error("Invalid parameter {name}: {value}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
    },
}

impl CaptureError {
    /// Returns true for the failure categories produced by the classifier.
    pub fn is_exchange_failure(&self) -> bool {
        matches!(
            self,
            CaptureError::ResolutionFailure(_)
                | CaptureError::ConnectionFailure(_)
                | CaptureError::ResponseTimeout(_)
                | CaptureError::GenericProxyError(_)
        )
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_failures_are_flagged() {
        assert!(CaptureError::ResolutionFailure("x".into()).is_exchange_failure());
        assert!(CaptureError::ResponseTimeout("x".into()).is_exchange_failure());
        assert!(!CaptureError::PersistenceFailure("disk".into()).is_exchange_failure());
        assert!(!CaptureError::UnsupportedExchangeKind("quic".into()).is_exchange_failure());
    }

    #[test]
    fn display_includes_detail() {
        let err = CaptureError::InvalidParameter {
            name: "cleanHar".into(),
            value: "maybe".into(),
        };
        assert_eq!(err.to_string(), "Invalid parameter cleanHar: maybe");
    }
}
