//! Common error types for notesync.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for notesync operations.
///
/// Errors fall into three families that drive retry behavior:
/// transient (`Network`, `Timeout`), payload rejections (`Validation`)
/// and fatal-for-the-entry (`QueueExhausted`). Anything else from the
/// remote, such as `PermissionDenied`, is a failed attempt that needs
/// attention but says nothing about the payload.
#[derive(Debug, Error)]
pub enum Error {
    /// Network request failed or the remote answered with a server error.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call did not finish within its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Input is malformed or missing required fields. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A queue entry used up its retry budget.
    #[error("Queue entry {entry} failed after {attempts} attempts")]
    QueueExhausted { entry: String, attempts: u32 },

    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Local schema is unknown or could not be migrated.
    #[error("Schema error: {0}")]
    Schema(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote refused access for the current session.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Local cache reset would discard unsynchronized changes.
    #[error("Reset refused: {0}")]
    ResetRefused(String),
}

impl Error {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Whether the payload itself was refused, so resending it cannot
    /// succeed.
    pub fn rejects_payload(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset by peer".into()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(15)).is_transient());
        assert!(!Error::Validation("bad id".into()).is_transient());
        assert!(!Error::PermissionDenied("nope".into()).is_transient());
        assert!(!Error::QueueExhausted {
            entry: "e".into(),
            attempts: 8
        }
        .is_transient());
    }

    #[test]
    fn test_only_validation_rejects_payload() {
        assert!(Error::Validation("bad id".into()).rejects_payload());
        assert!(!Error::PermissionDenied("jwt expired".into()).rejects_payload());
        assert!(!Error::NotFound("no such function".into()).rejects_payload());
        assert!(!Error::Network("down".into()).rejects_payload());
    }
}
