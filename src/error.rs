//! Error types for driftsync

use std::time::Duration;

use thiserror::Error;

use crate::types::{RemoteRecord, ZoneId};

/// Result type alias for driftsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the local store collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// The change-history cursor no longer addresses retained history.
    /// Recoverable: the caller resets to a full resync.
    #[error("change history cursor expired")]
    CursorExpired,

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("store error: {0}")]
    Other(String),
}

/// Errors surfaced by the remote record store collaborator.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("quota exceeded, retry after {retry_after:?}")]
    QuotaExceeded { retry_after: Duration },

    #[error("zone busy, retry after {retry_after:?}")]
    ZoneBusy { retry_after: Duration },

    #[error("service unavailable, retry after {retry_after:?}")]
    ServiceUnavailable { retry_after: Duration },

    /// The server holds a newer version of the record. Carries the server's
    /// copy when the backend returned one; otherwise the caller refetches.
    #[error("record version conflict")]
    Conflict {
        server_record: Option<Box<RemoteRecord>>,
    },

    #[error("zone not found: {}", .0.name)]
    ZoneNotFound(ZoneId),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("remote failure: {0}")]
    Failure(String),
}

impl RemoteError {
    /// Retry-after hint for the transient classes, `None` otherwise.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after }
            | RemoteError::QuotaExceeded { retry_after }
            | RemoteError::ZoneBusy { retry_after }
            | RemoteError::ServiceUnavailable { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Check if the error clears on its own after a pause.
    pub fn is_transient(&self) -> bool {
        self.retry_after().is_some()
    }
}

/// Main error type for driftsync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("malformed record {record}: {message}")]
    MalformedRecord { record: String, message: String },

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote submissions are gated by the shared pause deadline.
    #[error("remote submissions are paused")]
    Paused,

    #[error("operation cancelled")]
    Cancelled,

    #[error("sync error: {0}")]
    Sync(String),
}

impl SyncError {
    /// Check if error is retryable on the next trigger
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Paused => true,
            SyncError::Store(StoreError::CursorExpired) => true,
            SyncError::Remote(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Check if the error is a swallowed cancellation outcome
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled | SyncError::Remote(RemoteError::Cancelled)
        )
    }

    /// Retry-after hint propagated from the remote store, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Remote(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Pipeline that originated an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Push,
    Pull,
    Cache,
}

/// Error side-channel consumed by the application.
///
/// The engine never logs failures except through `tracing` and this sink.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &SyncError, module: Module);
}

/// Sink that drops every report.
pub struct NullSink;

impl ErrorSink for NullSink {
    fn report(&self, _error: &SyncError, _module: Module) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_remote_errors_carry_retry_after() {
        let err = RemoteError::RateLimited {
            retry_after: Duration::from_secs(30),
        };
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        let err = RemoteError::ZoneNotFound(ZoneId::private("default"));
        assert!(!err.is_transient());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn cursor_expiry_is_retryable() {
        let err = SyncError::Store(StoreError::CursorExpired);
        assert!(err.is_retryable());
    }

    #[test]
    fn cancellation_is_detected_through_remote_wrapper() {
        assert!(SyncError::Cancelled.is_cancellation());
        assert!(SyncError::Remote(RemoteError::Cancelled).is_cancellation());
        assert!(!SyncError::Paused.is_cancellation());
    }
}
