//! Error types shared by the backend seam and the monitor service

use thiserror::Error;

/// How a failed backend call should be treated by the poll jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network/RPC hiccup. Retried, counted as a job failure.
    Transient,
    /// The sensor does not exist on this host. Not a failure: the field is omitted.
    Unavailable,
    /// The backend answered but refused the request.
    Rejected,
}

/// Error returned by any [`crate::backend::Backend`] call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("backend call failed: {0}")]
    Transient(String),

    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    #[error("backend rejected request: {0}")]
    Rejected(String),

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        BackendError::Transient(msg.into())
    }

    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        BackendError::Unavailable(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Transient(_) | BackendError::Malformed(_) => ErrorKind::Transient,
            BackendError::Unavailable(_) => ErrorKind::Unavailable,
            BackendError::Rejected(_) => ErrorKind::Rejected,
        }
    }

    /// Only transient failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Errors surfaced to UI callers of the monitor service
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("backend refused to start monitoring: {0}")]
    StartRejected(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("monitor service has been cleaned up")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, MonitorError>;
