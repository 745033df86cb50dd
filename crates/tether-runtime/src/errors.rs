//! Runtime error types.

use tether_core::ConnectionError;
use tether_store::StoreError;

/// Errors from [`SessionPool`](crate::pool::SessionPool) operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The factory could not produce a connection. No entry was left behind.
    #[error("Failed to create connection for {session_key} after {attempts} attempt(s): {message}")]
    CreationFailed {
        /// Requested session key.
        session_key: String,
        /// Factory calls made, including retries.
        attempts: u32,
        /// Last factory error.
        message: String,
    },

    /// The pool is draining and accepts no new work.
    #[error("Session pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    /// Error category string for logs and reports.
    pub fn category(&self) -> &str {
        match self {
            Self::CreationFailed { .. } => "creation_failed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Errors surfaced to callers of [`SessionService`](crate::service::SessionService).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Unknown session, or a session the caller does not own.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Pool failure (creation or shutdown).
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Metadata store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// The provider failed the turn.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A blocking background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl ServiceError {
    /// Whether the caller can reasonably retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Pool(PoolError::CreationFailed { .. }) | Self::Provider(_) => true,
            Self::NotFound(_)
            | Self::Pool(PoolError::ShuttingDown)
            | Self::Storage(_)
            | Self::Task(_) => false,
        }
    }

    /// Error category string for logs and reports.
    pub fn category(&self) -> &str {
        match self {
            Self::NotFound(_) => "session_not_found",
            Self::Pool(e) => e.category(),
            Self::Storage(_) => "storage",
            Self::Provider(_) => "provider",
            Self::Task(_) => "task",
        }
    }
}

impl From<ConnectionError> for ServiceError {
    fn from(err: ConnectionError) -> Self {
        Self::Provider(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
