//! Errors raised at the provider boundary.

/// Errors a [`Connection`](crate::connection::Connection) or
/// [`ConnectionFactory`](crate::connection::ConnectionFactory) can report.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connect handshake failed.
    #[error("Connect failed: {message}")]
    Connect {
        /// Error description.
        message: String,
    },

    /// The underlying transport (process pipe, socket) failed.
    #[error("Transport error: {message}")]
    Transport {
        /// Error description.
        message: String,
    },

    /// The connection was already closed.
    #[error("Connection closed")]
    Closed,

    /// An operation did not finish in time.
    #[error("Timed out after {after_ms}ms")]
    Timeout {
        /// Elapsed time before giving up.
        after_ms: u64,
    },

    /// The provider has no conversation for the requested resume key.
    #[error("Provider session not found: {session_key}")]
    SessionNotFound {
        /// Resume key that was rejected.
        session_key: String,
    },

    /// The provider sent something that could not be understood.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error description.
        message: String,
    },
}

impl ConnectionError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Closed | Self::SessionNotFound { .. } | Self::Protocol { .. } => false,
        }
    }

    /// Error category string for logs and reports.
    pub fn category(&self) -> &str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Transport { .. } => "transport",
            Self::Closed => "closed",
            Self::Timeout { .. } => "timeout",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::Protocol { .. } => "protocol",
        }
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(err: DecodeError) -> Self {
        Self::Protocol {
            message: err.to_string(),
        }
    }
}

/// A provider output line could not be decoded into events.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not JSON, or JSON of the wrong shape.
    #[error("invalid provider line: {0}")]
    Json(#[from] serde_json::Error),

    /// The line was empty.
    #[error("empty provider line")]
    Empty,
}
