//! # Connection traits
//!
//! The provider adapter boundary. A [`ConnectionFactory`] opens (or resumes)
//! a long-lived conversation and hands back a [`Connection`] that has already
//! completed its connect handshake. The session pool owns every connection it
//! receives and is the only party that closes them.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::ConnectionError;
use crate::events::ProviderEvent;

/// Boxed stream of provider events for one turn.
///
/// The stream is finite: it ends when the provider reports the turn complete.
pub type ProviderEventStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, ConnectionError>> + Send>>;

/// Locally observable connection state.
///
/// `Unknown` covers every case the adapter cannot vouch for. Callers treat
/// it the same as `Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handshake completed and the transport is open.
    Connected,
    /// Closed, by either side.
    Disconnected,
    /// The adapter cannot tell.
    Unknown,
}

impl ConnectionState {
    /// Whether the state is known to be healthy.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Parameters for opening a provider connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Working directory the provider isolates the conversation in.
    pub working_context: PathBuf,
    /// Existing provider session to resume; `None` starts a fresh one.
    pub resume_key: Option<String>,
}

impl ConnectRequest {
    /// Request for a brand new conversation.
    pub fn new_session(working_context: impl Into<PathBuf>) -> Self {
        Self {
            working_context: working_context.into(),
            resume_key: None,
        }
    }

    /// Request to resume `session_key`.
    pub fn resume(working_context: impl Into<PathBuf>, session_key: impl Into<String>) -> Self {
        Self {
            working_context: working_context.into(),
            resume_key: Some(session_key.into()),
        }
    }
}

/// A live conversation with the provider.
///
/// All methods take `&self`; implementations synchronize internally so the
/// connection can be shared between the pool and an in-flight turn.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Provider-assigned session key, once known.
    fn session_key(&self) -> Option<String>;

    /// Cheap local liveness check. Must not perform I/O.
    fn state(&self) -> ConnectionState;

    /// Perform the connect handshake.
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Close the connection. Calling it twice is allowed.
    async fn disconnect(&self) -> Result<(), ConnectionError>;

    /// Send a prompt, starting a turn.
    async fn send(&self, prompt: &str) -> Result<(), ConnectionError>;

    /// Events for the turn started by the last [`send`](Connection::send).
    async fn receive(&self) -> Result<ProviderEventStream, ConnectionError>;
}

/// Creates connected [`Connection`]s.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection for `request`. The returned connection has already
    /// completed [`Connection::connect`].
    async fn create(&self, request: &ConnectRequest) -> Result<Arc<dyn Connection>, ConnectionError>;
}
