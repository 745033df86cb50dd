//! Pool entries and the handles leased to callers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tether_core::{Connection, ConnectionError, ConnectionState, ProviderEventStream};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A live connection owned by the pool.
pub(crate) struct PoolEntry {
    pub(crate) session_key: String,
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) turn_lock: Arc<Mutex<()>>,
    pub(crate) working_context: PathBuf,
    pub(crate) owner_id: String,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
}

impl PoolEntry {
    pub(crate) fn new(
        session_key: String,
        connection: Arc<dyn Connection>,
        working_context: PathBuf,
        owner_id: String,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_key,
            connection,
            turn_lock: Arc::new(Mutex::new(())),
            working_context,
            owner_id,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Bump `last_used_at`, strictly.
    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now().max(self.last_used_at + Duration::from_nanos(1));
    }

    pub(crate) fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.state().is_connected()
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_key: self.session_key.clone(),
            owner_id: self.owner_id.clone(),
            working_context: self.working_context.clone(),
            connection: Arc::clone(&self.connection),
            turn_lock: Arc::clone(&self.turn_lock),
        }
    }

    pub(crate) fn info(&self, now: Instant) -> PoolEntryInfo {
        PoolEntryInfo {
            session_key: self.session_key.clone(),
            owner_id: self.owner_id.clone(),
            working_context: self.working_context.clone(),
            age: now.saturating_duration_since(self.created_at),
            idle: self.idle_at(now),
            connected: self.is_connected(),
        }
    }
}

/// Read-only snapshot of a pool entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntryInfo {
    /// Session key.
    pub session_key: String,
    /// Owner of the session.
    pub owner_id: String,
    /// Working context the connection was opened in.
    pub working_context: PathBuf,
    /// Time since creation.
    pub age: Duration,
    /// Time since last access.
    pub idle: Duration,
    /// Connection reported `Connected` when the snapshot was taken.
    pub connected: bool,
}

/// A caller's lease on a pooled connection.
///
/// Exposes turn operations only. Closing the connection stays with the pool;
/// a handle outliving an eviction sees its turns fail with the connection's
/// own error.
#[derive(Clone)]
pub struct SessionHandle {
    session_key: String,
    owner_id: String,
    working_context: PathBuf,
    connection: Arc<dyn Connection>,
    turn_lock: Arc<Mutex<()>>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_key", &self.session_key)
            .field("owner_id", &self.owner_id)
            .field("working_context", &self.working_context)
            .field("state", &self.connection.state())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Session key the entry is stored under.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Owner recorded when the entry was created.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Working context the connection was opened in.
    pub fn working_context(&self) -> &Path {
        &self.working_context
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Send `prompt` and return the turn's events.
    ///
    /// Turns on one connection never interleave: the turn lock is taken
    /// before sending and released when the returned stream is dropped.
    pub async fn run_turn(&self, prompt: &str) -> Result<ProviderEventStream, ConnectionError> {
        let guard = Arc::clone(&self.turn_lock).lock_owned().await;
        self.connection.send(prompt).await?;
        let mut events = self.connection.receive().await?;
        Ok(Box::pin(async_stream::stream! {
            let _turn = guard;
            while let Some(event) = events.next().await {
                yield event;
            }
        }))
    }
}
