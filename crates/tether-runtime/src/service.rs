//! Caller-facing session service.
//!
//! [`SessionService`] ties the pool (live connections) to the metadata store
//! (durable records). The store is authoritative: a key without metadata is
//! [`ServiceError::NotFound`] and the pool is never asked to resume it.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tether_core::{ConnectionFactory, ProviderEvent, ProviderEventStream};
use tether_settings::TetherSettings;
use tether_store::{MetadataStore, SessionMetadata, StoreError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::pool::{PoolConfig, SessionPool};

/// Largest page [`SessionService::list_sessions`] returns.
pub const MAX_PAGE_SIZE: usize = 100;

/// Boxed stream of [`StreamChunk`]s for one turn.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

// ─────────────────────────────────────────────────────────────────────────────
// Response types
// ─────────────────────────────────────────────────────────────────────────────

/// Complete answer to a prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// Session the turn ran in.
    pub session_key: String,
    /// Identifier of the assistant message.
    pub message_id: String,
    /// Concatenated assistant text.
    pub response: String,
    /// Wall time from lookup to the end of the turn.
    pub processing_time: Duration,
}

/// Kind of a [`StreamChunk`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// First chunk of every stream.
    Start,
    /// A piece of assistant text.
    Delta,
    /// The turn finished; `content` holds the full text.
    Complete,
    /// The turn failed; `error` holds the reason.
    Error,
}

/// One element of a streamed turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    /// Session the turn runs in.
    pub session_key: String,
    /// Shared by every chunk of one turn.
    pub message_id: String,
    /// Chunk kind.
    pub kind: ChunkKind,
    /// Text for `delta` and `complete`.
    pub content: Option<String>,
    /// Reason for `error`.
    pub error: Option<String>,
}

impl StreamChunk {
    fn new(session_key: &str, message_id: &str, kind: ChunkKind) -> Self {
        Self {
            session_key: session_key.to_string(),
            message_id: message_id.to_string(),
            kind,
            content: None,
            error: None,
        }
    }

    fn with_content(mut self, content: String) -> Self {
        self.content = Some(content);
        self
    }

    fn with_error(mut self, error: &ServiceError) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Whether the chunk ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ChunkKind::Complete | ChunkKind::Error)
    }
}

/// One page of an owner's sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    /// Sessions on this page, newest first.
    pub sessions: Vec<SessionMetadata>,
    /// Sessions the owner has in total.
    pub total_count: usize,
    /// More sessions follow this page.
    pub has_more: bool,
    /// Offset of the next page, when there is one.
    pub next_offset: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// Session lifecycle and conversation turns over a pool and a store.
#[derive(Clone, Debug)]
pub struct SessionService {
    pool: SessionPool,
    store: Arc<MetadataStore>,
}

impl SessionService {
    /// Service over an existing pool and store.
    pub fn new(pool: SessionPool, store: Arc<MetadataStore>) -> Self {
        Self { pool, store }
    }

    /// Open the configured store, drop expired metadata, and build the pool.
    pub fn from_settings(
        factory: Arc<dyn ConnectionFactory>,
        settings: &TetherSettings,
    ) -> Result<Self, ServiceError> {
        let store = MetadataStore::open(settings.store.resolved_path())?;
        let expired = store.cleanup_older_than(settings.store.max_age_days)?;
        if expired > 0 {
            info!(expired, max_age_days = settings.store.max_age_days, "dropped expired session metadata");
        }
        let pool = SessionPool::new(factory, PoolConfig::from(settings));
        Ok(Self::new(pool, Arc::new(store)))
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Underlying store.
    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Open a new provider session and record it.
    ///
    /// If the metadata write fails the fresh connection is evicted so no
    /// untracked entry stays in the pool.
    #[instrument(skip(self, working_context, display_name), fields(working_context = %working_context.display()))]
    pub async fn create_session(
        &self,
        owner_id: &str,
        working_context: &Path,
        display_name: Option<&str>,
    ) -> Result<SessionMetadata, ServiceError> {
        let provisional = Uuid::now_v7().to_string();
        let handle = self
            .pool
            .get_or_create(&provisional, working_context, owner_id, true)
            .await?;
        let session_key = handle.session_key().to_string();

        let record = {
            let key = session_key.clone();
            let owner = owner_id.to_string();
            let context = working_context.to_path_buf();
            let name = display_name.map(str::to_string);
            self.with_store(move |store| store.store(&key, &owner, &context, name.as_deref(), None))
                .await
        };
        match record {
            Ok(metadata) => {
                info!(session_key, owner_id, "session created");
                Ok(metadata)
            }
            Err(error) => {
                warn!(session_key, %error, "failed to record session, evicting connection");
                let _ = self.pool.evict(&session_key).await;
                Err(error)
            }
        }
    }

    /// Run one turn and collect the full response.
    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    pub async fn query(&self, session_key: &str, prompt: &str) -> Result<QueryResponse, ServiceError> {
        let started = Instant::now();
        let mut events = self.begin_turn(session_key, prompt).await?;

        let mut response = String::new();
        while let Some(event) = events.next().await {
            if let Some(text) = consume_event(session_key, event?)? {
                response.push_str(&text);
            }
        }

        let processing_time = started.elapsed();
        debug!(
            session_key,
            response_len = response.len(),
            elapsed_ms = u64::try_from(processing_time.as_millis()).unwrap_or(u64::MAX),
            "query completed"
        );
        Ok(QueryResponse {
            session_key: session_key.to_string(),
            message_id: Uuid::now_v7().to_string(),
            response,
            processing_time,
        })
    }

    /// Run one turn as a stream of chunks.
    ///
    /// The stream always opens with one `start` chunk and closes with exactly
    /// one `complete` or `error` chunk, whatever goes wrong in between.
    pub fn stream_query(&self, session_key: &str, prompt: &str) -> ChunkStream {
        let service = self.clone();
        let session_key = session_key.to_string();
        let prompt = prompt.to_string();

        Box::pin(async_stream::stream! {
            let message_id = Uuid::now_v7().to_string();
            yield StreamChunk::new(&session_key, &message_id, ChunkKind::Start);

            let mut events = match service.begin_turn(&session_key, &prompt).await {
                Ok(events) => events,
                Err(error) => {
                    warn!(session_key = %session_key, %error, "stream could not start");
                    yield StreamChunk::new(&session_key, &message_id, ChunkKind::Error).with_error(&error);
                    return;
                }
            };

            let mut response = String::new();
            while let Some(event) = events.next().await {
                match event.map_err(ServiceError::from).and_then(|e| consume_event(&session_key, e)) {
                    Ok(Some(text)) => {
                        response.push_str(&text);
                        yield StreamChunk::new(&session_key, &message_id, ChunkKind::Delta).with_content(text);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(session_key = %session_key, %error, "stream failed mid-turn");
                        yield StreamChunk::new(&session_key, &message_id, ChunkKind::Error).with_error(&error);
                        return;
                    }
                }
            }

            yield StreamChunk::new(&session_key, &message_id, ChunkKind::Complete).with_content(response);
        })
    }

    /// Metadata of `session_key`, if it exists and belongs to `owner_id`.
    pub fn get_session(&self, session_key: &str, owner_id: &str) -> Option<SessionMetadata> {
        self.store
            .get(session_key)
            .filter(|m| m.is_owned_by(owner_id))
    }

    /// Page through `owner_id`'s sessions, newest first. `limit` is clamped
    /// to `1..=MAX_PAGE_SIZE`.
    pub fn list_sessions(&self, owner_id: &str, limit: usize, offset: usize) -> SessionPage {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let total_count = self.store.count_by_owner(owner_id);
        let sessions = self.store.list_by_owner(owner_id, limit, offset);
        let end = offset.saturating_add(sessions.len());
        let has_more = end < total_count;
        SessionPage {
            sessions,
            total_count,
            has_more,
            next_offset: has_more.then_some(end),
        }
    }

    /// Change the display name. `None` if the session is unknown or owned by
    /// someone else.
    #[instrument(skip(self))]
    pub async fn rename_session(
        &self,
        session_key: &str,
        owner_id: &str,
        display_name: &str,
    ) -> Result<Option<SessionMetadata>, ServiceError> {
        if self.get_session(session_key, owner_id).is_none() {
            return Ok(None);
        }
        let (key, name) = (session_key.to_string(), display_name.to_string());
        self.with_store(move |store| store.update_display_name(&key, &name))
            .await
    }

    /// Close the connection and forget the session. `false` if the session is
    /// unknown or owned by someone else.
    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_key: &str, owner_id: &str) -> Result<bool, ServiceError> {
        if self.get_session(session_key, owner_id).is_none() {
            return Ok(false);
        }
        let evicted = self.pool.evict(session_key).await;
        let key = session_key.to_string();
        let removed = self.with_store(move |store| store.remove(&key)).await?;
        info!(session_key, evicted, "session deleted");
        Ok(removed)
    }

    /// Close every connection. Metadata stays on disk.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Run a store mutation on the blocking pool; each one writes and fsyncs.
    async fn with_store<T, F>(&self, op: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&MetadataStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || op(&store)).await??)
    }

    async fn begin_turn(&self, session_key: &str, prompt: &str) -> Result<ProviderEventStream, ServiceError> {
        let metadata = self
            .store
            .get(session_key)
            .ok_or_else(|| ServiceError::NotFound(session_key.to_string()))?;
        let handle = self
            .pool
            .get_or_create(session_key, &metadata.working_context, &metadata.owner_id, false)
            .await?;
        Ok(handle.run_turn(prompt).await?)
    }
}

/// Text carried by `event`, if any. A provider `Error` ends the turn.
fn consume_event(session_key: &str, event: ProviderEvent) -> Result<Option<String>, ServiceError> {
    match event {
        ProviderEvent::ContentDelta { text } => Ok(Some(text)),
        ProviderEvent::ToolUse { name, .. } => {
            debug!(session_key, tool = %name, "tool invoked");
            Ok(None)
        }
        ProviderEvent::ToolResult { .. } => {
            debug!(session_key, "tool result received");
            Ok(None)
        }
        ProviderEvent::Init { .. } => Ok(None),
        ProviderEvent::Error { message } => Err(ServiceError::Provider(message)),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tether_core::ConnectionState;

    use super::*;
    use crate::test_support::{FakeFactory, TurnScript};

    struct Fixture {
        dir: tempfile::TempDir,
        factory: Arc<FakeFactory>,
        service: SessionService,
    }

    fn fixture() -> Fixture {
        fixture_with(FakeFactory::new())
    }

    fn fixture_with(factory: FakeFactory) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("sessions.json")).unwrap();
        let factory = Arc::new(factory);
        let pool = SessionPool::new(
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            PoolConfig::default(),
        );
        Fixture {
            dir,
            factory,
            service: SessionService::new(pool, Arc::new(store)),
        }
    }

    async fn collect(stream: ChunkStream) -> Vec<StreamChunk> {
        stream.collect().await
    }

    // ── create ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_records_provider_key() {
        let fx = fixture();
        let meta = fx
            .service
            .create_session("alice", Path::new("/srv/app"), None)
            .await
            .unwrap();

        assert_eq!(meta.session_key, "sess-0");
        assert_eq!(meta.owner_id, "alice");
        assert_eq!(meta.display_name, "Session sess-0");
        assert!(fx.service.pool().contains("sess-0"));
        assert_eq!(fx.factory.requests()[0].resume_key, None);
    }

    #[tokio::test]
    async fn create_uses_given_display_name() {
        let fx = fixture();
        let meta = fx
            .service
            .create_session("alice", Path::new("/w"), Some("Refactor"))
            .await
            .unwrap();
        assert_eq!(meta.display_name, "Refactor");
    }

    #[tokio::test]
    async fn create_fails_after_shutdown() {
        let fx = fixture();
        fx.service.shutdown().await;
        let result = fx.service.create_session("alice", Path::new("/w"), None).await;
        assert_matches!(result, Err(ServiceError::Pool(_)));
        assert!(fx.service.store().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_metadata_write_evicts_connection() {
        let fx = fixture();
        std::fs::remove_dir_all(fx.dir.path()).unwrap();

        let result = fx.service.create_session("alice", Path::new("/w"), None).await;
        assert_matches!(result, Err(ServiceError::Storage(_)));
        assert!(fx.service.pool().is_empty());
        assert_eq!(fx.factory.connection("sess-0").unwrap().disconnects(), 1);
    }

    // ── query ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn query_collects_text_only() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();

        let reply = fx.service.query(&meta.session_key, "hello").await.unwrap();
        assert_eq!(reply.response, "echo: hello");
        assert_eq!(reply.session_key, meta.session_key);
        assert!(!reply.message_id.is_empty());
        assert_eq!(fx.factory.calls(), 1);
        assert_eq!(
            fx.factory.connection(&meta.session_key).unwrap().prompts(),
            vec!["hello".to_string()]
        );
    }

    #[tokio::test]
    async fn query_unknown_key_never_touches_factory() {
        let fx = fixture();
        let result = fx.service.query("ghost", "hi").await;
        assert_matches!(result, Err(ServiceError::NotFound(key)) if key == "ghost");
        assert_eq!(fx.factory.calls(), 0);
        assert!(fx.service.pool().is_empty());
    }

    #[tokio::test]
    async fn query_resumes_evicted_session() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();
        assert!(fx.service.pool().evict(&meta.session_key).await);

        let reply = fx.service.query(&meta.session_key, "again").await.unwrap();
        assert_eq!(reply.response, "echo: again");
        let requests = fx.factory.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].resume_key.as_deref(), Some(meta.session_key.as_str()));
    }

    #[tokio::test]
    async fn rekeyed_resume_is_reused_by_later_queries() {
        let fx = fixture_with(FakeFactory::new().rekeying());
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();
        assert!(fx.service.pool().evict(&meta.session_key).await);

        for _ in 0..3 {
            let _ = fx.service.query(&meta.session_key, "again").await.unwrap();
        }

        assert_eq!(fx.factory.calls(), 2);
        assert_eq!(fx.service.pool().session_keys(), vec![meta.session_key.clone()]);
    }

    #[tokio::test]
    async fn query_surfaces_provider_error() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();
        fx.factory
            .connection(&meta.session_key)
            .unwrap()
            .set_script(TurnScript::ProviderError("rate limited".into()));

        let result = fx.service.query(&meta.session_key, "hi").await;
        assert_matches!(result, Err(ServiceError::Provider(message)) if message == "rate limited");
    }

    #[tokio::test]
    async fn query_surfaces_transport_failure() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();
        fx.factory
            .connection(&meta.session_key)
            .unwrap()
            .set_script(TurnScript::TransportFailure);

        let result = fx.service.query(&meta.session_key, "hi").await;
        assert_matches!(result, Err(ServiceError::Provider(_)));
    }

    #[tokio::test]
    async fn query_replaces_broken_connection() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();
        fx.factory
            .connection(&meta.session_key)
            .unwrap()
            .set_state(ConnectionState::Disconnected);

        let reply = fx.service.query(&meta.session_key, "hi").await.unwrap();
        assert_eq!(reply.response, "echo: hi");
        assert_eq!(fx.factory.calls(), 2);
    }

    // ── stream_query ────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_has_start_deltas_complete() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();

        let chunks = collect(fx.service.stream_query(&meta.session_key, "hi")).await;
        let kinds: Vec<_> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChunkKind::Start, ChunkKind::Delta, ChunkKind::Delta, ChunkKind::Complete]
        );
        assert_eq!(chunks[3].content.as_deref(), Some("echo: hi"));
        assert!(chunks.iter().all(|c| c.message_id == chunks[0].message_id));
        assert!(chunks[3].is_terminal());
    }

    #[tokio::test]
    async fn stream_unknown_key_ends_with_error() {
        let fx = fixture();
        let chunks = collect(fx.service.stream_query("ghost", "hi")).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, ChunkKind::Start);
        assert_eq!(chunks[1].kind, ChunkKind::Error);
        assert_eq!(chunks[1].error.as_deref(), Some("Session not found: ghost"));
        assert_eq!(fx.factory.calls(), 0);
    }

    #[tokio::test]
    async fn stream_mid_turn_failure_is_terminal_error() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();
        fx.factory
            .connection(&meta.session_key)
            .unwrap()
            .set_script(TurnScript::TransportFailure);

        let chunks = collect(fx.service.stream_query(&meta.session_key, "hi")).await;
        let kinds: Vec<_> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChunkKind::Start, ChunkKind::Delta, ChunkKind::Error]);
        assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
    }

    #[test]
    fn chunk_serializes_kind_lowercase() {
        let chunk = StreamChunk::new("k", "m", ChunkKind::Delta).with_content("x".into());
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["kind"], "delta");
        assert_eq!(json["sessionKey"], "k");
        assert_eq!(json["messageId"], "m");
    }

    // ── metadata operations ─────────────────────────────────────────

    #[tokio::test]
    async fn get_session_checks_owner() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();
        assert!(fx.service.get_session(&meta.session_key, "alice").is_some());
        assert!(fx.service.get_session(&meta.session_key, "mallory").is_none());
        assert!(fx.service.get_session("ghost", "alice").is_none());
    }

    #[tokio::test]
    async fn list_sessions_pages() {
        let fx = fixture();
        for _ in 0..5 {
            let _ = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();
        }
        let _ = fx.service.create_session("bob", Path::new("/w"), None).await.unwrap();

        let first = fx.service.list_sessions("alice", 2, 0);
        assert_eq!(first.sessions.len(), 2);
        assert_eq!(first.total_count, 5);
        assert!(first.has_more);
        assert_eq!(first.next_offset, Some(2));

        let last = fx.service.list_sessions("alice", 2, 4);
        assert_eq!(last.sessions.len(), 1);
        assert!(!last.has_more);
        assert_eq!(last.next_offset, None);

        let clamped = fx.service.list_sessions("alice", 0, 0);
        assert_eq!(clamped.sessions.len(), 1);
    }

    #[tokio::test]
    async fn rename_requires_owner() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();

        let denied = fx.service.rename_session(&meta.session_key, "mallory", "x").await;
        assert!(denied.unwrap().is_none());
        let renamed = fx
            .service
            .rename_session(&meta.session_key, "alice", "Docs")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.display_name, "Docs");
        assert!(renamed.updated_at > meta.updated_at);
    }

    #[tokio::test]
    async fn delete_evicts_and_forgets() {
        let fx = fixture();
        let meta = fx.service.create_session("alice", Path::new("/w"), None).await.unwrap();

        assert!(!fx.service.delete_session(&meta.session_key, "mallory").await.unwrap());
        assert!(fx.service.pool().contains(&meta.session_key));

        assert!(fx.service.delete_session(&meta.session_key, "alice").await.unwrap());
        assert!(!fx.service.pool().contains(&meta.session_key));
        assert!(fx.service.store().get(&meta.session_key).is_none());
        assert_eq!(fx.factory.connection(&meta.session_key).unwrap().disconnects(), 1);

        assert!(!fx.service.delete_session(&meta.session_key, "alice").await.unwrap());
        assert_matches!(
            fx.service.query(&meta.session_key, "hi").await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn from_settings_opens_configured_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = TetherSettings::default();
        settings.store.path = dir.path().join("nested/sessions.json").to_string_lossy().into_owned();
        settings.pool.session_timeout_secs = 120;

        let service = SessionService::from_settings(
            Arc::new(FakeFactory::new()) as Arc<dyn ConnectionFactory>,
            &settings,
        )
        .unwrap();
        assert!(service.store().path().exists());
        assert_eq!(service.pool().config().session_timeout, Duration::from_secs(120));
    }
}
