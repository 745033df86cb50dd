//! Session resource pool.
//!
//! [`SessionPool`] caches live provider connections by session key:
//!
//! - **get-or-create**: validated cache hit, or a factory call with bounded
//!   retry; concurrent callers for one cold key share a single factory call
//! - **evict**: remove first, then close with a bounded timeout
//! - **sweep**: a lazily spawned task retires entries idle past the session
//!   timeout
//! - **shutdown**: stop the sweep, close everything, refuse new work
//!
//! Entries live in a `DashMap`. Creation for a key is serialized by a per-key
//! async mutex, so different keys never wait on each other. No map lock is
//! ever held across an `await`.

mod config;
mod entry;
mod stats;
mod sweep;

pub use config::PoolConfig;
pub use entry::{PoolEntryInfo, SessionHandle};
pub use stats::PoolStats;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tether_core::{ConnectRequest, Connection, ConnectionFactory};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::errors::PoolError;
use crate::shutdown::{DEFAULT_DRAIN_TIMEOUT, ShutdownCoordinator};
use entry::PoolEntry;

/// In-memory registry of live provider connections.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    entries: DashMap<String, PoolEntry>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
    shutdown: ShutdownCoordinator,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("active", &self.inner.entries.len())
            .field("config", &self.inner.config)
            .field("shutting_down", &self.inner.shutdown.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    /// Create an empty pool. The sweep task starts with the first entry.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                entries: DashMap::new(),
                creation_locks: DashMap::new(),
                shutdown: ShutdownCoordinator::new(),
                sweeper: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether a connection is healthy enough to hand out.
    ///
    /// Only a `Connected` state passes; `Unknown` is treated as broken.
    pub fn validate(connection: &dyn Connection) -> bool {
        connection.state().is_connected()
    }

    /// Return a validated handle for `session_key`, creating the connection
    /// if needed.
    ///
    /// With `is_new`, `session_key` is provisional: no lookup happens and the
    /// new entry is stored under the key the provider assigns. Otherwise a
    /// missing entry is created by asking the factory to resume `session_key`
    /// and is stored under `session_key` whatever key the provider reports.
    #[instrument(skip(self, working_context), fields(working_context = %working_context.display()))]
    pub async fn get_or_create(
        &self,
        session_key: &str,
        working_context: &Path,
        owner_id: &str,
        is_new: bool,
    ) -> Result<SessionHandle, PoolError> {
        let inner = &self.inner;
        if inner.shutdown.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        if is_new {
            return self.create(session_key, working_context, owner_id, None).await;
        }

        if let Some(handle) = inner.lookup(session_key).await {
            return Ok(handle);
        }

        let lock = inner.creation_lock(session_key);
        let result = {
            let _creating = lock.lock().await;
            if inner.shutdown.is_shutting_down() {
                Err(PoolError::ShuttingDown)
            } else if let Some(handle) = inner.lookup(session_key).await {
                Ok(handle)
            } else {
                self.create(session_key, working_context, owner_id, Some(session_key))
                    .await
            }
        };
        drop(lock);
        inner.release_creation_lock(session_key);
        result
    }

    /// Remove `session_key` and close its connection.
    ///
    /// Returns `false` if there was no entry. Close failures are logged and
    /// do not undo the removal.
    #[instrument(skip(self))]
    pub async fn evict(&self, session_key: &str) -> bool {
        self.inner.evict(session_key).await
    }

    /// Run one sweep pass now and return the evicted keys.
    pub async fn sweep_now(&self) -> Vec<String> {
        self.inner.sweep().await
    }

    /// Stop the sweep, close every connection, and refuse further work.
    ///
    /// Only the first call does anything.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.shutdown.begin() {
            debug!("session pool already shut down");
            return;
        }

        let sweeper = inner.sweeper.lock().take();
        inner
            .shutdown
            .drain(sweeper.into_iter().collect(), DEFAULT_DRAIN_TIMEOUT)
            .await;

        let keys: Vec<String> = inner.entries.iter().map(|e| e.key().clone()).collect();
        let closed = futures::future::join_all(keys.iter().map(|key| inner.evict(key)))
            .await
            .into_iter()
            .filter(|evicted| *evicted)
            .count();
        info!(closed, "session pool shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the pool has no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether `session_key` has an entry.
    pub fn contains(&self, session_key: &str) -> bool {
        self.inner.entries.contains_key(session_key)
    }

    /// Owner of the entry for `session_key`.
    pub fn owner_of(&self, session_key: &str) -> Option<String> {
        self.inner
            .entries
            .get(session_key)
            .map(|e| e.owner_id.clone())
    }

    /// Keys of all live entries, sorted.
    pub fn session_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Snapshots of all live entries, sorted by key.
    pub fn entries(&self) -> Vec<PoolEntryInfo> {
        let now = Instant::now();
        let mut infos: Vec<PoolEntryInfo> = self.inner.entries.iter().map(|e| e.info(now)).collect();
        infos.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        infos
    }

    /// Point-in-time statistics.
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let now = Instant::now();
        let near_threshold = inner.config.near_timeout_threshold();

        let mut ages = Vec::with_capacity(inner.entries.len());
        let mut sessions_by_owner: BTreeMap<String, usize> = BTreeMap::new();
        let mut near_timeout = 0;
        for entry in &inner.entries {
            ages.push(now.saturating_duration_since(entry.created_at).as_secs_f64());
            *sessions_by_owner.entry(entry.owner_id.clone()).or_default() += 1;
            if entry.idle_at(now) > near_threshold {
                near_timeout += 1;
            }
        }

        PoolStats {
            active_sessions: ages.len(),
            oldest_age_secs: ages.iter().copied().reduce(f64::max),
            newest_age_secs: ages.iter().copied().reduce(f64::min),
            average_age_secs: (!ages.is_empty())
                .then(|| ages.iter().sum::<f64>() / ages.len() as f64),
            sessions_by_owner,
            near_timeout,
            sweeper_running: inner.sweeper_running(),
            session_timeout_secs: inner.config.session_timeout.as_secs(),
            cleanup_interval_secs: inner.config.cleanup_interval.as_secs(),
        }
    }

    async fn create(
        &self,
        requested_key: &str,
        working_context: &Path,
        owner_id: &str,
        resume_key: Option<&str>,
    ) -> Result<SessionHandle, PoolError> {
        let inner = &self.inner;
        let request = ConnectRequest {
            working_context: working_context.to_path_buf(),
            resume_key: resume_key.map(str::to_string),
        };
        let connection = inner.connect_with_retry(requested_key, &request).await?;
        let provider_key = connection.session_key();
        // A resumed entry stays under the key callers look it up by.
        let session_key = match resume_key {
            Some(key) => key.to_string(),
            None => provider_key.clone().unwrap_or_else(|| requested_key.to_string()),
        };

        if inner.shutdown.is_shutting_down() {
            debug!(session_key, "connection created during shutdown, closing it");
            inner.close(&session_key, connection).await;
            return Err(PoolError::ShuttingDown);
        }
        if let Some(provider_key) = provider_key.filter(|k| resume_key.is_some_and(|r| r != k.as_str())) {
            warn!(
                session_key,
                provider_key, "provider resumed under a different session key"
            );
        }

        let entry = PoolEntry::new(
            session_key.clone(),
            connection,
            working_context.to_path_buf(),
            owner_id.to_string(),
        );
        let handle = entry.handle();
        if let Some(replaced) = inner.entries.insert(session_key.clone(), entry) {
            warn!(session_key, "replaced existing pool entry");
            inner.close(&session_key, replaced.connection).await;
        }

        // Lost the race with shutdown's drain snapshot.
        if inner.shutdown.is_shutting_down() {
            let _ = inner.evict(&session_key).await;
            return Err(PoolError::ShuttingDown);
        }

        self.ensure_sweeper();
        info!(
            session_key,
            owner_id,
            active = inner.entries.len(),
            "pooled new connection"
        );
        Ok(handle)
    }

    fn ensure_sweeper(&self) {
        let inner = &self.inner;
        let mut sweeper = inner.sweeper.lock();
        if inner.shutdown.is_shutting_down() || sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *sweeper = Some(tokio::spawn(sweep::run(
            Arc::downgrade(&self.inner),
            inner.shutdown.token(),
            inner.config.cleanup_interval,
        )));
    }
}

impl PoolInner {
    /// Validated cache lookup. A broken entry is evicted and reported as a
    /// miss.
    async fn lookup(&self, session_key: &str) -> Option<SessionHandle> {
        {
            let mut entry = self.entries.get_mut(session_key)?;
            if SessionPool::validate(entry.connection.as_ref()) {
                entry.touch();
                return Some(entry.handle());
            }
        }

        warn!(session_key, "pooled connection failed validation, recreating");
        // Only remove the entry we judged broken, not a healthy replacement.
        if let Some((key, entry)) = self
            .entries
            .remove_if(session_key, |_, e| !SessionPool::validate(e.connection.as_ref()))
        {
            self.close(&key, entry.connection).await;
        }
        None
    }

    async fn connect_with_retry(
        &self,
        requested_key: &str,
        request: &ConnectRequest,
    ) -> Result<Arc<dyn Connection>, PoolError> {
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.factory.create(request).await {
                Ok(connection) => return Ok(connection),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = retry.delay_for(attempt - 1);
                    warn!(
                        session_key = requested_key,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "connection attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => return Err(PoolError::ShuttingDown),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    warn!(
                        session_key = requested_key,
                        attempt,
                        category = error.category(),
                        %error,
                        "connection creation failed"
                    );
                    return Err(PoolError::CreationFailed {
                        session_key: requested_key.to_string(),
                        attempts: attempt,
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    async fn evict(&self, session_key: &str) -> bool {
        let Some((key, entry)) = self.entries.remove(session_key) else {
            return false;
        };
        debug!(session_key = %key, "evicted session");
        self.close(&key, entry.connection).await;
        true
    }

    /// Candidates come from a snapshot, visited in key order; each removal
    /// re-checks idleness against the live entry so a concurrent touch wins.
    async fn sweep(&self) -> Vec<String> {
        let timeout = self.config.session_timeout;
        let now = Instant::now();
        let mut candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.idle_at(now) > timeout)
            .map(|e| e.key().clone())
            .collect();
        candidates.sort();

        let mut evicted = Vec::with_capacity(candidates.len());
        for key in candidates {
            let removed = self
                .entries
                .remove_if(&key, |_, e| e.idle_at(Instant::now()) > timeout);
            if let Some((key, entry)) = removed {
                info!(
                    session_key = %key,
                    owner_id = %entry.owner_id,
                    idle_secs = entry.idle_at(Instant::now()).as_secs(),
                    "evicting idle session"
                );
                self.close(&key, entry.connection).await;
                evicted.push(key);
            }
        }
        evicted
    }

    /// Best-effort close, bounded by the close timeout.
    async fn close(&self, session_key: &str, connection: Arc<dyn Connection>) {
        let timeout = self.config.close_timeout;
        match tokio::time::timeout(timeout, connection.disconnect()).await {
            Ok(Ok(())) => debug!(session_key, "connection closed"),
            Ok(Err(error)) => warn!(session_key, %error, "connection close failed"),
            Err(_) => warn!(
                session_key,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "connection close timed out"
            ),
        }
    }

    fn creation_lock(&self, session_key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.creation_locks
                .entry(session_key.to_string())
                .or_default()
                .value(),
        )
    }

    fn release_creation_lock(&self, session_key: &str) {
        let _ = self
            .creation_locks
            .remove_if(session_key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.token().cancel();
    }
}
