//! Graceful shutdown coordination via `CancellationToken`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default upper bound on waiting for background tasks to stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates shutdown of the pool's background tasks.
///
/// `begin` flips the coordinator exactly once; every clone of
/// [`token`](Self::token) observes the cancellation.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown. Returns `true` only for the call that started it.
    pub fn begin(&self) -> bool {
        let first = !self.started.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Resolves once shutdown begins.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Wait up to `timeout` for `handles` to finish, aborting stragglers.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, timeout: Duration) {
        if handles.is_empty() {
            return;
        }
        info!(
            task_count = handles.len(),
            timeout_ms = timeout.as_millis(),
            "waiting for background tasks to stop"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
