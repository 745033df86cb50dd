//! Forced or lazy reconnection of a single session.

use std::path::Path;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::pool::SessionPool;

/// What [`reconnect`] did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconnectOutcome {
    /// The session was live and `force` was not set.
    AlreadyActive,
    /// A fresh connection was opened.
    #[serde(rename_all = "camelCase")]
    Recreated {
        /// Key the new entry is stored under.
        session_key: String,
    },
    /// The pool could not open a connection.
    Failed {
        /// Pool error.
        message: String,
    },
}

/// Result of a reconnection attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectReport {
    /// Session key requested.
    pub session_key: String,
    /// Whether a live entry was evicted first.
    pub evicted: bool,
    /// Outcome.
    #[serde(flatten)]
    pub outcome: ReconnectOutcome,
}

impl ReconnectReport {
    /// The session is live after the call.
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, ReconnectOutcome::Failed { .. })
    }
}

/// Re-establish the connection for `session_key`.
///
/// Without `force`, a live entry is left alone. With it, the entry is evicted
/// and the provider is asked to resume the session.
#[instrument(skip(pool, working_context), fields(working_context = %working_context.display()))]
pub async fn reconnect(
    pool: &SessionPool,
    session_key: &str,
    working_context: &Path,
    owner_id: &str,
    force: bool,
) -> ReconnectReport {
    let live = pool.contains(session_key);
    if live && !force {
        return ReconnectReport {
            session_key: session_key.to_string(),
            evicted: false,
            outcome: ReconnectOutcome::AlreadyActive,
        };
    }

    let evicted = live && pool.evict(session_key).await;
    let outcome = match pool
        .get_or_create(session_key, working_context, owner_id, false)
        .await
    {
        Ok(handle) => {
            info!(session_key = handle.session_key(), evicted, "session reconnected");
            ReconnectOutcome::Recreated {
                session_key: handle.session_key().to_string(),
            }
        }
        Err(error) => {
            warn!(session_key, %error, "reconnect failed");
            ReconnectOutcome::Failed {
                message: error.to_string(),
            }
        }
    };

    ReconnectReport {
        session_key: session_key.to_string(),
        evicted,
        outcome,
    }
}
