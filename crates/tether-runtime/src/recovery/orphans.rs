//! Pool/store reconciliation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_store::MetadataStore;
use tracing::{info, instrument, warn};

use crate::pool::SessionPool;

/// A cleanup step taken by [`reconcile_orphans`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "sessionKey", rename_all = "snake_case")]
pub enum OrphanAction {
    /// Pool entry without metadata was evicted.
    EvictedFromPool(String),
    /// Metadata without a pool entry was deleted.
    RemovedFromStore(String),
}

/// Result of a reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    /// Keys live in the pool but absent from the store, sorted.
    pub pool_only: Vec<String>,
    /// Keys in the store but not live in the pool, sorted.
    pub store_only: Vec<String>,
    /// Cleanup performed (empty on a dry run).
    pub actions: Vec<OrphanAction>,
    /// Cleanup failures.
    pub errors: Vec<String>,
    /// Nothing was changed.
    pub dry_run: bool,
    /// When the pass ran.
    pub checked_at: DateTime<Utc>,
}

/// Compare pool keys with store keys and, unless `dry_run`, remove the
/// orphans on each side.
#[instrument(skip(pool, store))]
pub async fn reconcile_orphans(pool: &SessionPool, store: &MetadataStore, dry_run: bool) -> OrphanReport {
    let pool_keys: HashSet<String> = pool.session_keys().into_iter().collect();
    let store_keys = store.keys();

    let mut pool_only: Vec<String> = pool_keys.difference(&store_keys).cloned().collect();
    let mut store_only: Vec<String> = store_keys.difference(&pool_keys).cloned().collect();
    pool_only.sort();
    store_only.sort();

    let mut actions = Vec::new();
    let mut errors = Vec::new();
    if !dry_run {
        for key in &pool_only {
            if pool.evict(key).await {
                actions.push(OrphanAction::EvictedFromPool(key.clone()));
            }
        }
        for key in &store_only {
            match store.remove(key) {
                Ok(_) => actions.push(OrphanAction::RemovedFromStore(key.clone())),
                Err(error) => {
                    warn!(session_key = %key, %error, "failed to remove orphaned metadata");
                    errors.push(format!("failed to remove {key} from store: {error}"));
                }
            }
        }
    }

    info!(
        dry_run,
        pool_only = pool_only.len(),
        store_only = store_only.len(),
        cleaned = actions.len(),
        "orphan reconciliation completed"
    );

    OrphanReport {
        pool_only,
        store_only,
        actions,
        errors,
        dry_run,
        checked_at: Utc::now(),
    }
}
