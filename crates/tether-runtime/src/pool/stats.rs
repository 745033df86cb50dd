//! Pool statistics.

use std::collections::BTreeMap;

use serde::Serialize;

/// Point-in-time summary of the pool.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Live entries.
    pub active_sessions: usize,
    /// Age of the oldest entry, in seconds.
    pub oldest_age_secs: Option<f64>,
    /// Age of the newest entry, in seconds.
    pub newest_age_secs: Option<f64>,
    /// Mean entry age, in seconds.
    pub average_age_secs: Option<f64>,
    /// Live entries per owner.
    pub sessions_by_owner: BTreeMap<String, usize>,
    /// Entries idle longer than the near-timeout threshold.
    pub near_timeout: usize,
    /// Whether the sweep task is alive.
    pub sweeper_running: bool,
    /// Configured idle timeout, in seconds.
    pub session_timeout_secs: u64,
    /// Configured sweep interval, in seconds.
    pub cleanup_interval_secs: u64,
}
