//! Health reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_settings::HealthSettings;
use tether_store::{MetadataStore, StoreStats};

use crate::pool::{PoolStats, SessionPool};

/// Limits above which the report raises an issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Active pool entries.
    pub max_active_sessions: usize,
    /// Entries near timeout.
    pub max_near_timeout: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthThresholds {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            max_active_sessions: settings.max_active_sessions,
            max_near_timeout: settings.max_near_timeout,
        }
    }
}

/// Overall severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No issues.
    Healthy,
    /// One or two issues.
    Warning,
    /// Three or more issues.
    Critical,
}

impl HealthStatus {
    fn from_issue_count(count: usize) -> Self {
        match count {
            0 => Self::Healthy,
            1 | 2 => Self::Warning,
            _ => Self::Critical,
        }
    }
}

/// A detected problem and what to do about it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    /// Stable identifier.
    pub code: &'static str,
    /// Description.
    pub message: String,
    /// Suggested remedy.
    pub recommendation: String,
}

/// Combined pool and store health.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Severity derived from the number of issues.
    pub status: HealthStatus,
    /// Detected problems.
    pub issues: Vec<HealthIssue>,
    /// Pool statistics the report is based on.
    pub pool: PoolStats,
    /// Store statistics the report is based on.
    pub store: StoreStats,
    /// When the report was generated.
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    /// Recommendations of all issues, in order.
    pub fn recommendations(&self) -> Vec<&str> {
        self.issues.iter().map(|i| i.recommendation.as_str()).collect()
    }
}

/// Assess pool and store health.
///
/// A stopped sweep only counts as an issue while the pool holds entries and
/// is not shutting down, since the sweep starts with the first entry.
pub fn health_report(pool: &SessionPool, store: &MetadataStore, thresholds: HealthThresholds) -> HealthReport {
    let pool_stats = pool.stats();
    let store_stats = store.stats();
    let mut issues = Vec::new();

    if !pool_stats.sweeper_running && pool_stats.active_sessions > 0 && !pool.is_shutting_down() {
        issues.push(HealthIssue {
            code: "sweep_not_running",
            message: "Sweep task not running; idle sessions will not be evicted".to_string(),
            recommendation: "Restart the session pool or check logs for sweep task failures"
                .to_string(),
        });
    }

    if pool_stats.active_sessions > thresholds.max_active_sessions {
        issues.push(HealthIssue {
            code: "too_many_active_sessions",
            message: format!(
                "High number of active sessions ({}), potential memory concern",
                pool_stats.active_sessions
            ),
            recommendation: "Consider reducing the session timeout or investigate session leaks"
                .to_string(),
        });
    }

    if pool_stats.near_timeout > thresholds.max_near_timeout {
        issues.push(HealthIssue {
            code: "many_near_timeout",
            message: format!(
                "{} sessions approaching timeout, possible client inactivity",
                pool_stats.near_timeout
            ),
            recommendation: "Review the session timeout configuration and client usage patterns"
                .to_string(),
        });
    }

    HealthReport {
        status: HealthStatus::from_issue_count(issues.len()),
        issues,
        pool: pool_stats,
        store: store_stats,
        generated_at: Utc::now(),
    }
}
