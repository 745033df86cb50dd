//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may contain any subset of fields. Each section
//! implements [`Default`] with production values.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tether_core::RetryConfig;
use tether_core::logging::LogFormat;

use crate::loader::expand_home;

/// Root settings type.
///
/// ```json
/// {
///   "pool": { "sessionTimeoutSecs": 1800 },
///   "store": { "path": "~/.tether/sessions.json" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Session pool timing.
    pub pool: PoolSettings,
    /// Backoff for connection creation.
    pub retry: RetryConfig,
    /// Durable metadata store.
    pub store: StoreSettings,
    /// Health report thresholds.
    pub health: HealthSettings,
    /// Provider locations.
    pub provider: ProviderSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Session pool timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Idle time after which a pooled connection is evicted.
    pub session_timeout_secs: u64,
    /// Interval between sweeps.
    pub cleanup_interval_secs: u64,
    /// Upper bound on a single connection close.
    pub close_timeout_ms: u64,
    /// Fraction of the session timeout after which an idle entry counts as
    /// "near timeout" in stats.
    pub near_timeout_fraction: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            session_timeout_secs: 3600,
            cleanup_interval_secs: 300,
            close_timeout_ms: 5000,
            near_timeout_fraction: 0.8,
        }
    }
}

/// Durable metadata store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Metadata file. A leading `~/` expands to the home directory.
    pub path: String,
    /// Age after which metadata is dropped by cleanup.
    pub max_age_days: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "~/.tether/sessions.json".to_string(),
            max_age_days: 30,
        }
    }
}

impl StoreSettings {
    /// Metadata file with `~/` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// Health report thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSettings {
    /// Active pool entries above which a warning is raised.
    pub max_active_sessions: usize,
    /// Near-timeout entries above which a warning is raised.
    pub max_near_timeout: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            max_active_sessions: 50,
            max_near_timeout: 10,
        }
    }
}

/// Where the provider keeps its state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Root directory of provider transcripts.
    pub transcripts_root: String,
    /// Working context used when a caller supplies none.
    pub default_working_context: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            transcripts_root: "~/.claude/projects".to_string(),
            default_working_context: None,
        }
    }
}

impl ProviderSettings {
    /// Transcripts root with `~/` expanded.
    pub fn resolved_transcripts_root(&self) -> PathBuf {
        expand_home(&self.transcripts_root)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingSettings {
    /// Install the global subscriber with this level and format.
    pub fn init_subscriber(&self) {
        tether_core::logging::init_subscriber(&self.level, self.format);
    }
}
