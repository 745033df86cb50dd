//! Pool timing configuration.

use std::time::Duration;

use tether_core::RetryConfig;
use tether_settings::TetherSettings;

/// Timing and retry knobs of a [`SessionPool`](super::SessionPool).
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Idle time after which an entry is evicted by the sweep.
    pub session_timeout: Duration,
    /// Interval between sweeps.
    pub cleanup_interval: Duration,
    /// Upper bound on a single connection close.
    pub close_timeout: Duration,
    /// Idle fraction of `session_timeout` counted as "near timeout".
    pub near_timeout_fraction: f64,
    /// Backoff for retryable factory failures.
    pub retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            close_timeout: Duration::from_secs(5),
            near_timeout_fraction: 0.8,
            retry: RetryConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Idle duration above which an entry is reported as near timeout.
    pub fn near_timeout_threshold(&self) -> Duration {
        self.session_timeout
            .mul_f64(self.near_timeout_fraction.clamp(0.0, 1.0))
    }
}

impl From<&TetherSettings> for PoolConfig {
    fn from(settings: &TetherSettings) -> Self {
        Self {
            session_timeout: Duration::from_secs(settings.pool.session_timeout_secs),
            cleanup_interval: Duration::from_secs(settings.pool.cleanup_interval_secs),
            close_timeout: Duration::from_millis(settings.pool.close_timeout_ms),
            near_timeout_fraction: settings.pool.near_timeout_fraction,
            retry: settings.retry.clone(),
        }
    }
}
