//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If `~/.tether/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tether_core::logging::LogFormat;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::TetherSettings;

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Expand a leading `~/` (or a bare `~`) to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        home_dir()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    home_dir().join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. Invalid JSON or values that
/// fail [`validate`] are errors.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Upper bound for `store.maxAgeDays`.
pub const MAX_STORE_AGE_DAYS: u32 = 3650;

/// Check constraints that span fields.
pub fn validate(settings: &TetherSettings) -> Result<()> {
    let pool = &settings.pool;
    if pool.session_timeout_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "pool.sessionTimeoutSecs must be positive".to_string(),
        ));
    }
    if pool.cleanup_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "pool.cleanupIntervalSecs must be positive".to_string(),
        ));
    }
    if !(pool.near_timeout_fraction > 0.0 && pool.near_timeout_fraction <= 1.0) {
        return Err(SettingsError::InvalidValue(format!(
            "pool.nearTimeoutFraction must be in (0, 1], got {}",
            pool.near_timeout_fraction
        )));
    }
    if !(1..=MAX_STORE_AGE_DAYS).contains(&settings.store.max_age_days) {
        return Err(SettingsError::InvalidValue(format!(
            "store.maxAgeDays must be in [1, {MAX_STORE_AGE_DAYS}], got {}",
            settings.store.max_age_days
        )));
    }
    if !(0.0..=1.0).contains(&settings.retry.jitter_factor) {
        return Err(SettingsError::InvalidValue(format!(
            "retry.jitterFactor must be in [0, 1], got {}",
            settings.retry.jitter_factor
        )));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within the documented range; invalid values
/// are ignored with a warning (falling back to file/default).
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// [`apply_env_overrides`] against an arbitrary variable source.
pub fn apply_overrides_from<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Pool ────────────────────────────────────────────────────────
    if let Some(v) = env.u64("TETHER_SESSION_TIMEOUT_SECS", 1, 604_800) {
        settings.pool.session_timeout_secs = v;
    }
    if let Some(v) = env.u64("TETHER_CLEANUP_INTERVAL_SECS", 1, 86_400) {
        settings.pool.cleanup_interval_secs = v;
    }
    if let Some(v) = env.u64("TETHER_CLOSE_TIMEOUT_MS", 100, 120_000) {
        settings.pool.close_timeout_ms = v;
    }

    // ── Retry ───────────────────────────────────────────────────────
    if let Some(v) = env.u64("TETHER_MAX_RETRIES", 0, 10) {
        settings.retry.max_retries = u32::try_from(v).unwrap_or(settings.retry.max_retries);
    }
    if let Some(v) = env.u64("TETHER_RETRY_BASE_DELAY_MS", 1, 60_000) {
        settings.retry.base_delay_ms = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_STORE_PATH") {
        settings.store.path = v;
    }
    if let Some(v) = env.u64("TETHER_STORE_MAX_AGE_DAYS", 1, u64::from(MAX_STORE_AGE_DAYS)) {
        settings.store.max_age_days = u32::try_from(v).unwrap_or(settings.store.max_age_days);
    }

    // ── Health ──────────────────────────────────────────────────────
    if let Some(v) = env.usize("TETHER_MAX_ACTIVE_SESSIONS", 1, 100_000) {
        settings.health.max_active_sessions = v;
    }

    // ── Provider ────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_TRANSCRIPTS_ROOT") {
        settings.provider.transcripts_root = v;
    }
    if let Some(v) = env.string("TETHER_WORKING_CONTEXT") {
        settings.provider.default_working_context = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("TETHER_LOG_FORMAT") {
        match LogFormat::parse(&v) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "TETHER_LOG_FORMAT", value = %v, "invalid log format env var, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers (thin wrappers) ────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"pool": {"sessionTimeoutSecs": 3600, "cleanupIntervalSecs": 300}});
        let source = serde_json::json!({"pool": {"sessionTimeoutSecs": 60}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["pool"]["sessionTimeoutSecs"], 60);
        assert_eq!(merged["pool"]["cleanupIntervalSecs"], 300);
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.pool, TetherSettings::default().pool);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"pool": {"sessionTimeoutSecs": 60}, "retry": {"maxRetries": 5}, "logging": {"format": "json"}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.pool.session_timeout_secs, 60);
        assert_eq!(settings.pool.cleanup_interval_secs, 300);
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.base_delay_ms, 500);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert_matches!(load_settings_from_path(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"pool": {"cleanupIntervalSecs": 0}}"#).unwrap();
        assert_matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("cleanupIntervalSecs")
        );
    }

    #[test]
    fn validate_rejects_bad_fraction() {
        let mut settings = TetherSettings::default();
        settings.pool.near_timeout_fraction = 1.5;
        assert_matches!(validate(&settings), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_bounds_store_max_age() {
        let mut settings = TetherSettings::default();
        settings.store.max_age_days = 0;
        assert_matches!(
            validate(&settings),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("maxAgeDays")
        );
        settings.store.max_age_days = MAX_STORE_AGE_DAYS;
        assert_matches!(validate(&settings), Ok(()));
    }

    #[test]
    fn load_rejects_oversized_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"store": {"maxAgeDays": 4294967295}}"#).unwrap();
        assert_matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("maxAgeDays")
        );
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_valid_values() {
        let mut settings = TetherSettings::default();
        apply_overrides_from(
            &mut settings,
            vars(&[
                ("TETHER_SESSION_TIMEOUT_SECS", "120"),
                ("TETHER_MAX_RETRIES", "0"),
                ("TETHER_STORE_PATH", "/var/lib/tether/sessions.json"),
                ("TETHER_LOG_FORMAT", "JSON"),
                ("TETHER_WORKING_CONTEXT", "/srv/app"),
            ]),
        );
        assert_eq!(settings.pool.session_timeout_secs, 120);
        assert_eq!(settings.retry.max_retries, 0);
        assert_eq!(settings.store.path, "/var/lib/tether/sessions.json");
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(
            settings.provider.default_working_context.as_deref(),
            Some("/srv/app")
        );
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut settings = TetherSettings::default();
        apply_overrides_from(
            &mut settings,
            vars(&[
                ("TETHER_SESSION_TIMEOUT_SECS", "0"),
                ("TETHER_CLEANUP_INTERVAL_SECS", "soon"),
                ("TETHER_LOG_FORMAT", "xml"),
                ("TETHER_STORE_PATH", ""),
            ]),
        );
        assert_eq!(settings, TetherSettings::default());
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("300", 1, 86_400), Some(300));
        assert_eq!(parse_u64_range("0", 1, 86_400), None);
        assert_eq!(parse_u64_range("90000", 1, 86_400), None);
        assert_eq!(parse_u64_range("abc", 1, 86_400), None);
    }

    #[test]
    fn parse_usize_bounds() {
        assert_eq!(parse_usize_range("50", 1, 10_000), Some(50));
        assert_eq!(parse_usize_range("0", 1, 10_000), None);
    }

    #[test]
    fn expand_home_prefix() {
        let home = home_dir();
        assert_eq!(expand_home("~/x/y.json"), home.join("x/y.json"));
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_home("rel/~/path"), PathBuf::from("rel/~/path"));
    }
}
