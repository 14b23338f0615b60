//! Process configuration, read from environment variables.
//!
//! Every knob has a default; an unparsable value falls back to the default
//! with a warning instead of aborting start-up.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::jobs::BackoffPolicy;

/// Worker-system settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Postgres connection string (`DATABASE_URL`).
    pub database_url: Option<String>,
    /// Use Postgres instead of the in-memory store (`USE_PERSISTENT_STORES`).
    pub use_persistent_stores: bool,
    /// Create the job tables at start-up (`MAILLEDGER_APPLY_SCHEMA`).
    pub apply_schema: bool,
    /// Consecutive failed cycles after which a worker stops itself.
    pub max_consecutive_errors: u32,
    /// A worker without a heartbeat for this long is unhealthy.
    pub health_timeout: Duration,
    pub monitor_interval: Duration,
    /// Bounded wait for a worker being replaced by the monitor.
    pub restart_join_timeout: Duration,
    /// Bounded wait per worker during shutdown.
    pub stop_timeout: Duration,
    pub backoff_cap: Duration,
    /// Run deadline stamped on claimed records and entries.
    pub job_timeout: Duration,
    /// Records a detector enqueues per cycle at most.
    pub detector_batch_limit: usize,
    /// Priority of entries created by detectors.
    pub enqueue_priority: i32,
    pub max_attempts: u32,
    pub import_detector_interval: Duration,
    pub import_worker_interval: Duration,
    pub parsing_detector_interval: Duration,
    pub parsing_worker_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            use_persistent_stores: false,
            apply_schema: false,
            max_consecutive_errors: 10,
            health_timeout: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(30),
            restart_join_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(120 * 60),
            job_timeout: Duration::from_secs(30 * 60),
            detector_batch_limit: 100,
            enqueue_priority: 1,
            max_attempts: 3,
            import_detector_interval: Duration::from_secs(30),
            import_worker_interval: Duration::from_secs(2),
            parsing_detector_interval: Duration::from_secs(15),
            parsing_worker_interval: Duration::from_secs(1),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };
        let mins = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_secs() / 60)
                .map_or(default, |m| Duration::from_secs(m.saturating_mul(60)))
        };

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            use_persistent_stores: parse_or(&lookup, "USE_PERSISTENT_STORES", false)
                .unwrap_or(false),
            apply_schema: parse_or(&lookup, "MAILLEDGER_APPLY_SCHEMA", false).unwrap_or(false),
            max_consecutive_errors: parse_or(
                &lookup,
                "MAILLEDGER_MAX_CONSECUTIVE_ERRORS",
                defaults.max_consecutive_errors,
            )
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_consecutive_errors),
            health_timeout: secs("MAILLEDGER_HEALTH_TIMEOUT_SECS", defaults.health_timeout),
            monitor_interval: secs("MAILLEDGER_MONITOR_INTERVAL_SECS", defaults.monitor_interval),
            restart_join_timeout: secs(
                "MAILLEDGER_RESTART_JOIN_TIMEOUT_SECS",
                defaults.restart_join_timeout,
            ),
            stop_timeout: secs("MAILLEDGER_STOP_TIMEOUT_SECS", defaults.stop_timeout),
            backoff_cap: mins("MAILLEDGER_BACKOFF_CAP_MINUTES", defaults.backoff_cap),
            job_timeout: mins("MAILLEDGER_JOB_TIMEOUT_MINUTES", defaults.job_timeout),
            detector_batch_limit: parse_or(
                &lookup,
                "MAILLEDGER_DETECTOR_BATCH_LIMIT",
                defaults.detector_batch_limit,
            )
            .unwrap_or(defaults.detector_batch_limit),
            enqueue_priority: parse_or(&lookup, "MAILLEDGER_ENQUEUE_PRIORITY", defaults.enqueue_priority)
                .unwrap_or(defaults.enqueue_priority),
            max_attempts: parse_or(&lookup, "MAILLEDGER_MAX_ATTEMPTS", defaults.max_attempts)
                .unwrap_or(defaults.max_attempts),
            import_detector_interval: secs(
                "MAILLEDGER_IMPORT_DETECTOR_INTERVAL_SECS",
                defaults.import_detector_interval,
            ),
            import_worker_interval: secs(
                "MAILLEDGER_IMPORT_WORKER_INTERVAL_SECS",
                defaults.import_worker_interval,
            ),
            parsing_detector_interval: secs(
                "MAILLEDGER_PARSING_DETECTOR_INTERVAL_SECS",
                defaults.parsing_detector_interval,
            ),
            parsing_worker_interval: secs(
                "MAILLEDGER_PARSING_WORKER_INTERVAL_SECS",
                defaults.parsing_worker_interval,
            ),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::with_cap(self.backoff_cap)
    }
}

/// Parse `key` if set. `None` means "use the default": unset, or invalid (warned).
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Option<T>
where
    T: FromStr + std::fmt::Debug,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, default = ?default, "invalid setting; using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Settings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(settings_from(&[]), Settings::default());
    }

    #[test]
    fn overrides_are_applied() {
        let settings = settings_from(&[
            ("DATABASE_URL", "postgres://localhost/mail"),
            ("USE_PERSISTENT_STORES", "true"),
            ("MAILLEDGER_HEALTH_TIMEOUT_SECS", "90"),
            ("MAILLEDGER_BACKOFF_CAP_MINUTES", "30"),
            ("MAILLEDGER_PARSING_WORKER_INTERVAL_SECS", "5"),
        ]);

        assert_eq!(settings.database_url.as_deref(), Some("postgres://localhost/mail"));
        assert!(settings.use_persistent_stores);
        assert_eq!(settings.health_timeout, Duration::from_secs(90));
        assert_eq!(settings.backoff().cap, Duration::from_secs(30 * 60));
        assert_eq!(settings.parsing_worker_interval, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let settings = settings_from(&[
            ("MAILLEDGER_MAX_CONSECUTIVE_ERRORS", "0"),
            ("MAILLEDGER_MONITOR_INTERVAL_SECS", "soon"),
            ("USE_PERSISTENT_STORES", "yes"),
            ("DATABASE_URL", ""),
        ]);

        assert_eq!(settings.max_consecutive_errors, 10);
        assert_eq!(settings.monitor_interval, Duration::from_secs(30));
        assert!(!settings.use_persistent_stores);
        assert_eq!(settings.database_url, None);
    }
}
