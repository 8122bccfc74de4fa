//! Configuration - environment-based with code-level overrides.
//!
//! Every knob has a default that works for a local SQLite file, so
//! `Config::from_env()` with an empty environment yields a usable instance.
//!
//! | Env var | Default | Meaning |
//! |---|---|---|
//! | `DURABLY_DATABASE_PATH` | `durably.db` | SQLite database file |
//! | `DURABLY_POLLING_INTERVAL_MS` | `1000` | worker idle poll interval |
//! | `DURABLY_HEARTBEAT_INTERVAL_MS` | `5000` | liveness write interval |
//! | `DURABLY_STALE_THRESHOLD_MS` | `30000` | reap threshold (>= 3x heartbeat) |
//! | `DURABLY_EVENT_CAPACITY` | `1024` | event bus ring buffer size |
//! | `DURABLY_BASE_PATH` | (empty) | prefix for all HTTP routes |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the SQLite database file backing the store.
    pub database_path: PathBuf,

    /// How long the worker sleeps between polls when no run is claimable.
    pub polling_interval: Duration,

    /// Interval between `heartbeat_at` writes for a claimed run.
    pub heartbeat_interval: Duration,

    /// A `running` run whose heartbeat is older than this is considered
    /// abandoned and reset to `pending`. Must be at least three heartbeat
    /// intervals so a single missed write never triggers a reap.
    pub stale_threshold: Duration,

    /// Capacity of the in-process event bus; subscribers slower than this
    /// many events behind start dropping oldest events.
    pub event_capacity: usize,

    /// Optional prefix for all HTTP routes, e.g. `/durably`.
    pub base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("durably.db"),
            polling_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(5000),
            stale_threshold: Duration::from_millis(30000),
            event_capacity: 1024,
            base_path: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from `DURABLY_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Config::default();
        Self {
            database_path: env::var("DURABLY_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            polling_interval: env_duration_ms(
                "DURABLY_POLLING_INTERVAL_MS",
                defaults.polling_interval,
            ),
            heartbeat_interval: env_duration_ms(
                "DURABLY_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            stale_threshold: env_duration_ms(
                "DURABLY_STALE_THRESHOLD_MS",
                defaults.stale_threshold,
            ),
            event_capacity: env::var("DURABLY_EVENT_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.event_capacity),
            base_path: env::var("DURABLY_BASE_PATH").unwrap_or(defaults.base_path),
        }
    }

    /// Check the invariants between tuning knobs.
    pub fn validate(&self) -> Result<(), String> {
        if self.stale_threshold < 3 * self.heartbeat_interval {
            return Err(format!(
                "stale_threshold ({:?}) must be at least 3x heartbeat_interval ({:?})",
                self.stale_threshold, self.heartbeat_interval
            ));
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be nonzero".to_string());
        }
        Ok(())
    }
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.polling_interval, Duration::from_millis(1000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(5000));
        assert_eq!(config.stale_threshold, Duration::from_millis(30000));
    }

    #[test]
    fn stale_threshold_must_cover_three_heartbeats() {
        let config = Config {
            heartbeat_interval: Duration::from_millis(5000),
            stale_threshold: Duration::from_millis(10000),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_event_capacity_is_rejected() {
        let config = Config {
            event_capacity: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
