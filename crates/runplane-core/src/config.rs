// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::artifacts::DEFAULT_CACHE_CAPACITY;
use crate::events::DEFAULT_LOG_BUFFER;

/// Runplane Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Delay between a cancel and the earliest force-cancel
    pub force_cancel_cooldown: Duration,
    /// Artifacts kept in the in-memory cache
    pub artifact_cache_capacity: usize,
    /// Undelivered log notes kept per event bus subscriber
    pub event_buffer: usize,
    /// Database pool size
    pub max_connections: u32,
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, reason))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RUNPLANE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `RUNPLANE_FORCE_CANCEL_COOLDOWN_SECS`: force-cancel cooldown (default: 10)
    /// - `RUNPLANE_ARTIFACT_CACHE_CAPACITY`: cached artifacts (default: 512)
    /// - `RUNPLANE_EVENT_BUFFER`: log notes buffered per subscriber (default: 256)
    /// - `RUNPLANE_MAX_CONNECTIONS`: database pool size (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNPLANE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("RUNPLANE_DATABASE_URL"))?;

        let cooldown_secs: u64 = parse_var(
            "RUNPLANE_FORCE_CANCEL_COOLDOWN_SECS",
            "10",
            "must be a number of seconds",
        )?;

        let artifact_cache_capacity = parse_var(
            "RUNPLANE_ARTIFACT_CACHE_CAPACITY",
            &DEFAULT_CACHE_CAPACITY.to_string(),
            "must be a non-negative integer",
        )?;

        let event_buffer: usize = parse_var(
            "RUNPLANE_EVENT_BUFFER",
            &DEFAULT_LOG_BUFFER.to_string(),
            "must be a positive integer",
        )?;
        if event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "RUNPLANE_EVENT_BUFFER",
                "must be a positive integer",
            ));
        }

        let max_connections: u32 = parse_var(
            "RUNPLANE_MAX_CONNECTIONS",
            "10",
            "must be a positive integer",
        )?;

        Ok(Self {
            database_url,
            force_cancel_cooldown: Duration::from_secs(cooldown_secs),
            artifact_cache_capacity,
            event_buffer,
            max_connections,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL: [&str; 4] = [
        "RUNPLANE_FORCE_CANCEL_COOLDOWN_SECS",
        "RUNPLANE_ARTIFACT_CACHE_CAPACITY",
        "RUNPLANE_EVENT_BUFFER",
        "RUNPLANE_MAX_CONNECTIONS",
    ];

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("RUNPLANE_DATABASE_URL", "sqlite::memory:");
        for key in OPTIONAL {
            guard.remove(key);
        }

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.force_cancel_cooldown, Duration::from_secs(10));
        assert_eq!(config.artifact_cache_capacity, 512);
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.max_connections, 10);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("RUNPLANE_DATABASE_URL", "postgres://user:pass@db:5432/runs");
        guard.set("RUNPLANE_FORCE_CANCEL_COOLDOWN_SECS", "30");
        guard.set("RUNPLANE_ARTIFACT_CACHE_CAPACITY", "0");
        guard.set("RUNPLANE_EVENT_BUFFER", "16");
        guard.set("RUNPLANE_MAX_CONNECTIONS", "4");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://user:pass@db:5432/runs");
        assert_eq!(config.force_cancel_cooldown, Duration::from_secs(30));
        assert_eq!(config.artifact_cache_capacity, 0);
        assert_eq!(config.event_buffer, 16);
        assert_eq!(config.max_connections, 4);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("RUNPLANE_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("RUNPLANE_DATABASE_URL")));
        assert!(err.to_string().contains("RUNPLANE_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();

        for (key, value) in [
            ("RUNPLANE_FORCE_CANCEL_COOLDOWN_SECS", "-1"),
            ("RUNPLANE_ARTIFACT_CACHE_CAPACITY", "lots"),
            ("RUNPLANE_EVENT_BUFFER", "0"),
            ("RUNPLANE_MAX_CONNECTIONS", "ten"),
        ] {
            let mut guard = EnvGuard::new();
            guard.set("RUNPLANE_DATABASE_URL", "sqlite::memory:");
            for other in OPTIONAL {
                guard.remove(other);
            }
            guard.set(key, value);

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(k, _) if k == key),
                "{} = {} should be rejected",
                key,
                value
            );
        }
    }
}
