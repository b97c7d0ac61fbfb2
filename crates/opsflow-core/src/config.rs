// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::task::backoff::BackoffPolicy;

/// opsflow worker node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Number of concurrent task workers
    pub workers: usize,
    /// How long a claimed task stays leased to its worker
    pub lease_duration: Duration,
    /// Idle sleep after an empty claim (doubles up to `max_poll_interval`)
    pub poll_interval: Duration,
    /// Upper bound for the idle sleep
    pub max_poll_interval: Duration,
    /// How often the lease reaper sweeps expired leases
    pub reaper_interval: Duration,
    /// Delay policy applied between task retries
    pub backoff: BackoffPolicy,
    /// Maximum steps of one execution dispatched at the same time
    pub max_parallel_steps: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `OPSFLOW_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `OPSFLOW_WORKERS`: worker pool size (default: 4)
    /// - `OPSFLOW_LEASE_SECS`: task lease duration (default: 300)
    /// - `OPSFLOW_POLL_INTERVAL_MS`: idle backoff floor (default: 1000)
    /// - `OPSFLOW_MAX_POLL_INTERVAL_MS`: idle backoff ceiling (default: 10000)
    /// - `OPSFLOW_REAPER_INTERVAL_SECS`: lease reaper period (default: 30)
    /// - `OPSFLOW_RETRY_BACKOFF`: `linear`, `fixed` or `exponential` (default: linear)
    /// - `OPSFLOW_RETRY_BACKOFF_SECS`: backoff base step (default: 60)
    /// - `OPSFLOW_MAX_PARALLEL_STEPS`: orchestrator fan-out (default: 4)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("OPSFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("OPSFLOW_DATABASE_URL"))?;

        let workers: usize = parse_var("OPSFLOW_WORKERS", "4", "must be a positive integer")?;
        if workers == 0 {
            return Err(ConfigError::Invalid(
                "OPSFLOW_WORKERS",
                "must be a positive integer",
            ));
        }

        let lease_secs: u64 =
            parse_var("OPSFLOW_LEASE_SECS", "300", "must be a number of seconds")?;
        if lease_secs == 0 {
            return Err(ConfigError::Invalid(
                "OPSFLOW_LEASE_SECS",
                "must be greater than zero",
            ));
        }

        let poll_ms: u64 = parse_var(
            "OPSFLOW_POLL_INTERVAL_MS",
            "1000",
            "must be a number of milliseconds",
        )?;
        let max_poll_ms: u64 = parse_var(
            "OPSFLOW_MAX_POLL_INTERVAL_MS",
            "10000",
            "must be a number of milliseconds",
        )?;
        let reaper_secs: u64 = parse_var(
            "OPSFLOW_REAPER_INTERVAL_SECS",
            "30",
            "must be a number of seconds",
        )?;

        let backoff_secs: u64 = parse_var(
            "OPSFLOW_RETRY_BACKOFF_SECS",
            "60",
            "must be a number of seconds",
        )?;
        let backoff_step = Duration::from_secs(backoff_secs);
        let backoff = match std::env::var("OPSFLOW_RETRY_BACKOFF")
            .unwrap_or_else(|_| "linear".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "linear" => BackoffPolicy::Linear { step: backoff_step },
            "fixed" => BackoffPolicy::Fixed {
                delay: backoff_step,
            },
            "exponential" => BackoffPolicy::Exponential {
                base: backoff_step,
                max: backoff_step * 64,
            },
            _ => {
                return Err(ConfigError::Invalid(
                    "OPSFLOW_RETRY_BACKOFF",
                    "must be one of linear, fixed, exponential",
                ));
            }
        };

        let max_parallel_steps: usize = parse_var(
            "OPSFLOW_MAX_PARALLEL_STEPS",
            "4",
            "must be a positive integer",
        )?;

        Ok(Self {
            database_url,
            workers,
            lease_duration: Duration::from_secs(lease_secs),
            poll_interval: Duration::from_millis(poll_ms),
            max_poll_interval: Duration::from_millis(max_poll_ms.max(poll_ms)),
            reaper_interval: Duration::from_secs(reaper_secs.max(1)),
            backoff,
            max_parallel_steps: max_parallel_steps.max(1),
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, message))
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

    // Serializes tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "OPSFLOW_DATABASE_URL",
        "OPSFLOW_WORKERS",
        "OPSFLOW_LEASE_SECS",
        "OPSFLOW_POLL_INTERVAL_MS",
        "OPSFLOW_MAX_POLL_INTERVAL_MS",
        "OPSFLOW_REAPER_INTERVAL_SECS",
        "OPSFLOW_RETRY_BACKOFF",
        "OPSFLOW_RETRY_BACKOFF_SECS",
        "OPSFLOW_MAX_PARALLEL_STEPS",
    ];

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.remove(key);
            }
            guard
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
        let mut guard = EnvGuard::clean();
        guard.set("OPSFLOW_DATABASE_URL", "sqlite::memory:");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.workers, 4);
        assert_eq!(config.lease_duration, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.max_poll_interval, Duration::from_millis(10000));
        assert_eq!(config.reaper_interval, Duration::from_secs(30));
        assert_eq!(
            config.backoff,
            BackoffPolicy::Linear {
                step: Duration::from_secs(60)
            }
        );
        assert_eq!(config.max_parallel_steps, 4);
    }

    #[test]
    fn test_config_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("OPSFLOW_DATABASE_URL", "sqlite:.data/ops.db?mode=rwc");
        guard.set("OPSFLOW_WORKERS", "16");
        guard.set("OPSFLOW_LEASE_SECS", "45");
        guard.set("OPSFLOW_RETRY_BACKOFF", "Exponential");
        guard.set("OPSFLOW_RETRY_BACKOFF_SECS", "2");
        guard.set("OPSFLOW_MAX_PARALLEL_STEPS", "8");

        let config = Config::from_env().unwrap();

        assert_eq!(config.workers, 16);
        assert_eq!(config.lease_duration, Duration::from_secs(45));
        assert_eq!(
            config.backoff,
            BackoffPolicy::Exponential {
                base: Duration::from_secs(2),
                max: Duration::from_secs(128),
            }
        );
        assert_eq!(config.max_parallel_steps, 8);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("OPSFLOW_DATABASE_URL")));
        assert!(err.to_string().contains("OPSFLOW_DATABASE_URL"));
    }

    #[test]
    fn test_config_zero_workers_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("OPSFLOW_DATABASE_URL", "sqlite::memory:");
        guard.set("OPSFLOW_WORKERS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("OPSFLOW_WORKERS", _)));
    }

    #[test]
    fn test_config_invalid_backoff() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("OPSFLOW_DATABASE_URL", "sqlite::memory:");
        guard.set("OPSFLOW_RETRY_BACKOFF", "fibonacci");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("OPSFLOW_RETRY_BACKOFF", _)));
    }

    #[test]
    fn test_config_negative_lease_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("OPSFLOW_DATABASE_URL", "sqlite::memory:");
        guard.set("OPSFLOW_LEASE_SECS", "-5");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
