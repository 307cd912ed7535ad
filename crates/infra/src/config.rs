//! Engine configuration, read from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TASKFORGE_WORKER_ID` | `$HOSTNAME`, else `taskforge-worker` |
//! | `TASKFORGE_WORKERS` | `4` |
//! | `TASKFORGE_LEASE_SECS` | `600` |
//! | `TASKFORGE_EXECUTION_TIMEOUT_SECS` | unset (no timeout) |
//! | `TASKFORGE_RETRY_STRATEGY` | `exponential` |
//! | `TASKFORGE_RETRY_BASE_MS` | `2000` |
//! | `TASKFORGE_RETRY_MAX_MS` | `300000` |
//! | `TASKFORGE_REAPER_INTERVAL_SECS` | `30` |
//! | `TASKFORGE_RELAY_INTERVAL_MS` | `1000` |
//! | `TASKFORGE_RELAY_GRACE_MS` | `5000` |
//! | `TASKFORGE_EXECUTOR_LATENCY_MS` | `0` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use taskforge_core::{BackoffPolicy, BackoffStrategy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Prefix for each worker's lease owner id (`{worker_id}-{n}`).
    pub worker_id: String,
    pub workers: usize,
    pub lease: Duration,
    pub execution_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
    /// How long one `receive` call waits before re-checking for shutdown.
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
    pub reaper_batch: u32,
    pub relay_interval: Duration,
    /// Entries younger than this are left to the producer that wrote them.
    pub relay_grace: Duration,
    pub relay_batch: u32,
    pub executor_latency: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: "taskforge-worker".to_string(),
            workers: 4,
            lease: Duration::from_secs(600),
            execution_timeout: None,
            backoff: BackoffPolicy::default(),
            poll_interval: Duration::from_millis(500),
            reaper_interval: Duration::from_secs(30),
            reaper_batch: 100,
            relay_interval: Duration::from_secs(1),
            relay_grace: Duration::from_secs(5),
            relay_batch: 100,
            executor_latency: Duration::ZERO,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or blank variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let worker_id = get("TASKFORGE_WORKER_ID")
            .or_else(|| get("HOSTNAME"))
            .unwrap_or(defaults.worker_id);

        let workers: usize = parse(&get, "TASKFORGE_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(invalid("TASKFORGE_WORKERS", "0", "must be at least 1"));
        }

        let lease = Duration::from_secs(parse(&get, "TASKFORGE_LEASE_SECS", defaults.lease.as_secs())?);
        let execution_timeout = match get("TASKFORGE_EXECUTION_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value(
                "TASKFORGE_EXECUTION_TIMEOUT_SECS",
                &raw,
            )?)),
            None => None,
        };

        let strategy: BackoffStrategy = match get("TASKFORGE_RETRY_STRATEGY") {
            Some(raw) => raw
                .parse()
                .map_err(|e: taskforge_core::DomainError| invalid("TASKFORGE_RETRY_STRATEGY", &raw, e))?,
            None => defaults.backoff.strategy,
        };
        let base_delay = Duration::from_millis(parse(
            &get,
            "TASKFORGE_RETRY_BASE_MS",
            defaults.backoff.base_delay.as_millis() as u64,
        )?);
        let max_delay = Duration::from_millis(parse(
            &get,
            "TASKFORGE_RETRY_MAX_MS",
            defaults.backoff.max_delay.as_millis() as u64,
        )?);
        let backoff = BackoffPolicy {
            base_delay,
            max_delay: max_delay.max(base_delay),
            strategy,
            jitter: defaults.backoff.jitter,
        };

        Ok(Self {
            worker_id,
            workers,
            lease,
            execution_timeout,
            backoff,
            reaper_interval: Duration::from_secs(parse(
                &get,
                "TASKFORGE_REAPER_INTERVAL_SECS",
                defaults.reaper_interval.as_secs(),
            )?),
            relay_interval: Duration::from_millis(parse(
                &get,
                "TASKFORGE_RELAY_INTERVAL_MS",
                defaults.relay_interval.as_millis() as u64,
            )?),
            relay_grace: Duration::from_millis(parse(
                &get,
                "TASKFORGE_RELAY_GRACE_MS",
                defaults.relay_grace.as_millis() as u64,
            )?),
            executor_latency: Duration::from_millis(parse(
                &get,
                "TASKFORGE_EXECUTOR_LATENCY_MS",
                0,
            )?),
            ..defaults
        })
    }

    /// Lease owner id for the n-th worker of this process.
    pub fn worker_name(&self, index: usize) -> String {
        format!("{}-{}", self.worker_id, index)
    }
}

fn invalid(var: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value<T>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(var, raw, e))
}

fn parse<T, G>(get: &G, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.lease, Duration::from_secs(600));
    }

    #[test]
    fn hostname_is_the_fallback_worker_id() {
        let config = EngineConfig::from_lookup(lookup(&[("HOSTNAME", "node-7")])).unwrap();
        assert_eq!(config.worker_id, "node-7");
        assert_eq!(config.worker_name(2), "node-7-2");

        let config = EngineConfig::from_lookup(lookup(&[
            ("HOSTNAME", "node-7"),
            ("TASKFORGE_WORKER_ID", "explicit"),
        ]))
        .unwrap();
        assert_eq!(config.worker_id, "explicit");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("TASKFORGE_WORKERS", "8"),
            ("TASKFORGE_LEASE_SECS", "60"),
            ("TASKFORGE_EXECUTION_TIMEOUT_SECS", "15"),
            ("TASKFORGE_RETRY_STRATEGY", "linear"),
            ("TASKFORGE_RETRY_BASE_MS", "100"),
            ("TASKFORGE_RETRY_MAX_MS", "50"),
        ]))
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.lease, Duration::from_secs(60));
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.backoff.strategy, BackoffStrategy::Linear);
        // Cap never below the base.
        assert_eq!(config.backoff.max_delay, Duration::from_millis(100));
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = EngineConfig::from_lookup(lookup(&[("TASKFORGE_LEASE_SECS", "ten")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "TASKFORGE_LEASE_SECS"));

        let err = EngineConfig::from_lookup(lookup(&[("TASKFORGE_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "TASKFORGE_WORKERS"));

        let err = EngineConfig::from_lookup(lookup(&[("TASKFORGE_RETRY_STRATEGY", "random")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "TASKFORGE_RETRY_STRATEGY"));
    }
}
