//! Configuration for the service controller.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rollouts_reconcile::BackoffPolicy;

/// Service controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of concurrent service workers.
    pub service_threads: usize,

    /// Only Rollouts labeled with this instance id are watched.
    pub instance_id: Option<String>,

    /// Interval for re-enqueueing every cached Service, in seconds. 0 disables.
    pub resync_period_secs: u64,

    /// First retry delay for a failing key, in milliseconds.
    pub backoff_base_ms: u64,

    /// Cap on a key's retry delay, in seconds.
    pub backoff_max_secs: u64,

    /// Overall requeue rate shared by all keys.
    pub queue_qps: f64,

    /// Token bucket size for requeues.
    pub queue_burst: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_threads: 10,
            instance_id: None,
            resync_period_secs: 900,
            backoff_base_ms: 5,
            backoff_max_secs: 1000,
            queue_qps: 10.0,
            queue_burst: 100,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let instance_id = lookup("ROLLOUTS_INSTANCE_ID").filter(|id| !id.is_empty());
        let log_level = lookup("ROLLOUTS_LOG_LEVEL").unwrap_or(defaults.log_level);

        let config = Self {
            service_threads: parse(&lookup, "ROLLOUTS_SERVICE_THREADS", defaults.service_threads)?,
            instance_id,
            resync_period_secs: parse(
                &lookup,
                "ROLLOUTS_RESYNC_PERIOD_SECS",
                defaults.resync_period_secs,
            )?,
            backoff_base_ms: parse(&lookup, "ROLLOUTS_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_max_secs: parse(
                &lookup,
                "ROLLOUTS_BACKOFF_MAX_SECS",
                defaults.backoff_max_secs,
            )?,
            queue_qps: parse(&lookup, "ROLLOUTS_QUEUE_QPS", defaults.queue_qps)?,
            queue_burst: parse(&lookup, "ROLLOUTS_QUEUE_BURST", defaults.queue_burst)?,
            log_level,
        };

        if config.service_threads == 0 {
            anyhow::bail!("ROLLOUTS_SERVICE_THREADS must be at least 1");
        }
        if !(config.queue_qps.is_finite() && config.queue_qps > 0.0) {
            anyhow::bail!("ROLLOUTS_QUEUE_QPS must be a positive number");
        }

        Ok(config)
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value {raw:?} for {name}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.resync_period(), Duration::from_secs(900));
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("ROLLOUTS_SERVICE_THREADS", "4"),
            ("ROLLOUTS_INSTANCE_ID", "blue"),
            ("ROLLOUTS_RESYNC_PERIOD_SECS", "0"),
            ("ROLLOUTS_BACKOFF_BASE_MS", " 50 "),
            ("ROLLOUTS_QUEUE_QPS", "2.5"),
            ("ROLLOUTS_LOG_LEVEL", "debug"),
        ])
        .unwrap();

        assert_eq!(config.service_threads, 4);
        assert_eq!(config.instance_id.as_deref(), Some("blue"));
        assert!(config.resync_period().is_zero());
        assert_eq!(config.backoff_policy().base, Duration::from_millis(50));
        assert_eq!(config.queue_qps, 2.5);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_empty_instance_id_is_unset() {
        let config = load(&[("ROLLOUTS_INSTANCE_ID", "")]).unwrap();
        assert_eq!(config.instance_id, None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = load(&[("ROLLOUTS_QUEUE_BURST", "lots")]).unwrap_err();
        assert!(err.to_string().contains("ROLLOUTS_QUEUE_BURST"));

        assert!(load(&[("ROLLOUTS_SERVICE_THREADS", "0")]).is_err());
        assert!(load(&[("ROLLOUTS_QUEUE_QPS", "-1")]).is_err());
    }
}
