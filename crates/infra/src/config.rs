//! Worker configuration from environment variables.
//!
//! Every setting has a default. A variable that is unset or blank keeps the
//! default; a malformed value is logged and also keeps the default, so a typo
//! never stops the worker from starting.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use batchflow_core::{DomainError, WorkerId};

use crate::alerts::AlertQueue;
use crate::coordinator::CoordinatorConfig;
use crate::scheduler::{JobSpec, UnitOfWork};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration {0:?} (expected e.g. 500ms, 30s, 5m, 1h30m)")]
    InvalidDuration(String),
    #[error("invalid number {value:?}: {source}")]
    InvalidNumber {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error(transparent)]
    InvalidWorkerId(#[from] DomainError),
}

/// Retry discipline applied to every scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefaults {
    pub timeout: Duration,
    pub retry_limit: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub jitter: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2 * 60),
            retry_limit: 3,
            backoff_initial: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
            jitter: Duration::from_secs(5),
        }
    }
}

impl JobDefaults {
    pub fn spec(&self, job: Arc<dyn UnitOfWork>, every: Duration) -> JobSpec {
        JobSpec::new(job, every)
            .with_timeout(self.timeout)
            .with_retry_limit(self.retry_limit)
            .with_backoff(self.backoff_initial, self.backoff_max)
            .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `WORKER_ALERT_INTERVAL`: heartbeat job interval.
    pub heartbeat_interval: Duration,
    pub jobs: JobDefaults,
    pub coordinator: CoordinatorConfig,
    pub alert_queue_capacity: usize,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5 * 60),
            jobs: JobDefaults::default(),
            coordinator: CoordinatorConfig::default(),
            alert_queue_capacity: AlertQueue::DEFAULT_CAPACITY,
            database_url: None,
            redis_url: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut cfg = Self::default();

        env.duration("WORKER_ALERT_INTERVAL", &mut cfg.heartbeat_interval);
        env.duration("WORKER_TIMEOUT", &mut cfg.jobs.timeout);
        env.number("WORKER_RETRY_LIMIT", &mut cfg.jobs.retry_limit);
        env.duration("WORKER_BACKOFF_INITIAL", &mut cfg.jobs.backoff_initial);
        env.duration("WORKER_BACKOFF_MAX", &mut cfg.jobs.backoff_max);
        env.duration("WORKER_JITTER", &mut cfg.jobs.jitter);

        let c = &mut cfg.coordinator;
        if let Some(raw) = env.get("BATCH_WORKER_ID") {
            match WorkerId::parse(&raw) {
                Ok(id) => c.worker_id = id,
                Err(e) => warn!(key = "BATCH_WORKER_ID", error = %e, "ignoring invalid setting"),
            }
        }
        env.duration("BATCH_POLL_INTERVAL", &mut c.polling_interval);
        env.duration("BATCH_POLL_JITTER", &mut c.polling_jitter);
        env.number("BATCH_WORKER_POOL", &mut c.worker_pool_size);
        env.number("BATCH_MAX_PER_POLL", &mut c.max_batches_per_poll);
        env.duration("BATCH_LEASE", &mut c.lease_duration);
        env.number("ALERT_QUEUE_CAPACITY", &mut cfg.alert_queue_capacity);

        cfg.database_url = env.get("DATABASE_URL");
        cfg.redis_url = env.get("REDIS_URL");
        cfg.sanitize();
        cfg
    }

    /// Zero values that would stall a loop fall back to their defaults.
    fn sanitize(&mut self) {
        let defaults = CoordinatorConfig::default();
        let c = &mut self.coordinator;
        if c.polling_interval.is_zero() {
            warn!("BATCH_POLL_INTERVAL is zero; using default");
            c.polling_interval = defaults.polling_interval;
        }
        if c.lease_duration.is_zero() {
            warn!("BATCH_LEASE is zero; using default");
            c.lease_duration = defaults.lease_duration;
        }
        if c.worker_pool_size == 0 {
            c.worker_pool_size = defaults.worker_pool_size;
        }
        if c.max_batches_per_poll == 0 {
            c.max_batches_per_poll = defaults.max_batches_per_poll;
        }
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn duration(&self, key: &str, slot: &mut Duration) {
        if let Some(raw) = self.get(key) {
            match parse_duration(&raw) {
                Ok(d) => *slot = d,
                Err(e) => warn!(key, error = %e, default = ?slot, "ignoring invalid setting"),
            }
        }
    }

    fn number<T>(&self, key: &str, slot: &mut T)
    where
        T: FromStr<Err = std::num::ParseIntError> + core::fmt::Debug,
    {
        if let Some(raw) = self.get(key) {
            match parse_number::<T>(&raw) {
                Ok(n) => *slot = n,
                Err(e) => warn!(key, error = %e, default = ?slot, "ignoring invalid setting"),
            }
        }
    }
}

fn parse_number<T>(raw: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    raw.parse().map_err(|source| ConfigError::InvalidNumber {
        value: raw.to_string(),
        source,
    })
}

/// Parse durations such as `500ms`, `1.5s`, `5m`, `1h30m` or a bare `0`.
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. Every number needs a unit.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let s = raw.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        rest = tail;

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(invalid()),
        };
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let fraction = &fraction[..fraction.len().min(9)];
        let fraction_nanos = if fraction.is_empty() {
            0
        } else {
            let digits: u128 = fraction.parse().map_err(|_| invalid())?;
            digits * unit_nanos / 10u128.pow(fraction.len() as u32)
        };
        total = whole
            .checked_mul(unit_nanos)
            .and_then(|n| n.checked_add(fraction_nanos))
            .and_then(|n| n.checked_add(total))
            .ok_or_else(invalid)?;
    }

    let secs = u64::try_from(total / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> WorkerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(".5h").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration(" 0 ").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_durations() {
        for raw in ["", "5", "ms", "1.2.3s", "10x", "-5s", "5 s"] {
            assert!(
                matches!(parse_duration(raw), Err(ConfigError::InvalidDuration(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn defaults_without_variables() {
        let cfg = from_map(&[]);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(300));
        assert_eq!(cfg.jobs, JobDefaults::default());
        assert_eq!(cfg.coordinator.polling_interval, Duration::from_secs(30));
        assert_eq!(cfg.coordinator.worker_pool_size, 5);
        assert_eq!(cfg.coordinator.lease_duration, Duration::from_secs(300));
        assert_eq!(cfg.alert_queue_capacity, 64);
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn reads_overrides() {
        let cfg = from_map(&[
            ("WORKER_ALERT_INTERVAL", "1m"),
            ("WORKER_TIMEOUT", "45s"),
            ("WORKER_RETRY_LIMIT", "7"),
            ("WORKER_BACKOFF_INITIAL", "250ms"),
            ("WORKER_BACKOFF_MAX", "10s"),
            ("WORKER_JITTER", "0"),
            ("BATCH_WORKER_ID", " node-a "),
            ("BATCH_POLL_INTERVAL", "5s"),
            ("BATCH_WORKER_POOL", "12"),
            ("BATCH_LEASE", "2m"),
            ("ALERT_QUEUE_CAPACITY", "128"),
            ("DATABASE_URL", "postgres://localhost/batchflow"),
        ]);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(
            cfg.jobs,
            JobDefaults {
                timeout: Duration::from_secs(45),
                retry_limit: 7,
                backoff_initial: Duration::from_millis(250),
                backoff_max: Duration::from_secs(10),
                jitter: Duration::ZERO,
            }
        );
        assert_eq!(cfg.coordinator.worker_id.as_str(), "node-a");
        assert_eq!(cfg.coordinator.polling_interval, Duration::from_secs(5));
        assert_eq!(cfg.coordinator.worker_pool_size, 12);
        assert_eq!(cfg.coordinator.lease_duration, Duration::from_secs(120));
        assert_eq!(cfg.alert_queue_capacity, 128);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/batchflow"));
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let cfg = from_map(&[
            ("WORKER_TIMEOUT", "soon"),
            ("WORKER_RETRY_LIMIT", "-1"),
            ("BATCH_LEASE", "0"),
            ("BATCH_WORKER_ID", "   "),
            ("REDIS_URL", ""),
        ]);
        assert_eq!(cfg.jobs.timeout, Duration::from_secs(120));
        assert_eq!(cfg.jobs.retry_limit, 3);
        assert_eq!(cfg.coordinator.lease_duration, Duration::from_secs(300));
        assert!(cfg.coordinator.worker_id.as_str().starts_with("worker-"));
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn job_defaults_build_specs() {
        struct Noop;

        #[async_trait::async_trait]
        impl UnitOfWork for Noop {
            fn name(&self) -> &str {
                "noop"
            }

            async fn run(&self, _cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let spec = JobDefaults::default().spec(Arc::new(Noop), Duration::from_secs(60));
        assert_eq!(spec.timeout, Duration::from_secs(120));
        assert_eq!(spec.retry_limit, 3);
        assert_eq!(spec.backoff_initial, Duration::from_secs(2));
        assert_eq!(spec.jitter, Duration::from_secs(5));
    }
}
