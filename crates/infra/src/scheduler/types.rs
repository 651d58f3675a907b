//! Core scheduler types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Executable work driven by the scheduler.
///
/// `run` must return promptly once `cancel` fires. Retries are serialized but
/// nothing here makes them idempotent; implementations that need it own it.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Stable identifier used in logs, stats and alerts.
    fn name(&self) -> &str;

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// How a job is scheduled. Immutable once handed to the scheduler.
#[derive(Clone)]
pub struct JobSpec {
    pub job: Arc<dyn UnitOfWork>,
    pub tags: Vec<String>,
    /// Interval between runs. Zero disables the job.
    pub every: Duration,
    /// Budget for a whole run, retries included. Zero means no timeout.
    pub timeout: Duration,
    /// Extra attempts after the first failure.
    pub retry_limit: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub jitter: Duration,
}

impl JobSpec {
    pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

    pub fn new(job: Arc<dyn UnitOfWork>, every: Duration) -> Self {
        Self {
            job,
            tags: Vec::new(),
            every,
            timeout: Duration::ZERO,
            retry_limit: 0,
            backoff_initial: Self::DEFAULT_BACKOFF_INITIAL,
            backoff_max: Self::DEFAULT_BACKOFF_MAX,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Zero values fall back to the defaults (500ms / 30s).
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = if initial.is_zero() {
            Self::DEFAULT_BACKOFF_INITIAL
        } else {
            initial
        };
        self.backoff_max = if max.is_zero() {
            Self::DEFAULT_BACKOFF_MAX
        } else {
            max
        };
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    pub fn is_enabled(&self) -> bool {
        !self.every.is_zero()
    }

    /// Backoff before retry number `retry` (0-based), without jitter:
    /// `backoff_initial * 2^retry`, capped at `backoff_max`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.backoff_initial
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl core::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobSpec")
            .field("job", &self.name())
            .field("tags", &self.tags)
            .field("every", &self.every)
            .field("timeout", &self.timeout)
            .field("retry_limit", &self.retry_limit)
            .field("backoff_initial", &self.backoff_initial)
            .field("backoff_max", &self.backoff_max)
            .field("jitter", &self.jitter)
            .finish()
    }
}

/// Result of one scheduled run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded { attempts: u32 },
    /// Every attempt failed; one alert was published.
    Exhausted { attempts: u32, error: String },
    /// Shutdown fired during the run.
    Cancelled { attempts: u32 },
    /// The run timeout fired.
    TimedOut { attempts: u32 },
}

impl RunOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RunOutcome::Succeeded { attempts }
            | RunOutcome::Exhausted { attempts, .. }
            | RunOutcome::Cancelled { attempts }
            | RunOutcome::TimedOut { attempts } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }
}
