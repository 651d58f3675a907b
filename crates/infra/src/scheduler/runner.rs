//! Run execution and the per-job loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertQueue, AlertSeverity};

use super::random::{RandomSource, ThreadRandom};
use super::types::{JobSpec, RunOutcome};

/// Message carried by the alert raised when a run exhausts its retries.
pub const EXHAUSTED_MESSAGE: &str = "job failed after retries";

/// Executes single scheduled runs: attempts, backoff and the exhaustion alert.
#[derive(Debug, Clone)]
pub struct Runner {
    alerts: AlertQueue,
    random: Arc<dyn RandomSource>,
}

impl Runner {
    pub fn new(alerts: AlertQueue) -> Self {
        Self {
            alerts,
            random: Arc::new(ThreadRandom),
        }
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Execute one run of `spec`.
    ///
    /// The run token is a child of `shutdown` and is cancelled when the run
    /// timeout elapses or when this call returns. Each attempt runs on its own
    /// task; once the token fires the attempt is abandoned rather than awaited.
    pub async fn run_once(&self, spec: &JobSpec, shutdown: &CancellationToken) -> RunOutcome {
        let run_token = shutdown.child_token();
        let _cancel_on_return = run_token.clone().drop_guard();
        let timed_out = Arc::new(AtomicBool::new(false));

        if !spec.timeout.is_zero() {
            let token = run_token.clone();
            let flag = timed_out.clone();
            let timeout = spec.timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            });
        }

        let max_attempts = spec.retry_limit.saturating_add(1);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            debug!(job = spec.name(), attempt = attempts, "running job");

            let job = spec.job.clone();
            let token = run_token.clone();
            let mut task = tokio::spawn(async move { job.run(token).await });

            let result = tokio::select! {
                joined = &mut task => match joined {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("job task failed: {e}")),
                },
                _ = run_token.cancelled() => {
                    return interrupted(spec, attempts, &timed_out);
                }
            };

            let error = match result {
                Ok(()) => {
                    if attempts > 1 {
                        info!(job = spec.name(), attempts, "job succeeded after retry");
                    }
                    return RunOutcome::Succeeded { attempts };
                }
                Err(e) => e,
            };

            if run_token.is_cancelled() {
                return interrupted(spec, attempts, &timed_out);
            }

            warn!(
                job = spec.name(),
                attempt = attempts,
                max_attempts,
                error = %format!("{error:#}"),
                "job attempt failed"
            );

            if attempts >= max_attempts {
                return self.exhausted(spec, attempts, error);
            }

            let delay = spec.backoff(attempts - 1) + self.random.jitter(spec.jitter / 2);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = run_token.cancelled() => {
                    return interrupted(spec, attempts, &timed_out);
                }
            }
        }
    }

    fn exhausted(&self, spec: &JobSpec, attempts: u32, error: anyhow::Error) -> RunOutcome {
        let error = format!("{error:#}");
        let alert = Alert::new(spec.name(), AlertSeverity::Error, EXHAUSTED_MESSAGE)
            .with_error(&error)
            .with_metadata("attempts", attempts)
            .with_metadata("tags", spec.tags.join(","));
        self.alerts.publish(alert);
        RunOutcome::Exhausted { attempts, error }
    }
}

fn interrupted(spec: &JobSpec, attempts: u32, timed_out: &AtomicBool) -> RunOutcome {
    if timed_out.load(Ordering::SeqCst) {
        warn!(job = spec.name(), attempts, timeout = ?spec.timeout, "job timed out");
        RunOutcome::TimedOut { attempts }
    } else {
        info!(job = spec.name(), attempts, "job cancelled");
        RunOutcome::Cancelled { attempts }
    }
}

/// Per-loop statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobLoopStats {
    pub job: String,
    pub running: bool,
    pub runs: u64,
    pub succeeded: u64,
    pub exhausted: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub attempts: u64,
    pub last_outcome: Option<RunOutcome>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
}

impl JobLoopStats {
    fn record(&mut self, outcome: &RunOutcome, started_at: DateTime<Utc>, elapsed: Duration) {
        self.runs += 1;
        self.attempts += u64::from(outcome.attempts());
        match outcome {
            RunOutcome::Succeeded { .. } => self.succeeded += 1,
            RunOutcome::Exhausted { .. } => self.exhausted += 1,
            RunOutcome::TimedOut { .. } => self.timed_out += 1,
            RunOutcome::Cancelled { .. } => self.cancelled += 1,
        }
        self.last_outcome = Some(outcome.clone());
        self.last_run_at = Some(started_at);
        self.last_duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    }
}

type SharedLoopStats = Arc<Mutex<JobLoopStats>>;

fn lock_stats(stats: &SharedLoopStats) -> std::sync::MutexGuard<'_, JobLoopStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears `running` when the loop exits, including by panic.
struct RunningGuard(SharedLoopStats);

impl RunningGuard {
    fn new(stats: SharedLoopStats) -> Self {
        lock_stats(&stats).running = true;
        Self(stats)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock_stats(&self.0).running = false;
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub jobs: Vec<JobLoopStats>,
}

impl SchedulerStats {
    pub fn job(&self, name: &str) -> Option<&JobLoopStats> {
        self.jobs.iter().find(|j| j.job == name)
    }
}

/// Owns the job specs until started.
#[derive(Debug)]
pub struct Scheduler {
    runner: Runner,
    jobs: Vec<JobSpec>,
}

impl Scheduler {
    pub fn new(alerts: AlertQueue) -> Self {
        Self {
            runner: Runner::new(alerts),
            jobs: Vec::new(),
        }
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.runner = self.runner.with_random(random);
        self
    }

    pub fn with_job(mut self, spec: JobSpec) -> Self {
        self.jobs.push(spec);
        self
    }

    /// Spawn one loop per enabled job. Loops stop when `shutdown` fires.
    pub fn start(self, shutdown: &CancellationToken) -> SchedulerHandle {
        let runner = Arc::new(self.runner);
        let mut tasks = Vec::new();
        let mut stats = Vec::new();

        for spec in self.jobs {
            if !spec.is_enabled() {
                warn!(job = spec.name(), "job has a zero interval; skipping");
                continue;
            }
            let loop_stats: SharedLoopStats = Arc::new(Mutex::new(JobLoopStats {
                job: spec.name().to_string(),
                ..JobLoopStats::default()
            }));
            // Mark running before the task is polled so the handle never
            // observes a started loop as idle.
            let guard = RunningGuard::new(loop_stats.clone());
            stats.push(loop_stats);
            tasks.push(tokio::spawn(job_loop(
                runner.clone(),
                spec,
                shutdown.clone(),
                guard,
            )));
        }

        info!(jobs = tasks.len(), "scheduler started");
        SchedulerHandle {
            shutdown: shutdown.clone(),
            tasks,
            stats,
        }
    }
}

async fn job_loop(runner: Arc<Runner>, spec: JobSpec, shutdown: CancellationToken, guard: RunningGuard) {
    info!(job = spec.name(), every = ?spec.every, tags = ?spec.tags, "job loop started");
    loop {
        let started_at = Utc::now();
        let started = Instant::now();
        let outcome = runner.run_once(&spec, &shutdown).await;
        lock_stats(&guard.0).record(&outcome, started_at, started.elapsed());

        if shutdown.is_cancelled() {
            break;
        }
        let wait = spec.every + runner.random.jitter(spec.jitter);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!(job = spec.name(), "job loop stopped");
}

/// Handle to running job loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: Vec<SharedLoopStats>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            jobs: self.stats.iter().map(|s| lock_stats(s).clone()).collect(),
        }
    }

    /// True while any loop is alive.
    pub fn is_running(&self) -> bool {
        self.stats.iter().any(|s| lock_stats(s).running)
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn shutdown(self) -> SchedulerStats {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the loops to exit without cancelling them.
    pub async fn join(self) -> SchedulerStats {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "job loop task failed");
            }
        }
        SchedulerStats {
            jobs: self.stats.iter().map(|s| lock_stats(s).clone()).collect(),
        }
    }
}
