//! Recurring job scheduler with timeout, retry, backoff and alerting.
//!
//! ## Design
//!
//! - One independent tokio task per [`JobSpec`]; a slow or failing job never
//!   delays another job's ticks
//! - Each job runs once at start, then every `every + random(jitter)`
//! - A run gets a child cancellation token of the shutdown token; the run
//!   timeout is a timer that cancels it
//! - Genuine failures are retried with exponential backoff plus
//!   `random(jitter / 2)`; cancellation and timeouts are never retried
//! - Exhausting the retry budget publishes exactly one alert
//!
//! ## Components
//!
//! - `UnitOfWork`: what a job is (name + cancellable run)
//! - `JobSpec`: how often and how persistently to run it
//! - `Runner`: executes one scheduled run (attempts, backoff, alert)
//! - `Scheduler` / `SchedulerHandle`: owns the loops and their stats
//! - `RandomSource`: injected jitter source

pub mod heartbeat;
pub mod random;
pub mod runner;
pub mod types;

pub use heartbeat::HeartbeatJob;
pub use random::{FixedRandom, RandomSource, ThreadRandom};
pub use runner::{JobLoopStats, Runner, Scheduler, SchedulerHandle, SchedulerStats};
pub use types::{JobSpec, RunOutcome, UnitOfWork};
