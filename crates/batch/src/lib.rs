//! Batch domain module.
//!
//! Lifecycle rules for batch jobs and their activity references, implemented
//! purely as deterministic domain logic (no IO, no storage, no clock). Stores
//! call into these types so every backend applies the same transitions.

pub mod activity;
pub mod job;
pub mod query;
pub mod status;

pub use activity::ActivityRef;
pub use job::{BatchDetail, BatchJob, BatchProgress, SubmitBatch};
pub use query::{BatchFilter, ProgressLogEntry};
pub use status::{ActivityStatus, BatchStatus};

/// Priority assigned to submissions that do not carry one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Processing retry budget assigned to submissions that do not carry one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
