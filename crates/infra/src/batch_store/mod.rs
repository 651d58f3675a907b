//! Persistence for batch jobs, their activity references and leases.
//!
//! ## Design
//!
//! - Mutual exclusion between workers is a compare-and-set on the batch
//!   record itself (`acquire_lock`); no separate lock service
//! - Per-activity marks increment the parent counters atomically with the
//!   ref write, without rewriting the whole record
//! - Every applied status change appends to the progress log
//! - Lease contention is a `false` return, never an error
//!
//! ## Components
//!
//! - `BatchStore`: async storage contract
//! - `InMemoryBatchStore`: single critical section per operation (tests/dev)
//! - `PostgresBatchStore`: conditional `UPDATE`s and transactions (sqlx)

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;

use batchflow_batch::{ActivityRef, BatchFilter, BatchJob, BatchProgress, BatchStatus, ProgressLogEntry};
use batchflow_core::{ActivityId, BatchId, DomainError, OrgId, WorkerId};

pub use in_memory::InMemoryBatchStore;
pub use postgres::PostgresBatchStore;

pub type BatchStoreResult<T> = Result<T, BatchStoreError>;

/// Batch store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BatchStoreError {
    #[error("batch not found: {0}")]
    NotFound(BatchId),
    #[error("activity {activity_id} not found in batch {batch_id}")]
    ActivityNotFound {
        batch_id: BatchId,
        activity_id: ActivityId,
    },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Backend I/O failure. Never retried inside the store.
    #[error("storage error: {0}")]
    Transient(String),
}

impl BatchStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BatchStoreError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BatchStoreError::NotFound(_) | BatchStoreError::ActivityNotFound { .. }
        )
    }
}

/// Batch store abstraction.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist a new record. Stamps `created_at`/`updated_at`.
    async fn create_batch(&self, job: BatchJob) -> BatchStoreResult<BatchId>;

    /// Persist a new record together with one pending ref per activity, as
    /// one unit. A batch is never visible to workers with a partial ref set.
    async fn create_batch_with_activities(
        &self,
        job: BatchJob,
        activities: &[ActivityId],
    ) -> BatchStoreResult<BatchId>;

    async fn get_batch(&self, id: BatchId) -> BatchStoreResult<BatchJob>;

    /// Tenant listing, newest first.
    async fn list_batches(&self, org_id: OrgId, filter: &BatchFilter) -> BatchStoreResult<Vec<BatchJob>>;

    /// Atomic status change. A terminal batch is left untouched.
    async fn update_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        progress: Option<BatchProgress>,
    ) -> BatchStoreResult<()>;

    async fn add_activity_ref(&self, batch_id: BatchId, activity_id: &ActivityId) -> BatchStoreResult<()>;

    /// Returns `false` when the ref was already terminal (nothing counted).
    async fn mark_activity_complete(
        &self,
        batch_id: BatchId,
        activity_id: &ActivityId,
        emissions: f64,
    ) -> BatchStoreResult<bool>;

    /// Returns `false` when the ref was already terminal (nothing counted).
    async fn mark_activity_failed(
        &self,
        batch_id: BatchId,
        activity_id: &ActivityId,
        error: &str,
    ) -> BatchStoreResult<bool>;

    /// Refs in submission order.
    async fn list_activity_refs(&self, batch_id: BatchId) -> BatchStoreResult<Vec<ActivityRef>>;

    /// `Pending`/`Queued` with no live lease; priority desc, then oldest first.
    async fn get_pending_batches(&self, limit: usize) -> BatchStoreResult<Vec<BatchJob>>;

    /// `Processing` with no live lease (abandoned by a crashed worker).
    async fn get_reclaimable_batches(&self, limit: usize) -> BatchStoreResult<Vec<BatchJob>>;

    /// Single conditional write: takes the lease iff it is free, expired, or
    /// already held by `worker_id` (renewal).
    async fn acquire_lock(
        &self,
        batch_id: BatchId,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> BatchStoreResult<bool>;

    /// Unconditional clear.
    async fn release_lock(&self, batch_id: BatchId) -> BatchStoreResult<()>;

    /// `Processing → Queued`, consuming one retry.
    async fn requeue_batch(&self, batch_id: BatchId, error: &str) -> BatchStoreResult<()>;

    /// Terminal failure with a diagnostic message.
    async fn fail_batch(
        &self,
        batch_id: BatchId,
        error: &str,
        progress: Option<BatchProgress>,
    ) -> BatchStoreResult<()>;

    /// Remove the batch, its refs and its progress log, all or nothing.
    async fn delete_batch(&self, id: BatchId) -> BatchStoreResult<()>;

    /// Oldest first.
    async fn get_progress_log(&self, id: BatchId) -> BatchStoreResult<Vec<ProgressLogEntry>>;
}
