//! Batch coordinator: submission, claiming and lease-fenced processing.
//!
//! ## Design
//!
//! - A batch is processed only while this worker holds its lease; the lease
//!   is renewed every `lease_duration / 3`
//! - A failed renewal raises the lease-lost flag and cancels processing. The
//!   worker then stops without writing a terminal status or releasing, since
//!   the lease now belongs to someone else
//! - Work resumes from the recorded per-activity refs, so a reclaimed batch
//!   only processes what is still pending
//! - Claimed batches run concurrently up to `worker_pool_size`; activities
//!   within a batch run up to the batch's `concurrency`

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use batchflow_batch::{
    ActivityStatus, BatchDetail, BatchFilter, BatchJob, BatchStatus, ProgressLogEntry, SubmitBatch,
};
use batchflow_core::{ActivityId, BatchId, DomainError, OrgId, WorkerId};

use crate::batch_store::{BatchStore, BatchStoreError, BatchStoreResult};
use crate::scheduler::{RandomSource, ThreadRandom};

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] BatchStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Computes one activity's emissions.
///
/// An `Err` is a per-activity failure: it is recorded on the ref and counted,
/// and the batch carries on.
#[async_trait]
pub trait ActivityProcessor: Send + Sync {
    async fn process(
        &self,
        batch: &BatchJob,
        activity: &ActivityId,
        cancel: CancellationToken,
    ) -> Result<f64, String>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub worker_id: WorkerId,
    pub polling_interval: Duration,
    pub polling_jitter: Duration,
    /// Batches processed concurrently by this worker.
    pub worker_pool_size: usize,
    pub max_batches_per_poll: usize,
    pub lease_duration: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            polling_interval: Duration::from_secs(30),
            polling_jitter: Duration::from_secs(5),
            worker_pool_size: 5,
            max_batches_per_poll: 10,
            lease_duration: Duration::from_secs(5 * 60),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_polling(mut self, interval: Duration, jitter: Duration) -> Self {
        self.polling_interval = interval;
        self.polling_jitter = jitter;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_max_batches_per_poll(mut self, max: usize) -> Self {
        self.max_batches_per_poll = max;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    fn renewal_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(1))
    }
}

/// How one `process_batch` call ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed {
        success_count: u32,
        error_count: u32,
        total_emissions: f64,
    },
    Failed { error: String },
    Requeued { error: String },
    /// Another worker holds a live lease.
    NotClaimed,
    /// Terminal or cancelled before processing could start.
    Skipped { status: BatchStatus },
    /// Renewal failed; processing stopped without a terminal write.
    LeaseLost,
    /// Shutdown fired mid-batch; the batch stays `Processing` for the next claim.
    Interrupted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub candidates: usize,
    pub outcomes: Vec<(BatchId, BatchOutcome)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub polls: u64,
    pub batches_claimed: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub batches_requeued: u64,
    pub batches_interrupted: u64,
    pub leases_lost: u64,
    pub lock_conflicts: u64,
    pub activities_succeeded: u64,
    pub activities_failed: u64,
    pub total_emissions: f64,
    pub workers_active: usize,
    pub pending_batches: usize,
    pub last_poll_at: Option<DateTime<Utc>>,
}

type BatchTasks = JoinSet<(BatchId, CoordinatorResult<BatchOutcome>)>;

/// Removes its batch from the in-flight set on drop.
struct InFlight {
    set: Arc<Mutex<HashSet<BatchId>>>,
    id: BatchId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[derive(Clone)]
pub struct BatchCoordinator {
    store: Arc<dyn BatchStore>,
    processor: Arc<dyn ActivityProcessor>,
    config: CoordinatorConfig,
    random: Arc<dyn RandomSource>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<BatchId>>>,
    stats: Arc<Mutex<CoordinatorStats>>,
}

impl core::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    pub fn new(
        store: Arc<dyn BatchStore>,
        processor: Arc<dyn ActivityProcessor>,
        mut config: CoordinatorConfig,
    ) -> Self {
        config.worker_pool_size = config.worker_pool_size.max(1);
        config.max_batches_per_poll = config.max_batches_per_poll.max(1);
        Self {
            store,
            processor,
            permits: Arc::new(Semaphore::new(config.worker_pool_size)),
            config,
            random: Arc::new(ThreadRandom),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            stats: Arc::new(Mutex::new(CoordinatorStats::default())),
        }
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.workers_active = self.config.worker_pool_size - self.permits.available_permits();
        stats
    }

    fn record(&self, update: impl FnOnce(&mut CoordinatorStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Validate and persist a new `Pending` batch with one ref per activity.
    #[instrument(skip_all, fields(org_id = %submit.org_id), err)]
    pub async fn submit_batch(&self, submit: SubmitBatch) -> CoordinatorResult<BatchId> {
        let activities = submit.activities()?;
        let count = u32::try_from(activities.len())
            .map_err(|_| DomainError::validation("too many activities in one batch"))?;
        let job = BatchJob::pending(BatchId::new(), &submit, count, Utc::now());
        let id = self.store.create_batch_with_activities(job, &activities).await?;
        info!(batch_id = %id, activity_count = count, "batch submitted");
        Ok(id)
    }

    pub async fn get_batch(&self, id: BatchId) -> CoordinatorResult<BatchJob> {
        Ok(self.store.get_batch(id).await?)
    }

    pub async fn batch_detail(&self, id: BatchId) -> CoordinatorResult<BatchDetail> {
        Ok(self.store.get_batch(id).await?.into())
    }

    pub async fn list_batches(&self, org_id: OrgId, filter: &BatchFilter) -> CoordinatorResult<Vec<BatchJob>> {
        Ok(self.store.list_batches(org_id, filter).await?)
    }

    pub async fn get_progress_log(&self, id: BatchId) -> CoordinatorResult<Vec<ProgressLogEntry>> {
        Ok(self.store.get_progress_log(id).await?)
    }

    /// `Pending → Queued`. Queuing an already queued batch is a no-op.
    pub async fn queue_batch(&self, id: BatchId) -> CoordinatorResult<()> {
        let job = self.store.get_batch(id).await?;
        if !job.status.is_waiting() {
            return Err(DomainError::conflict(format!("batch {id} is {}; cannot queue", job.status)).into());
        }
        self.store.update_status(id, BatchStatus::Queued, None).await?;
        Ok(())
    }

    /// Cancel a batch that has not started processing.
    pub async fn cancel_batch(&self, id: BatchId) -> CoordinatorResult<()> {
        let job = self.store.get_batch(id).await?;
        if !job.status.is_waiting() {
            return Err(DomainError::conflict(format!("batch {id} is {}; cannot cancel", job.status)).into());
        }
        self.store.update_status(id, BatchStatus::Cancelled, None).await?;
        info!(batch_id = %id, "batch cancelled");
        Ok(())
    }

    /// One claim pass. Waits for every batch it started.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> CoordinatorResult<PollReport> {
        let mut tasks = BatchTasks::new();
        let candidates = self.claim(shutdown, &mut tasks).await?;
        let mut report = PollReport {
            candidates,
            outcomes: Vec::new(),
        };
        while let Some(joined) = tasks.join_next().await {
            if let Some((id, Ok(outcome))) = self.finished(joined) {
                report.outcomes.push((id, outcome));
            }
        }
        Ok(report)
    }

    /// Poll every `polling_interval + random(polling_jitter)` until shutdown,
    /// then wait for in-flight batches.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            pool = self.config.worker_pool_size,
            interval = ?self.config.polling_interval,
            "batch coordinator started"
        );
        let mut tasks = BatchTasks::new();
        loop {
            if let Err(e) = self.claim(&shutdown, &mut tasks).await {
                warn!(error = %e, "batch poll failed");
            }
            while let Some(joined) = tasks.try_join_next() {
                self.finished(joined);
            }

            let wait = self.config.polling_interval + self.random.jitter(self.config.polling_jitter);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        while let Some(joined) = tasks.join_next().await {
            self.finished(joined);
        }
        info!(worker_id = %self.config.worker_id, "batch coordinator stopped");
    }

    /// List candidates and spawn a task per batch as pool permits free up.
    async fn claim(&self, shutdown: &CancellationToken, tasks: &mut BatchTasks) -> CoordinatorResult<usize> {
        let limit = self.config.max_batches_per_poll;
        let mut candidates = self.store.get_pending_batches(limit).await?;
        let pending = candidates.len();
        if candidates.len() < limit {
            candidates.extend(self.store.get_reclaimable_batches(limit - candidates.len()).await?);
        }
        self.record(|s| {
            s.polls += 1;
            s.pending_batches = pending;
            s.last_poll_at = Some(Utc::now());
        });
        debug!(pending, reclaimable = candidates.len() - pending, "polled batches");

        let total = candidates.len();
        for batch in candidates {
            let Some(in_flight) = self.enter(batch.id) else {
                continue;
            };
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let this = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let _in_flight = in_flight;
                (batch.id, this.process_batch(batch.id, &shutdown).await)
            });
        }
        Ok(total)
    }

    fn enter(&self, id: BatchId) -> Option<InFlight> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(id).then(|| InFlight {
            set: self.in_flight.clone(),
            id,
        })
    }

    fn finished(
        &self,
        joined: Result<(BatchId, CoordinatorResult<BatchOutcome>), JoinError>,
    ) -> Option<(BatchId, CoordinatorResult<BatchOutcome>)> {
        match joined {
            Ok((id, Err(e))) => {
                error!(batch_id = %id, error = %e, "batch processing failed");
                Some((id, Err(e)))
            }
            Ok(done) => Some(done),
            Err(e) => {
                error!(error = %e, "batch task panicked");
                None
            }
        }
    }

    /// Claim `batch_id` and process its pending activities.
    ///
    /// The lease is released afterwards unless it was lost.
    #[instrument(skip(self, shutdown), fields(worker_id = %self.config.worker_id))]
    pub async fn process_batch(
        &self,
        batch_id: BatchId,
        shutdown: &CancellationToken,
    ) -> CoordinatorResult<BatchOutcome> {
        // Taken before the write so the local expiry never runs past the store's.
        let leased_at = Instant::now();
        let acquired = self
            .store
            .acquire_lock(batch_id, &self.config.worker_id, self.config.lease_duration)
            .await?;
        if !acquired {
            debug!("lease held elsewhere");
            self.record(|s| s.lock_conflicts += 1);
            return Ok(BatchOutcome::NotClaimed);
        }
        self.record(|s| s.batches_claimed += 1);

        let result = self.process_leased(batch_id, leased_at, shutdown).await;
        if !matches!(result, Ok(BatchOutcome::LeaseLost)) {
            if let Err(e) = self.store.release_lock(batch_id).await {
                warn!(error = %e, "failed to release lease");
            }
        }
        result
    }

    async fn process_leased(
        &self,
        batch_id: BatchId,
        leased_at: Instant,
        shutdown: &CancellationToken,
    ) -> CoordinatorResult<BatchOutcome> {
        let current = self.store.get_batch(batch_id).await?;
        if current.status.is_terminal() {
            return Ok(BatchOutcome::Skipped { status: current.status });
        }
        self.store.update_status(batch_id, BatchStatus::Processing, None).await?;
        // Re-read: a cancel may have landed between the lease and the update.
        let job = self.store.get_batch(batch_id).await?;
        if job.status != BatchStatus::Processing {
            return Ok(BatchOutcome::Skipped { status: job.status });
        }
        info!(
            activity_count = job.activity_count,
            already_processed = job.processed(),
            retry_count = job.retry_count,
            "processing batch"
        );

        let token = shutdown.child_token();
        let _cancel_on_return = token.clone().drop_guard();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let keeper = LeaseKeeper {
            store: self.store.clone(),
            batch_id,
            worker_id: self.config.worker_id.clone(),
            lease: self.config.lease_duration,
            every: self.config.renewal_interval(),
        };
        let renewal = tokio::spawn(keeper.run(
            leased_at + self.config.lease_duration,
            token.clone(),
            lease_lost.clone(),
        ));

        let worked = self.process_activities(&job, &token).await;
        token.cancel();
        if let Err(e) = renewal.await {
            warn!(error = %e, "lease renewal task failed");
        }

        if lease_lost.load(Ordering::SeqCst) {
            warn!("lease lost; abandoning batch");
            self.record(|s| s.leases_lost += 1);
            return Ok(BatchOutcome::LeaseLost);
        }
        if let Err(e) = worked {
            return self.handle_fatal(&job, e).await;
        }
        if shutdown.is_cancelled() {
            info!("shutdown during batch; leaving it for the next claim");
            self.record(|s| s.batches_interrupted += 1);
            return Ok(BatchOutcome::Interrupted);
        }

        let done = self.store.get_batch(batch_id).await?;
        if done.processed() < done.activity_count {
            let error = format!(
                "{} of {} activities have no recorded outcome",
                done.remaining_activities(),
                done.activity_count
            );
            self.store.fail_batch(batch_id, &error, None).await?;
            error!(%error, "batch failed");
            self.record(|s| s.batches_failed += 1);
            return Ok(BatchOutcome::Failed { error });
        }

        let progress = done.progress();
        self.store
            .update_status(batch_id, BatchStatus::Complete, Some(progress))
            .await?;
        info!(
            success_count = progress.success_count,
            error_count = progress.error_count,
            total_emissions = progress.total_emissions,
            "batch complete"
        );
        self.record(|s| s.batches_processed += 1);
        Ok(BatchOutcome::Completed {
            success_count: progress.success_count,
            error_count: progress.error_count,
            total_emissions: progress.total_emissions,
        })
    }

    /// Run pending activities with up to `job.concurrency` in flight.
    ///
    /// Stops as soon as `token` fires; outcomes that arrive after that are
    /// not written.
    async fn process_activities(&self, job: &BatchJob, token: &CancellationToken) -> BatchStoreResult<()> {
        let pending: Vec<ActivityId> = self
            .store
            .list_activity_refs(job.id)
            .await?
            .into_iter()
            .filter(|r| r.status == ActivityStatus::Pending)
            .map(|r| r.activity_id)
            .collect();
        debug!(pending = pending.len(), concurrency = job.concurrency, "processing activities");

        let concurrency = usize::try_from(job.concurrency).unwrap_or(1).max(1);
        let processor = &self.processor;
        let mut results = std::pin::pin!(
            stream::iter(pending)
                .map(|activity| {
                    let cancel = token.clone();
                    async move {
                        let outcome = processor.process(job, &activity, cancel).await;
                        (activity, outcome)
                    }
                })
                .buffer_unordered(concurrency)
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = results.next() => next,
            };
            let Some((activity, outcome)) = next else {
                break;
            };
            if token.is_cancelled() {
                break;
            }
            match outcome {
                Ok(emissions) if emissions.is_finite() => {
                    if self.store.mark_activity_complete(job.id, &activity, emissions).await? {
                        self.record(|s| {
                            s.activities_succeeded += 1;
                            s.total_emissions += emissions;
                        });
                    }
                }
                Ok(emissions) => {
                    let error = format!("non-finite emissions: {emissions}");
                    self.mark_failed(job.id, &activity, &error).await?;
                }
                Err(error) => self.mark_failed(job.id, &activity, &error).await?,
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, batch_id: BatchId, activity: &ActivityId, error: &str) -> BatchStoreResult<()> {
        debug!(%activity, %error, "activity failed");
        if self.store.mark_activity_failed(batch_id, activity, error).await? {
            self.record(|s| s.activities_failed += 1);
        }
        Ok(())
    }

    /// Requeue while retries remain, otherwise fail the batch.
    async fn handle_fatal(&self, job: &BatchJob, cause: BatchStoreError) -> CoordinatorResult<BatchOutcome> {
        let error = cause.to_string();
        if job.can_retry() {
            self.store.requeue_batch(job.id, &error).await?;
            warn!(%error, retry_count = job.retry_count + 1, max_retries = job.max_retries, "batch requeued");
            self.record(|s| s.batches_requeued += 1);
            Ok(BatchOutcome::Requeued { error })
        } else {
            self.store.fail_batch(job.id, &error, None).await?;
            error!(%error, retry_count = job.retry_count, "batch failed; retries exhausted");
            self.record(|s| s.batches_failed += 1);
            Ok(BatchOutcome::Failed { error })
        }
    }
}

/// Keeps one batch lease alive while it is being processed.
struct LeaseKeeper {
    store: Arc<dyn BatchStore>,
    batch_id: BatchId,
    worker_id: WorkerId,
    lease: Duration,
    every: Duration,
}

impl LeaseKeeper {
    /// Re-acquire the lease every `every` until `token` fires.
    ///
    /// `expires_at` is the last confirmed expiry. A `false` renewal means
    /// another worker took over; a run of failed renewals that outlasts
    /// `expires_at` means one may have. Either way raise `lost` and cancel
    /// processing.
    async fn run(self, mut expires_at: Instant, token: CancellationToken, lost: Arc<AtomicBool>) {
        let batch_id = self.batch_id;
        let fence = |reason: &str| {
            warn!(%batch_id, reason, "lease lost");
            lost.store(true, Ordering::SeqCst);
            token.cancel();
        };
        loop {
            let wake = (Instant::now() + self.every).min(expires_at);
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(wake) => {}
            }
            if Instant::now() >= expires_at {
                fence("lease expired before it could be renewed");
                return;
            }
            let attempted_at = Instant::now();
            match self.store.acquire_lock(batch_id, &self.worker_id, self.lease).await {
                Ok(true) => {
                    expires_at = attempted_at + self.lease;
                    debug!(%batch_id, "lease renewed");
                }
                Ok(false) => {
                    fence("lease taken by another worker");
                    return;
                }
                Err(e) => warn!(%batch_id, error = %e, "lease renewal failed"),
            }
        }
    }
}
