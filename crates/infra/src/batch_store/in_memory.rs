//! In-memory batch store for tests/dev.
//!
//! All state sits behind one `RwLock`; every operation runs inside a single
//! critical section, which is what makes the lease compare-and-set and the
//! ref-plus-counter writes atomic here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use batchflow_batch::{
    ActivityRef, BatchFilter, BatchJob, BatchProgress, BatchStatus, ProgressLogEntry,
};
use batchflow_core::{ActivityId, BatchId, DomainError, OrgId, WorkerId};

use super::{BatchStore, BatchStoreError, BatchStoreResult};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Default)]
struct State {
    batches: HashMap<BatchId, BatchJob>,
    refs: HashMap<BatchId, Vec<ActivityRef>>,
    log: HashMap<BatchId, Vec<ProgressLogEntry>>,
    next_log_id: i64,
}

impl State {
    fn append_log(&mut self, job: &BatchJob, event_type: &str) {
        self.next_log_id += 1;
        let entry = ProgressLogEntry::snapshot(self.next_log_id, job, event_type);
        self.log.entry(job.id).or_default().push(entry);
    }

    fn batch_mut(&mut self, id: BatchId) -> BatchStoreResult<&mut BatchJob> {
        self.batches.get_mut(&id).ok_or(BatchStoreError::NotFound(id))
    }

    fn insert(&mut self, mut job: BatchJob, now: chrono::DateTime<chrono::Utc>) -> BatchStoreResult<BatchId> {
        if self.batches.contains_key(&job.id) {
            return Err(BatchStoreError::AlreadyExists(job.id.to_string()));
        }
        job.created_at = now;
        job.updated_at = now;
        let id = job.id;
        self.append_log(&job, job.status.as_str());
        self.batches.insert(id, job);
        self.refs.entry(id).or_default();
        Ok(id)
    }

    fn candidates<F>(&self, limit: usize, pick: F) -> Vec<BatchJob>
    where
        F: Fn(&BatchJob) -> bool,
    {
        let mut out: Vec<BatchJob> = self.batches.values().filter(|j| pick(j)).cloned().collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        out.truncate(limit);
        out
    }
}

/// In-memory batch store.
#[derive(Debug)]
pub struct InMemoryBatchStore {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> BatchStoreResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| BatchStoreError::Transient("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> BatchStoreResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| BatchStoreError::Transient("in-memory store lock poisoned".into()))
    }

    fn mark(
        &self,
        batch_id: BatchId,
        activity_id: &ActivityId,
        outcome: Result<f64, &str>,
    ) -> BatchStoreResult<bool> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let State { batches, refs, .. } = &mut *state;

        let job = batches
            .get_mut(&batch_id)
            .ok_or(BatchStoreError::NotFound(batch_id))?;
        let activity = refs
            .get_mut(&batch_id)
            .and_then(|list| list.iter_mut().find(|r| &r.activity_id == activity_id))
            .ok_or_else(|| BatchStoreError::ActivityNotFound {
                batch_id,
                activity_id: activity_id.clone(),
            })?;

        if activity.status.is_terminal() {
            debug!(batch_id = %batch_id, activity_id = %activity_id, "activity already marked");
            return Ok(false);
        }
        // Counter first: it is the only step that can refuse.
        match outcome {
            Ok(emissions) => {
                job.record_success(emissions, now)?;
                activity.mark_complete(emissions);
            }
            Err(error) => {
                job.record_failure(now)?;
                activity.mark_failed(error);
            }
        }
        Ok(true)
    }
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn create_batch(&self, job: BatchJob) -> BatchStoreResult<BatchId> {
        let now = self.clock.now();
        self.write()?.insert(job, now)
    }

    async fn create_batch_with_activities(
        &self,
        job: BatchJob,
        activities: &[ActivityId],
    ) -> BatchStoreResult<BatchId> {
        if activities.len() as u64 > u64::from(job.activity_count) {
            return Err(DomainError::conflict(format!(
                "{} activities exceed activity_count {}",
                activities.len(),
                job.activity_count
            ))
            .into());
        }
        let mut seen = HashSet::with_capacity(activities.len());
        if let Some(duplicate) = activities.iter().find(|a| !seen.insert(*a)) {
            return Err(BatchStoreError::AlreadyExists(format!(
                "activity {duplicate} in batch {}",
                job.id
            )));
        }
        let now = self.clock.now();
        let mut state = self.write()?;
        let id = state.insert(job, now)?;
        let refs = activities
            .iter()
            .map(|activity_id| ActivityRef::pending(id, activity_id.clone(), now))
            .collect();
        state.refs.insert(id, refs);
        Ok(id)
    }

    async fn get_batch(&self, id: BatchId) -> BatchStoreResult<BatchJob> {
        self.read()?
            .batches
            .get(&id)
            .cloned()
            .ok_or(BatchStoreError::NotFound(id))
    }

    async fn list_batches(&self, org_id: OrgId, filter: &BatchFilter) -> BatchStoreResult<Vec<BatchJob>> {
        filter.validate()?;
        Ok(filter.apply(org_id, self.read()?.batches.values()))
    }

    async fn update_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        progress: Option<BatchProgress>,
    ) -> BatchStoreResult<()> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let job = state.batch_mut(id)?;
        if job.apply_status(status, progress.as_ref(), now)? {
            let snapshot = job.clone();
            state.append_log(&snapshot, status.as_str());
        } else {
            debug!(batch_id = %id, status = %status, "batch is terminal; status update ignored");
        }
        Ok(())
    }

    async fn add_activity_ref(&self, batch_id: BatchId, activity_id: &ActivityId) -> BatchStoreResult<()> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let capacity = state.batch_mut(batch_id)?.activity_count;
        let list = state.refs.entry(batch_id).or_default();
        if list.iter().any(|r| &r.activity_id == activity_id) {
            return Err(BatchStoreError::AlreadyExists(format!(
                "activity {activity_id} in batch {batch_id}"
            )));
        }
        if list.len() as u64 >= u64::from(capacity) {
            return Err(DomainError::conflict(format!(
                "batch {batch_id} already references {capacity} activities"
            ))
            .into());
        }
        list.push(ActivityRef::pending(batch_id, activity_id.clone(), now));
        Ok(())
    }

    async fn mark_activity_complete(
        &self,
        batch_id: BatchId,
        activity_id: &ActivityId,
        emissions: f64,
    ) -> BatchStoreResult<bool> {
        self.mark(batch_id, activity_id, Ok(emissions))
    }

    async fn mark_activity_failed(
        &self,
        batch_id: BatchId,
        activity_id: &ActivityId,
        error: &str,
    ) -> BatchStoreResult<bool> {
        self.mark(batch_id, activity_id, Err(error))
    }

    async fn list_activity_refs(&self, batch_id: BatchId) -> BatchStoreResult<Vec<ActivityRef>> {
        let state = self.read()?;
        if !state.batches.contains_key(&batch_id) {
            return Err(BatchStoreError::NotFound(batch_id));
        }
        Ok(state.refs.get(&batch_id).cloned().unwrap_or_default())
    }

    async fn get_pending_batches(&self, limit: usize) -> BatchStoreResult<Vec<BatchJob>> {
        let now = self.clock.now();
        Ok(self.read()?.candidates(limit, |j| j.is_claimable_at(now)))
    }

    async fn get_reclaimable_batches(&self, limit: usize) -> BatchStoreResult<Vec<BatchJob>> {
        let now = self.clock.now();
        Ok(self.read()?.candidates(limit, |j| j.is_reclaimable_at(now)))
    }

    async fn acquire_lock(
        &self,
        batch_id: BatchId,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> BatchStoreResult<bool> {
        let now = self.clock.now();
        let until = now + chrono::Duration::from_std(lease).map_err(|e| DomainError::validation(e.to_string()))?;
        let mut state = self.write()?;
        Ok(state.batch_mut(batch_id)?.try_lease(worker_id, until, now))
    }

    async fn release_lock(&self, batch_id: BatchId) -> BatchStoreResult<()> {
        self.write()?.batch_mut(batch_id)?.clear_lease();
        Ok(())
    }

    async fn requeue_batch(&self, batch_id: BatchId, error: &str) -> BatchStoreResult<()> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let job = state.batch_mut(batch_id)?;
        job.requeue(error, now)?;
        let snapshot = job.clone();
        state.append_log(&snapshot, ProgressLogEntry::REQUEUED);
        Ok(())
    }

    async fn fail_batch(
        &self,
        batch_id: BatchId,
        error: &str,
        progress: Option<BatchProgress>,
    ) -> BatchStoreResult<()> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let job = state.batch_mut(batch_id)?;
        if job.fail(error, progress.as_ref(), now)? {
            let snapshot = job.clone();
            state.append_log(&snapshot, BatchStatus::Failed.as_str());
        }
        Ok(())
    }

    async fn delete_batch(&self, id: BatchId) -> BatchStoreResult<()> {
        let mut state = self.write()?;
        if state.batches.remove(&id).is_none() {
            return Err(BatchStoreError::NotFound(id));
        }
        state.refs.remove(&id);
        state.log.remove(&id);
        Ok(())
    }

    async fn get_progress_log(&self, id: BatchId) -> BatchStoreResult<Vec<ProgressLogEntry>> {
        let state = self.read()?;
        if !state.batches.contains_key(&id) {
            return Err(BatchStoreError::NotFound(id));
        }
        Ok(state.log.get(&id).cloned().unwrap_or_default())
    }
}
