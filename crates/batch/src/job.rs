use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use batchflow_core::{ActivityId, BatchId, DomainError, DomainResult, OrgId, WorkerId, WorkspaceId};

use crate::status::BatchStatus;
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY};

/// Counters reported alongside a status change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub success_count: u32,
    pub error_count: u32,
    pub total_emissions: f64,
}

/// Submission request: an activity set plus scheduling hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBatch {
    pub org_id: OrgId,
    pub workspace_id: WorkspaceId,
    pub activity_ids: Vec<String>,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubmitBatch {
    pub fn new(org_id: OrgId, workspace_id: WorkspaceId, activity_ids: Vec<String>) -> Self {
        Self {
            org_id,
            workspace_id,
            activity_ids,
            concurrency: None,
            priority: None,
            max_retries: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Parse and de-duplicate the activity list, keeping first-seen order.
    pub fn activities(&self) -> DomainResult<Vec<ActivityId>> {
        let mut out: Vec<ActivityId> = Vec::with_capacity(self.activity_ids.len());
        for raw in &self.activity_ids {
            let id = ActivityId::parse(raw)?;
            if !out.contains(&id) {
                out.push(id);
            }
        }
        if out.is_empty() {
            return Err(DomainError::validation("activity_ids must not be empty"));
        }
        Ok(out)
    }
}

/// A batch job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: BatchId,
    pub org_id: OrgId,
    pub workspace_id: WorkspaceId,
    pub status: BatchStatus,
    pub activity_count: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub total_emissions: f64,
    pub concurrency: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: i32,
    pub locked_by: Option<WorkerId>,
    pub locked_until: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl BatchJob {
    /// Fresh `Pending` record for a validated submission.
    pub fn pending(id: BatchId, submit: &SubmitBatch, activity_count: u32, now: DateTime<Utc>) -> Self {
        let concurrency = submit
            .concurrency
            .unwrap_or(1)
            .clamp(1, activity_count.max(1));
        Self {
            id,
            org_id: submit.org_id,
            workspace_id: submit.workspace_id,
            status: BatchStatus::Pending,
            activity_count,
            success_count: 0,
            error_count: 0,
            total_emissions: 0.0,
            concurrency,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: submit.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            priority: submit.priority.unwrap_or(DEFAULT_PRIORITY),
            locked_by: None,
            locked_until: None,
            error_message: None,
        }
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            success_count: self.success_count,
            error_count: self.error_count,
            total_emissions: self.total_emissions,
        }
    }

    pub fn processed(&self) -> u32 {
        self.success_count + self.error_count
    }

    pub fn remaining_activities(&self) -> u32 {
        self.activity_count.saturating_sub(self.processed())
    }

    /// Fraction of activities that reached a terminal state, in `0.0..=1.0`.
    pub fn progress_ratio(&self) -> f64 {
        if self.activity_count == 0 {
            return 0.0;
        }
        f64::from(self.processed()) / f64::from(self.activity_count)
    }

    pub fn duration(&self) -> Option<Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    pub fn avg_emissions_per_activity(&self) -> Option<f64> {
        (self.success_count > 0).then(|| self.total_emissions / f64::from(self.success_count))
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// A lease is held iff it has a holder and has not expired yet.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.locked_until.is_some_and(|until| until >= now)
    }

    /// Waiting batch with no live lease.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && !self.is_locked_at(now)
    }

    /// `Processing` batch whose holder stopped renewing.
    pub fn is_reclaimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == BatchStatus::Processing && !self.is_locked_at(now)
    }

    /// Compare-and-set on the lease fields.
    ///
    /// Applies iff the lease is free, expired, or already held by `worker`.
    /// Returns whether the write took effect.
    pub fn try_lease(&mut self, worker: &WorkerId, until: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let free = match (&self.locked_by, self.locked_until) {
            (None, _) => true,
            (Some(holder), _) if holder == worker => true,
            (Some(_), None) => true,
            (Some(_), Some(expiry)) => expiry < now,
        };
        if free {
            self.locked_by = Some(worker.clone());
            self.locked_until = Some(until);
        }
        free
    }

    pub fn clear_lease(&mut self) {
        self.locked_by = None;
        self.locked_until = None;
    }

    /// Apply a status change with optional counters.
    ///
    /// Returns `Ok(false)` without touching the record when it is already
    /// terminal. Counters are merged upwards only; a report that would push
    /// `success + error` past `activity_count` is rejected.
    pub fn apply_status(
        &mut self,
        next: BatchStatus,
        progress: Option<&BatchProgress>,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        let merged = match progress {
            Some(p) => Some(self.merged_progress(p)?),
            None => None,
        };

        self.status = next;
        self.updated_at = now;
        if next == BatchStatus::Processing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.stamps_completion() {
            self.completed_at = Some(now);
        }
        if let Some(p) = merged {
            self.success_count = p.success_count;
            self.error_count = p.error_count;
            self.total_emissions = p.total_emissions;
        }
        Ok(true)
    }

    fn merged_progress(&self, reported: &BatchProgress) -> DomainResult<BatchProgress> {
        let merged = BatchProgress {
            success_count: self.success_count.max(reported.success_count),
            error_count: self.error_count.max(reported.error_count),
            total_emissions: self.total_emissions.max(reported.total_emissions),
        };
        if u64::from(merged.success_count) + u64::from(merged.error_count)
            > u64::from(self.activity_count)
        {
            return Err(DomainError::invariant(format!(
                "progress {}+{} exceeds activity_count {}",
                merged.success_count, merged.error_count, self.activity_count
            )));
        }
        Ok(merged)
    }

    /// Count one successful activity and its emissions.
    pub fn record_success(&mut self, emissions: f64, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_unaccounted()?;
        self.success_count += 1;
        self.total_emissions += emissions;
        self.updated_at = now;
        Ok(())
    }

    /// Count one failed activity.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_unaccounted()?;
        self.error_count += 1;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_unaccounted(&self) -> DomainResult<()> {
        if self.processed() >= self.activity_count {
            return Err(DomainError::invariant(format!(
                "batch {} already accounted for all {} activities",
                self.id, self.activity_count
            )));
        }
        Ok(())
    }

    /// `Processing → Queued` after a failed pass; consumes one retry.
    pub fn requeue(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != BatchStatus::Processing {
            return Err(DomainError::invalid_transition(self.status, BatchStatus::Queued));
        }
        self.status = BatchStatus::Queued;
        self.retry_count += 1;
        self.error_message = Some(error.into());
        self.updated_at = now;
        self.clear_lease();
        Ok(())
    }

    /// Terminal failure with a diagnostic message. No-op when already terminal.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        progress: Option<&BatchProgress>,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let applied = self.apply_status(BatchStatus::Failed, progress, now)?;
        if applied {
            self.error_message = Some(error.into());
        }
        Ok(applied)
    }
}

/// Read view with derived progress figures, for reporting surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchDetail {
    #[serde(flatten)]
    pub job: BatchJob,
    pub progress_percent: f64,
    pub remaining_activities: u32,
    pub duration_ms: Option<i64>,
    pub avg_emissions_per_activity: Option<f64>,
}

impl From<BatchJob> for BatchDetail {
    fn from(job: BatchJob) -> Self {
        Self {
            progress_percent: job.progress_ratio() * 100.0,
            remaining_activities: job.remaining_activities(),
            duration_ms: job.duration().map(|d| d.num_milliseconds()),
            avg_emissions_per_activity: job.avg_emissions_per_activity(),
            job,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn job(activities: u32) -> BatchJob {
        let ids = (0..activities).map(|i| format!("a{i}")).collect();
        let submit = SubmitBatch::new(OrgId::new(), WorkspaceId::new(), ids);
        BatchJob::pending(BatchId::new(), &submit, activities, t0())
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::parse(name).unwrap()
    }

    #[test]
    fn submission_dedupes_and_rejects_empty() {
        let submit = SubmitBatch::new(
            OrgId::new(),
            WorkspaceId::new(),
            vec!["a".into(), "b".into(), " a ".into()],
        );
        let ids: Vec<_> = submit.activities().unwrap().iter().map(|a| a.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let empty = SubmitBatch::new(OrgId::new(), WorkspaceId::new(), vec![]);
        assert!(matches!(empty.activities(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn submission_defaults_apply() {
        let j = job(3);
        assert_eq!(j.priority, DEFAULT_PRIORITY);
        assert_eq!(j.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(j.concurrency, 1);

        let submit = SubmitBatch::new(OrgId::new(), WorkspaceId::new(), vec!["x".into()])
            .with_concurrency(16);
        let j = BatchJob::pending(BatchId::new(), &submit, 1, t0());
        assert_eq!(j.concurrency, 1, "clamped to activity_count");
    }

    #[test]
    fn started_at_is_stamped_once() {
        let mut j = job(2);
        j.apply_status(BatchStatus::Processing, None, t0()).unwrap();
        let later = t0() + Duration::seconds(30);
        j.apply_status(BatchStatus::Processing, None, later).unwrap();
        assert_eq!(j.started_at, Some(t0()));
        assert_eq!(j.updated_at, later);
        assert_eq!(j.completed_at, None);
    }

    #[test]
    fn terminal_update_is_a_noop() {
        let mut j = job(1);
        j.apply_status(BatchStatus::Processing, None, t0()).unwrap();
        let done_at = t0() + Duration::seconds(5);
        assert!(j.apply_status(BatchStatus::Complete, None, done_at).unwrap());

        let applied = j
            .apply_status(BatchStatus::Failed, None, done_at + Duration::seconds(1))
            .unwrap();
        assert!(!applied);
        assert_eq!(j.status, BatchStatus::Complete);
        assert_eq!(j.completed_at, Some(done_at));
    }

    #[test]
    fn cancelled_does_not_stamp_completion() {
        let mut j = job(1);
        j.apply_status(BatchStatus::Cancelled, None, t0()).unwrap();
        assert!(j.status.is_terminal());
        assert_eq!(j.completed_at, None);
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let mut j = job(1);
        let err = j.apply_status(BatchStatus::Complete, None, t0()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(j.status, BatchStatus::Pending);
    }

    #[test]
    fn progress_merge_never_lowers_counters() {
        let mut j = job(4);
        j.apply_status(BatchStatus::Processing, None, t0()).unwrap();
        j.record_success(2.0, t0()).unwrap();
        j.record_failure(t0()).unwrap();

        let stale = BatchProgress { success_count: 0, error_count: 0, total_emissions: 0.0 };
        j.apply_status(BatchStatus::Processing, Some(&stale), t0()).unwrap();
        assert_eq!((j.success_count, j.error_count), (1, 1));
        assert_eq!(j.total_emissions, 2.0);

        let too_much = BatchProgress { success_count: 4, error_count: 1, total_emissions: 9.0 };
        assert!(j.apply_status(BatchStatus::Complete, Some(&too_much), t0()).is_err());
        assert_eq!(j.status, BatchStatus::Processing);
    }

    #[test]
    fn lease_cas_rules() {
        let mut j = job(1);
        let until = t0() + Duration::seconds(30);
        assert!(j.try_lease(&worker("w1"), until, t0()));
        assert!(!j.try_lease(&worker("w2"), until, t0()));
        assert!(j.try_lease(&worker("w1"), until + Duration::seconds(30), t0()), "holder renews");

        let after_expiry = until + Duration::seconds(31);
        assert!(!j.is_locked_at(after_expiry));
        assert!(j.try_lease(&worker("w2"), after_expiry + Duration::seconds(30), after_expiry));
        assert_eq!(j.locked_by, Some(worker("w2")));
    }

    #[test]
    fn requeue_consumes_a_retry_and_frees_the_lease() {
        let mut j = job(1);
        j.try_lease(&worker("w1"), t0() + Duration::seconds(30), t0());
        j.apply_status(BatchStatus::Processing, None, t0()).unwrap();
        j.requeue("store timeout", t0()).unwrap();
        assert_eq!(j.status, BatchStatus::Queued);
        assert_eq!(j.retry_count, 1);
        assert!(j.is_claimable_at(t0()));
        assert!(j.requeue("again", t0()).is_err());
    }

    #[test]
    fn detail_derives_figures() {
        let mut j = job(4);
        j.apply_status(BatchStatus::Processing, None, t0()).unwrap();
        j.record_success(3.0, t0()).unwrap();
        j.record_success(5.0, t0()).unwrap();
        j.record_failure(t0()).unwrap();
        j.apply_status(BatchStatus::Complete, None, t0() + Duration::seconds(2)).unwrap();

        let detail = BatchDetail::from(j);
        assert_eq!(detail.progress_percent, 75.0);
        assert_eq!(detail.remaining_activities, 1);
        assert_eq!(detail.duration_ms, Some(2000));
        assert_eq!(detail.avg_emissions_per_activity, Some(4.0));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn counters_stay_monotonic_and_bounded(
            activity_count in 1u32..40,
            outcomes in prop::collection::vec(any::<bool>(), 0..80),
        ) {
            let mut j = job(activity_count);
            j.apply_status(BatchStatus::Processing, None, t0()).unwrap();
            let mut last = 0;
            for ok in outcomes {
                let accepted = if ok {
                    j.record_success(1.0, t0()).is_ok()
                } else {
                    j.record_failure(t0()).is_ok()
                };
                prop_assert_eq!(accepted, last < activity_count);
                prop_assert!(j.processed() >= last);
                prop_assert!(j.processed() <= activity_count);
                last = j.processed();
            }
        }

        #[test]
        fn terminal_status_is_frozen(
            terminal in prop::sample::select(vec![BatchStatus::Complete, BatchStatus::Failed]),
            attempts in prop::collection::vec(prop::sample::select(BatchStatus::ALL.to_vec()), 1..10),
        ) {
            let mut j = job(2);
            j.apply_status(BatchStatus::Processing, None, t0()).unwrap();
            j.apply_status(terminal, None, t0()).unwrap();
            let completed_at = j.completed_at;
            for (i, next) in attempts.into_iter().enumerate() {
                let at = t0() + Duration::seconds(i as i64 + 1);
                prop_assert_eq!(j.apply_status(next, None, at), Ok(false));
                prop_assert_eq!(j.status, terminal);
                prop_assert_eq!(j.completed_at, completed_at);
            }
        }
    }
}
