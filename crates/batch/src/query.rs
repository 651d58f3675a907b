use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchflow_core::{BatchId, DomainError, DomainResult, OrgId};

use crate::job::BatchJob;
use crate::status::BatchStatus;

/// Largest page a listing may request.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Tenant listing filter. `limit == 0` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFilter {
    #[serde(default)]
    pub status: Option<BatchStatus>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl BatchFilter {
    pub fn with_status(mut self, status: BatchStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.limit > MAX_PAGE_SIZE {
            return Err(DomainError::validation(format!(
                "limit must be at most {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    pub fn matches(&self, org_id: OrgId, job: &BatchJob) -> bool {
        job.org_id == org_id && self.status.is_none_or(|s| s == job.status)
    }

    /// Newest first, then the requested window.
    pub fn apply<'a, I>(&self, org_id: OrgId, jobs: I) -> Vec<BatchJob>
    where
        I: IntoIterator<Item = &'a BatchJob>,
    {
        let mut out: Vec<BatchJob> = jobs
            .into_iter()
            .filter(|job| self.matches(org_id, job))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let window = out.into_iter().skip(self.offset);
        if self.limit == 0 {
            window.collect()
        } else {
            window.take(self.limit).collect()
        }
    }
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLogEntry {
    pub id: i64,
    pub batch_id: BatchId,
    pub event_type: String,
    pub processed_count: u32,
    pub error_count: u32,
    pub total_emissions: f64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressLogEntry {
    pub const REQUEUED: &'static str = "requeued";

    /// Snapshot the counters of `job` after a change.
    pub fn snapshot(id: i64, job: &BatchJob, event_type: impl Into<String>) -> Self {
        Self {
            id,
            batch_id: job.id,
            event_type: event_type.into(),
            processed_count: job.success_count,
            error_count: job.error_count,
            total_emissions: job.total_emissions,
            timestamp: job.updated_at,
        }
    }
}
