use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchflow_core::{ActivityId, BatchId};

use crate::status::ActivityStatus;

/// Link from an activity to the batch that processes it.
///
/// Leaves `Pending` exactly once. Later marks are ignored so a reclaimed batch
/// can replay its activity list without double counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRef {
    pub batch_id: BatchId,
    pub activity_id: ActivityId,
    pub status: ActivityStatus,
    pub error_message: Option<String>,
    pub emissions: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ActivityRef {
    pub fn pending(batch_id: BatchId, activity_id: ActivityId, now: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            activity_id,
            status: ActivityStatus::Pending,
            error_message: None,
            emissions: None,
            created_at: now,
        }
    }

    /// Returns `true` when the ref moved out of `Pending`.
    pub fn mark_complete(&mut self, emissions: f64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ActivityStatus::Complete;
        self.emissions = Some(emissions);
        true
    }

    /// Returns `true` when the ref moved out of `Pending`.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ActivityStatus::Failed;
        self.error_message = Some(error.into());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity() -> ActivityRef {
        ActivityRef::pending(BatchId::new(), ActivityId::parse("a1").unwrap(), Utc::now())
    }

    #[test]
    fn first_mark_wins() {
        let mut r = activity();
        assert!(r.mark_complete(12.5));
        assert!(!r.mark_failed("late"));
        assert_eq!(r.status, ActivityStatus::Complete);
        assert_eq!(r.emissions, Some(12.5));
        assert_eq!(r.error_message, None);
    }

    #[test]
    fn failure_records_message() {
        let mut r = activity();
        assert!(r.mark_failed("factor missing"));
        assert!(!r.mark_complete(1.0));
        assert_eq!(r.error_message.as_deref(), Some("factor missing"));
        assert_eq!(r.emissions, None);
    }
}
