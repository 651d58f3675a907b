use core::str::FromStr;

use serde::{Deserialize, Serialize};

use batchflow_core::DomainError;

/// Lifecycle state of a batch job.
///
/// `Pending → Queued → Processing → {Complete | Failed}`. `Cancelled` is an
/// operator exit from the two waiting states. Terminal states are frozen.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Queued,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 6] = [
        BatchStatus::Pending,
        BatchStatus::Queued,
        BatchStatus::Processing,
        BatchStatus::Complete,
        BatchStatus::Failed,
        BatchStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Complete => "complete",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Complete | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }

    /// Waiting for a worker (eligible for a fresh claim).
    pub fn is_waiting(&self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Queued)
    }

    /// Whether entering this state stamps `completed_at`.
    pub fn stamps_completion(&self) -> bool {
        matches!(self, BatchStatus::Complete | BatchStatus::Failed)
    }

    /// Edges of the lifecycle graph.
    ///
    /// Re-entering the current non-terminal state is allowed (progress-only
    /// updates and reclaim of an abandoned `Processing` batch).
    /// `Processing → Queued` is the requeue edge.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        match (self, next) {
            (Complete | Failed | Cancelled, _) => false,
            (_, Pending) => *self == Pending,
            (Pending, Queued | Processing | Failed | Cancelled) => true,
            (Queued, Queued | Processing | Failed | Cancelled) => true,
            (Processing, Processing | Queued | Complete | Failed) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown batch status: {s}")))
    }
}

/// Per-activity state inside a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Complete,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Pending => "pending",
            ActivityStatus::Complete => "complete",
            ActivityStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActivityStatus::Pending)
    }
}

impl core::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActivityStatus::Pending),
            "complete" => Ok(ActivityStatus::Complete),
            "failed" => Ok(ActivityStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown activity status: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_round_trips() {
        for status in BatchStatus::ALL {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
        assert!("done".parse::<BatchStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&BatchStatus::Processing).unwrap(),
            "\"processing\""
        );
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [BatchStatus::Complete, BatchStatus::Failed, BatchStatus::Cancelled] {
            for to in BatchStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn nothing_returns_to_pending() {
        for from in [BatchStatus::Queued, BatchStatus::Processing] {
            assert!(!from.can_transition_to(BatchStatus::Pending));
        }
        assert!(BatchStatus::Pending.can_transition_to(BatchStatus::Pending));
    }

    #[test]
    fn happy_path_edges() {
        assert!(BatchStatus::Pending.can_transition_to(BatchStatus::Queued));
        assert!(BatchStatus::Queued.can_transition_to(BatchStatus::Processing));
        assert!(BatchStatus::Processing.can_transition_to(BatchStatus::Complete));
        assert!(BatchStatus::Processing.can_transition_to(BatchStatus::Queued));
        assert!(!BatchStatus::Processing.can_transition_to(BatchStatus::Cancelled));
        assert!(!BatchStatus::Queued.can_transition_to(BatchStatus::Complete));
    }

    #[test]
    fn only_complete_and_failed_stamp_completion() {
        let stamped: Vec<_> = BatchStatus::ALL
            .into_iter()
            .filter(BatchStatus::stamps_completion)
            .collect();
        assert_eq!(stamped, vec![BatchStatus::Complete, BatchStatus::Failed]);
    }
}
