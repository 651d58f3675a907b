//! Worker health summary.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::coordinator::CoordinatorStats;
use crate::scheduler::SchedulerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub scheduler_running: bool,
    pub loops_alive: usize,
    pub loops_total: usize,
    pub workers_active: usize,
    pub batches_processed: u64,
    pub pending_batches: usize,
    pub total_emissions: f64,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Healthy while every scheduled loop is alive.
    pub fn from_stats(scheduler: &SchedulerStats, coordinator: &CoordinatorStats) -> Self {
        let loops_total = scheduler.jobs.len();
        let loops_alive = scheduler.jobs.iter().filter(|j| j.running).count();
        let status = if loops_alive == loops_total {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Self {
            status,
            scheduler_running: loops_alive > 0,
            loops_alive,
            loops_total,
            workers_active: coordinator.workers_active,
            batches_processed: coordinator.batches_processed,
            pending_batches: coordinator.pending_batches,
            total_emissions: coordinator.total_emissions,
            timestamp: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobLoopStats;

    fn job(name: &str, running: bool) -> JobLoopStats {
        JobLoopStats {
            job: name.to_string(),
            running,
            ..JobLoopStats::default()
        }
    }

    #[test]
    fn degraded_when_a_loop_died() {
        let coordinator = CoordinatorStats {
            batches_processed: 4,
            ..CoordinatorStats::default()
        };
        let healthy = HealthReport::from_stats(
            &SchedulerStats {
                jobs: vec![job("alerts", true), job("sweep", true)],
            },
            &coordinator,
        );
        assert!(healthy.is_healthy());
        assert_eq!(healthy.batches_processed, 4);

        let degraded = HealthReport::from_stats(
            &SchedulerStats {
                jobs: vec![job("alerts", true), job("sweep", false)],
            },
            &coordinator,
        );
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert_eq!((degraded.loops_alive, degraded.loops_total), (1, 2));
        assert_eq!(serde_json::to_value(&degraded).unwrap()["status"], "degraded");
    }
}
