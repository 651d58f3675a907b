//! Worker wiring: alert dispatcher, scheduled jobs and the batch claim loop.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use batchflow_infra::alerts::AlertQueue;
use batchflow_infra::batch_store::BatchStore;
use batchflow_infra::config::WorkerConfig;
use batchflow_infra::coordinator::{ActivityProcessor, BatchCoordinator, CoordinatorStats};
use batchflow_infra::event_bus::SharedPublisher;
use batchflow_infra::health::HealthReport;
use batchflow_infra::scheduler::{HeartbeatJob, Scheduler, SchedulerHandle};

/// A running worker.
///
/// Batches are claimed only when an [`ActivityProcessor`] is supplied. Without
/// one the claim loop never starts, so submitted batches stay untouched for a
/// worker that can actually process them.
pub struct Worker {
    scheduler: SchedulerHandle,
    dispatcher: JoinHandle<()>,
    claim_loop: Option<(BatchCoordinator, JoinHandle<()>)>,
}

impl Worker {
    pub fn start(
        config: &WorkerConfig,
        store: Arc<dyn BatchStore>,
        bus: SharedPublisher,
        processor: Option<Arc<dyn ActivityProcessor>>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (alerts, dispatcher) = AlertQueue::bounded(config.alert_queue_capacity);
        let dispatcher = dispatcher.with_bus(bus.clone()).spawn(shutdown.clone());

        let heartbeat = Arc::new(HeartbeatJob::new(bus).with_name("alerts"));
        let scheduler = Scheduler::new(alerts)
            .with_job(
                config
                    .jobs
                    .spec(heartbeat, config.heartbeat_interval)
                    .with_tag("maintenance"),
            )
            .start(shutdown);

        let claim_loop = match processor {
            Some(processor) => {
                let coordinator = BatchCoordinator::new(store, processor, config.coordinator.clone());
                let task = tokio::spawn({
                    let coordinator = coordinator.clone();
                    let shutdown = shutdown.clone();
                    async move { coordinator.run(shutdown).await }
                });
                Some((coordinator, task))
            }
            None => {
                warn!("no activity processor configured; batch processing is disabled");
                None
            }
        };

        Self {
            scheduler,
            dispatcher,
            claim_loop,
        }
    }

    pub fn is_processing_batches(&self) -> bool {
        self.claim_loop.is_some()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::from_stats(&self.scheduler.stats(), &self.coordinator_stats())
    }

    fn coordinator_stats(&self) -> CoordinatorStats {
        self.claim_loop
            .as_ref()
            .map(|(coordinator, _)| coordinator.stats())
            .unwrap_or_default()
    }

    /// Wait for every task to stop. Call after cancelling the shutdown token.
    pub async fn join(self) -> anyhow::Result<HealthReport> {
        let coordinator_stats = match self.claim_loop {
            Some((coordinator, task)) => {
                task.await.context("coordinator task failed")?;
                coordinator.stats()
            }
            None => CoordinatorStats::default(),
        };
        let scheduler_stats = self.scheduler.join().await;
        self.dispatcher.await.context("alert dispatcher failed")?;

        let report = HealthReport::from_stats(&scheduler_stats, &coordinator_stats);
        info!(
            batches_processed = report.batches_processed,
            total_emissions = report.total_emissions,
            "worker stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use batchflow_batch::{BatchJob, BatchStatus, SubmitBatch};
    use batchflow_core::{ActivityId, BatchId, OrgId, WorkspaceId};
    use batchflow_events::{BusEvent, InMemoryEventBus};
    use batchflow_infra::batch_store::InMemoryBatchStore;

    struct FixedEmissions;

    #[async_trait]
    impl ActivityProcessor for FixedEmissions {
        async fn process(&self, _batch: &BatchJob, _activity: &ActivityId, _cancel: CancellationToken) -> Result<f64, String> {
            Ok(2.0)
        }
    }

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.coordinator = config.coordinator.with_polling(Duration::from_millis(20), Duration::ZERO);
        config
    }

    async fn submitted(store: &Arc<InMemoryBatchStore>) -> BatchId {
        let submit = SubmitBatch::new(OrgId::new(), WorkspaceId::new(), vec!["a".into(), "b".into()]);
        let job = BatchJob::pending(BatchId::new(), &submit, 2, chrono::Utc::now());
        let activities = [ActivityId::parse("a").unwrap(), ActivityId::parse("b").unwrap()];
        store.create_batch_with_activities(job, &activities).await.unwrap()
    }

    #[tokio::test]
    async fn without_a_processor_batches_stay_pending() {
        let store = InMemoryBatchStore::arc();
        let id = submitted(&store).await;
        let shutdown = CancellationToken::new();

        let worker = Worker::start(
            &config(),
            store.clone(),
            Arc::new(InMemoryEventBus::<BusEvent>::new()),
            None,
            &shutdown,
        );
        assert!(!worker.is_processing_batches());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let job = store.get_batch(id).await.unwrap();
        assert_eq!(job.status, BatchStatus::Pending);
        assert!(job.locked_by.is_none());
        assert_eq!(job.processed(), 0);

        shutdown.cancel();
        let report = worker.join().await.unwrap();
        assert_eq!(report.batches_processed, 0);
    }

    #[tokio::test]
    async fn with_a_processor_batches_complete() {
        let store = InMemoryBatchStore::arc();
        let id = submitted(&store).await;
        let shutdown = CancellationToken::new();

        let worker = Worker::start(
            &config(),
            store.clone(),
            Arc::new(InMemoryEventBus::<BusEvent>::new()),
            Some(Arc::new(FixedEmissions)),
            &shutdown,
        );
        assert!(worker.is_processing_batches());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.get_batch(id).await.unwrap().status != BatchStatus::Complete {
            assert!(std::time::Instant::now() < deadline, "batch not processed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(worker.health().is_healthy());

        shutdown.cancel();
        let report = worker.join().await.unwrap();
        assert_eq!(report.batches_processed, 1);
        assert_eq!(report.total_emissions, 4.0);
    }
}
