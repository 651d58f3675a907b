//! Liveness heartbeat published on the event bus.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use batchflow_events::BusEvent;

use crate::event_bus::SharedPublisher;

use super::types::UnitOfWork;

pub const HEARTBEAT_EVENT_TYPE: &str = "worker.heartbeat";

/// Publishes `worker.heartbeat` on every tick.
pub struct HeartbeatJob {
    name: String,
    service: String,
    bus: SharedPublisher,
}

impl HeartbeatJob {
    pub fn new(bus: SharedPublisher) -> Self {
        Self {
            name: "heartbeat".to_string(),
            service: "worker".to_string(),
            bus,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    fn event(&self) -> BusEvent {
        BusEvent::new(
            HEARTBEAT_EVENT_TYPE,
            serde_json::json!({ "service": self.service, "status": "ok" }),
        )
    }
}

#[async_trait]
impl UnitOfWork for HeartbeatJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            anyhow::bail!("heartbeat cancelled");
        }
        let bus = self.bus.clone();
        let event = self.event();
        tokio::task::spawn_blocking(move || bus.publish_event(event))
            .await?
            .map_err(|e| anyhow::anyhow!("publish heartbeat: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_events::{EventBus, InMemoryEventBus};
    use std::sync::Arc;

    #[tokio::test]
    async fn publishes_heartbeat_event() {
        let bus = Arc::new(InMemoryEventBus::<BusEvent>::new());
        let sub = bus.subscribe();
        let job = HeartbeatJob::new(bus.clone()).with_name("alerts");

        job.run(CancellationToken::new()).await.unwrap();

        let event = sub.try_recv().unwrap();
        assert_eq!(job.name(), "alerts");
        assert_eq!(event.event_type, HEARTBEAT_EVENT_TYPE);
        assert_eq!(event.payload, serde_json::json!({ "service": "worker", "status": "ok" }));
    }

    #[tokio::test]
    async fn cancelled_run_publishes_nothing() {
        let bus = Arc::new(InMemoryEventBus::<BusEvent>::new());
        let sub = bus.subscribe();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(HeartbeatJob::new(bus).run(cancel).await.is_err());
        assert!(sub.try_recv().is_err());
    }
}
