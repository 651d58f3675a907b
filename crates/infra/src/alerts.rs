//! Bounded, non-blocking alert queue.
//!
//! Producers call [`AlertQueue::publish`], which never waits: when the buffer
//! is full the alert is dropped and a warning is logged. A single
//! [`AlertDispatcher`] drains the buffer until shutdown, logs every alert and
//! forwards it to the event bus when one is configured. Forwarding failures
//! are logged and swallowed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use batchflow_events::BusEvent;

use crate::event_bus::SharedPublisher;

/// Event type used when forwarding alerts to the bus.
pub const ALERT_EVENT_TYPE: &str = "worker.alert";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl core::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fire-and-forget failure notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub time: DateTime<Utc>,
    pub job: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    pub fn new(job: impl Into<String>, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            job: job.into(),
            severity,
            message: message.into(),
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn to_event(&self) -> BusEvent {
        let mut event = BusEvent::new(
            ALERT_EVENT_TYPE,
            serde_json::json!({
                "job": self.job,
                "severity": self.severity,
                "message": self.message,
                "error": self.error,
                "metadata": self.metadata,
            }),
        );
        event.timestamp = self.time;
        event
    }
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    forwarded: AtomicU64,
    forward_failures: AtomicU64,
}

/// Alert queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertQueueStats {
    pub published: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub forwarded: u64,
    pub forward_failures: u64,
}

/// Cloneable producer side of the alert buffer.
#[derive(Debug, Clone)]
pub struct AlertQueue {
    tx: mpsc::Sender<Alert>,
    counters: Arc<Counters>,
}

impl AlertQueue {
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Create the queue and its dispatcher. `capacity == 0` selects the default.
    pub fn bounded(capacity: usize) -> (Self, AlertDispatcher) {
        let capacity = if capacity == 0 {
            Self::DEFAULT_CAPACITY
        } else {
            capacity
        };
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());
        let queue = Self {
            tx,
            counters: counters.clone(),
        };
        let dispatcher = AlertDispatcher {
            rx,
            bus: None,
            counters,
        };
        (queue, dispatcher)
    }

    /// Enqueue without waiting. Returns `false` when the alert was dropped.
    pub fn publish(&self, alert: Alert) -> bool {
        match self.tx.try_send(alert) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(alert)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(job = %alert.job, severity = %alert.severity, "alert queue full; dropping alert");
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(job = %alert.job, severity = %alert.severity, "alert dispatcher gone; dropping alert");
                false
            }
        }
    }

    pub fn stats(&self) -> AlertQueueStats {
        let c = &self.counters;
        AlertQueueStats {
            published: c.published.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            forward_failures: c.forward_failures.load(Ordering::Relaxed),
        }
    }
}

/// Single consumer of the alert buffer.
pub struct AlertDispatcher {
    rx: mpsc::Receiver<Alert>,
    bus: Option<SharedPublisher>,
    counters: Arc<Counters>,
}

impl core::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("bus", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}

impl AlertDispatcher {
    /// Forward every dispatched alert to `bus` as a `worker.alert` event.
    pub fn with_bus(mut self, bus: SharedPublisher) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drain until `shutdown` fires or every producer is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(forwarding = self.bus.is_some(), "alert dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(alert) => self.dispatch(alert).await,
                    None => break,
                },
            }
        }
        info!("alert dispatcher stopped");
    }

    async fn dispatch(&self, alert: Alert) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        error!(
            job = %alert.job,
            severity = %alert.severity,
            error = alert.error.as_deref().unwrap_or(""),
            metadata = ?alert.metadata,
            alert_time = %alert.time,
            "{}",
            alert.message
        );

        let Some(bus) = self.bus.clone() else {
            return;
        };
        let event = alert.to_event();
        match tokio::task::spawn_blocking(move || bus.publish_event(event)).await {
            Ok(Ok(())) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                warn!(job = %alert.job, error = %e, "failed to forward alert");
            }
            Err(e) => {
                self.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                warn!(job = %alert.job, error = %e, "alert forwarding task failed");
            }
        }
    }

    /// Pull whatever is buffered without dispatching it.
    #[cfg(test)]
    pub(crate) fn drain_buffered(&mut self) -> Vec<Alert> {
        let mut out = Vec::new();
        while let Ok(alert) = self.rx.try_recv() {
            out.push(alert);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventPublisher;
    use batchflow_events::{EventBus, InMemoryEventBus, Subscription};
    use std::time::Duration;

    struct BrokenBus;

    impl EventPublisher for BrokenBus {
        fn publish_event(&self, _event: BusEvent) -> Result<(), String> {
            Err("connection refused".into())
        }
    }

    fn alert(job: &str) -> Alert {
        Alert::new(job, AlertSeverity::Error, "job failed after retries")
            .with_error("boom")
            .with_metadata("attempts", 3)
    }

    async fn recv_event(sub: &Subscription<BusEvent>) -> BusEvent {
        for _ in 0..200 {
            if let Ok(event) = sub.try_recv() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no event forwarded");
    }

    #[tokio::test]
    async fn publish_never_blocks_when_full() {
        let (queue, mut dispatcher) = AlertQueue::bounded(2);
        let accepted: Vec<bool> = (0..5).map(|i| queue.publish(alert(&format!("j{i}")))).collect();
        assert_eq!(accepted, vec![true, true, false, false, false]);

        let stats = queue.stats();
        assert_eq!((stats.published, stats.dropped), (2, 3));
        let buffered: Vec<_> = dispatcher.drain_buffered().into_iter().map(|a| a.job).collect();
        assert_eq!(buffered, vec!["j0", "j1"]);
    }

    #[tokio::test]
    async fn zero_capacity_uses_default() {
        let (queue, _dispatcher) = AlertQueue::bounded(0);
        for i in 0..AlertQueue::DEFAULT_CAPACITY {
            assert!(queue.publish(alert(&i.to_string())));
        }
        assert!(!queue.publish(alert("overflow")));
    }

    #[tokio::test]
    async fn dispatcher_forwards_to_bus() {
        let bus = Arc::new(InMemoryEventBus::<BusEvent>::new());
        let sub = bus.subscribe();
        let (queue, dispatcher) = AlertQueue::bounded(8);
        let shutdown = CancellationToken::new();
        let handle = dispatcher.with_bus(bus.clone()).spawn(shutdown.clone());

        queue.publish(alert("ingestion_sync"));
        let event = recv_event(&sub).await;
        assert_eq!(event.event_type, ALERT_EVENT_TYPE);
        assert_eq!(event.payload["job"], "ingestion_sync");
        assert_eq!(event.payload["severity"], "error");
        assert_eq!(event.payload["error"], "boom");
        assert_eq!(event.payload["metadata"]["attempts"], "3");

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(queue.stats().forwarded, 1);
    }

    #[tokio::test]
    async fn forwarding_failures_are_swallowed() {
        let (queue, dispatcher) = AlertQueue::bounded(8);
        let shutdown = CancellationToken::new();
        let handle = dispatcher.with_bus(Arc::new(BrokenBus)).spawn(shutdown.clone());

        queue.publish(alert("a"));
        queue.publish(alert("b"));
        for _ in 0..200 {
            if queue.stats().dispatched == 2 && queue.stats().forward_failures == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = queue.stats();
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.forward_failures, 2);
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn publishing_after_dispatcher_exit_drops() {
        let (queue, dispatcher) = AlertQueue::bounded(4);
        drop(dispatcher);
        assert!(!queue.publish(alert("late")));
        assert_eq!(queue.stats().dropped, 1);
    }
}
