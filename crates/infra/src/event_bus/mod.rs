//! Event publishing for the worker.
//!
//! The bus contract lives in `batchflow-events` as pure mechanics. This module
//! adds the object-safe [`EventPublisher`] seam used by the alert dispatcher
//! and heartbeat job, and the optional Redis publisher.

use std::sync::Arc;

use batchflow_events::{BusEvent, EventBus, InMemoryEventBus};

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};

/// Publish-only view of an event transport carrying [`BusEvent`]s.
///
/// Erases the transport error type so different transports fit behind one
/// `Arc<dyn EventPublisher>`.
pub trait EventPublisher: Send + Sync {
    fn publish_event(&self, event: BusEvent) -> Result<(), String>;
}

impl EventPublisher for InMemoryEventBus<BusEvent> {
    fn publish_event(&self, event: BusEvent) -> Result<(), String> {
        self.publish(event).map_err(|e| e.to_string())
    }
}

pub type SharedPublisher = Arc<dyn EventPublisher>;
