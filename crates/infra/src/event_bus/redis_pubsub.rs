//! Redis pub/sub publisher (optional).
//!
//! Redis pub/sub is not durable: events published while nobody listens are
//! gone. Alerts and heartbeats are best-effort, so that is acceptable here.
//! The worker only publishes; consumers subscribe with their own clients.

use redis::Commands;

use batchflow_events::BusEvent;

use super::EventPublisher;

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis: {0}")]
    Redis(String),
    #[error("serialize: {0}")]
    Serialize(String),
}

/// Publishes JSON-encoded [`BusEvent`]s to one Redis channel.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubEventBus {
    /// Parses the URL only; the first publish opens the connection.
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn publish(&self, event: &BusEvent) -> Result<(), RedisBusError> {
        let payload = serde_json::to_string(event).map_err(|e| RedisBusError::Serialize(e.to_string()))?;
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        let _receivers: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(())
    }
}

impl EventPublisher for RedisPubSubEventBus {
    fn publish_event(&self, event: BusEvent) -> Result<(), String> {
        self.publish(&event).map_err(|e| e.to_string())
    }
}
