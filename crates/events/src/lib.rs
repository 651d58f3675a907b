//! Event publishing for the batch worker.
//!
//! Alerts and heartbeats leave the process as [`BusEvent`]s through an
//! [`EventBus`]. The bus is best-effort: callers in this workspace log and
//! swallow publish failures.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::BusEvent;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
