//! Infrastructure layer: batch storage, coordination, scheduling, alerting.

pub mod alerts;
pub mod batch_store;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod event_bus;
pub mod health;
pub mod scheduler;
