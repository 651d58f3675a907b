//! `batchflow-core` — shared building blocks for batch orchestration.
//!
//! This crate contains **pure** primitives (identifiers and the domain error
//! model). No IO, no runtime.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ActivityId, BatchId, OrgId, WorkerId, WorkspaceId};
