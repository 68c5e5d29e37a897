//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (runloom-infra) implements. The core crate never depends on any
//! specific storage technology; `in_memory` provides dashmap-backed adapters
//! for tests and single-process use.

pub mod idempotency;
pub mod in_memory;
pub mod state_store;
pub mod workflow_store;

pub use idempotency::IdempotencyCache;
pub use state_store::StateStore;
pub use workflow_store::WorkflowStore;
