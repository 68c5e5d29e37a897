//! SQLite storage layer.
//!
//! Implementations of the `runloom-core` storage ports backed by SQLite with
//! WAL mode and split read/write connection pools.

pub mod idempotency;
pub mod pool;
pub mod state_store;
pub mod workflow_store;
