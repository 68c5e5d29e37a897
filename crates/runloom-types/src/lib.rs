//! Shared domain types for runloom.
//!
//! The workflow DAG model, run and node execution records, engine events,
//! configuration and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod dag;
pub mod error;
pub mod event;
pub mod run;
