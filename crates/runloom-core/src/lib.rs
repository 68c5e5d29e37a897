//! Engine logic and repository trait definitions for Runloom.
//!
//! This crate defines the "ports" (storage traits, the action invoker) that
//! the infrastructure layer implements. It depends only on `runloom-types`,
//! never on `runloom-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
