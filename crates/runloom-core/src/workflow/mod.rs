//! Workflow engine core: DAG orchestration, node executors and their helpers.
//!
//! - `preflight` -- structural checks run before a run exists
//! - `graph` -- petgraph index over a DAG (successors, in-degree)
//! - `context` -- execution context and the updates node tasks hand back
//! - `expression` -- JEXL evaluator for conditions and selectors
//! - `template` -- `{{ ... }}` placeholder rendering
//! - `idempotency` -- idempotency keys, slim results, per-key locks
//! - `retry` -- retry attempt bounds and backoff delays
//! - `invoker` -- the action provider port
//! - `node_runner` -- action and gateway executors
//! - `executor` -- the orchestrator, joins and loop scopes
//! - `launcher` -- runs registered workflow versions

pub mod context;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod idempotency;
pub mod invoker;
pub mod launcher;
pub mod node_runner;
pub mod preflight;
pub mod retry;
pub mod template;
