//! Infrastructure adapters for runloom.
//!
//! SQLite implementations of the storage ports, the HTTP and echo action
//! invokers, and `config.toml` loading.

pub mod config;
pub mod invoker;
pub mod sqlite;
