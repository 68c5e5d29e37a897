//! Logging and trace export setup for runloom binaries.

pub mod tracing_setup;
