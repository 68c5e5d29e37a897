//! Event bus for run lifecycle notifications.

pub mod bus;

pub use bus::EventBus;
