//! Action invoker adapters.
//!
//! - [`http::HttpActionInvoker`] calls the tool-execution provider over HTTP.
//! - [`echo::EchoActionInvoker`] answers locally, for dry runs.

pub mod echo;
pub mod http;
