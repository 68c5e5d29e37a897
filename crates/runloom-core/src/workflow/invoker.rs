//! ActionInvoker trait and its object-safe wrapper.
//!
//! The invoker is the RPC boundary to the external tool-execution provider.
//! The engine is agnostic to the concrete provider; runloom-infra supplies
//! an HTTP adapter and an echo adapter for dry runs.
//!
//! `BoxActionInvoker` follows the blanket-impl pattern:
//! 1. `ActionInvokerDyn` is an object-safe trait with boxed futures
//! 2. It is blanket-implemented for every `T: ActionInvoker`
//! 3. `BoxActionInvoker` wraps `Box<dyn ActionInvokerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Request / error
// ---------------------------------------------------------------------------

/// One concrete action call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub tool: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub user_id: String,
    /// Rendered arguments.
    pub arguments: Value,
    pub timeout_ms: u64,
}

/// Provider failures. Every variant is retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Executes one action call against the tool provider.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait ActionInvoker: Send + Sync {
    /// Human-readable adapter name, used in logs.
    fn name(&self) -> &str;

    fn invoke(
        &self,
        request: &ActionRequest,
    ) -> impl Future<Output = Result<Value, InvokeError>> + Send;
}

/// Object-safe version of [`ActionInvoker`] with boxed futures.
pub trait ActionInvokerDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        request: &'a ActionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, InvokeError>> + Send + 'a>>;
}

impl<T: ActionInvoker> ActionInvokerDyn for T {
    fn name(&self) -> &str {
        ActionInvoker::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        request: &'a ActionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, InvokeError>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased invoker for runtime adapter selection (HTTP vs dry run).
pub struct BoxActionInvoker {
    inner: Box<dyn ActionInvokerDyn + Send + Sync>,
}

impl BoxActionInvoker {
    pub fn new<T: ActionInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn invoke(&self, request: &ActionRequest) -> Result<Value, InvokeError> {
        self.inner.invoke_boxed(request).await
    }
}

impl std::fmt::Debug for BoxActionInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxActionInvoker")
            .field("name", &self.name())
            .finish()
    }
}
