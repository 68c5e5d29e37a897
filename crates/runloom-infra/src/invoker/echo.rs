//! Dry-run invoker: performs no side effects and echoes the request back.

use runloom_core::workflow::invoker::{ActionInvoker, ActionRequest, InvokeError};
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct EchoActionInvoker;

impl EchoActionInvoker {
    pub fn new() -> Self {
        Self
    }
}

impl ActionInvoker for EchoActionInvoker {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, request: &ActionRequest) -> Result<Value, InvokeError> {
        tracing::info!(
            tool = %request.tool,
            action = %request.action,
            "dry run: action not executed"
        );
        Ok(json!({
            "dry_run": true,
            "tool": request.tool,
            "action": request.action,
            "arguments": request.arguments,
        }))
    }
}
