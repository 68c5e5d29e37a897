//! Executors for the leaf node types: actions and gateways.
//!
//! Loop nodes drive sub-scopes and live with the orchestrator in
//! `executor`. Everything here works on a context snapshot and reports a
//! [`Settlement`]; persisting it and routing successors is the
//! orchestrator's job.

use std::time::Duration;

use runloom_types::config::EngineConfig;
use runloom_types::dag::{ActionData, GatewayIfData, GatewaySwitchData};
use runloom_types::event::EngineEvent;
use runloom_types::run::NodeStatus;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::IdempotencyCache;

use super::context::lookup_path;
use super::expression::ExpressionEvaluator;
use super::graph::DagIndex;
use super::idempotency::{idempotency_key, slim_result, KeyLocks};
use super::invoker::{ActionRequest, BoxActionInvoker, InvokeError};
use super::retry::RetryHandler;
use super::template::TemplateRenderer;

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Terminal outcome of one node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Provider calls for actions; 1 for everything else.
    pub attempts: u32,
    pub from_cache: bool,
    /// `output_vars` bindings to merge into `context.vars`.
    pub vars: Map<String, Value>,
}

impl Settlement {
    pub fn done(output: Value) -> Self {
        Self {
            status: NodeStatus::Done,
            output: Some(output),
            error: None,
            attempts: 1,
            from_cache: false,
            vars: Map::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Error,
            output: None,
            error: Some(error.into()),
            attempts: 1,
            from_cache: false,
            vars: Map::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: NodeStatus::Skipped,
            output: None,
            error: None,
            attempts: 1,
            from_cache: false,
            vars: Map::new(),
        }
    }

    fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

// ---------------------------------------------------------------------------
// NodeRunner
// ---------------------------------------------------------------------------

/// Borrowed engine services needed by the leaf executors.
pub struct NodeRunner<'a, C: IdempotencyCache> {
    pub evaluator: &'a ExpressionEvaluator,
    pub cache: &'a C,
    pub invoker: &'a BoxActionInvoker,
    pub key_locks: &'a KeyLocks,
    pub config: &'a EngineConfig,
    pub event_bus: &'a EventBus,
    pub run_id: Uuid,
    pub user_id: &'a str,
}

impl<C: IdempotencyCache> NodeRunner<'_, C> {
    // -----------------------------------------------------------------------
    // Action
    // -----------------------------------------------------------------------

    /// Render arguments, consult the idempotency cache, and invoke the
    /// provider with retries.
    pub async fn run_action(&self, node_key: &str, data: &ActionData, context: &Value) -> Settlement {
        let arguments = match TemplateRenderer::new(self.evaluator).render(&data.input_template, context) {
            Ok(arguments) => arguments,
            Err(e) => return Settlement::failed(e.to_string()).with_attempts(0),
        };

        let key = idempotency_key(&self.run_id, node_key, &arguments);
        let guard = self.key_locks.acquire(&key).await;
        let settlement = self.invoke_once(node_key, &key, data, arguments).await;
        self.key_locks.release(&key, guard);
        settlement
    }

    async fn invoke_once(
        &self,
        node_key: &str,
        key: &str,
        data: &ActionData,
        arguments: Value,
    ) -> Settlement {
        match self.cache.get(key).await {
            Ok(Some(cached)) => {
                tracing::debug!(run_id = %self.run_id, node_key, "idempotency cache hit");
                let mut settlement = Settlement::done(cached).with_attempts(0);
                settlement.from_cache = true;
                if let Some(output) = &settlement.output {
                    settlement.vars = extract_output_vars(data, output);
                }
                return settlement;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    node_key,
                    error = %e,
                    "idempotency cache read failed, invoking provider"
                );
            }
        }

        let timeout_ms = data.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let request = ActionRequest {
            tool: data.tool.clone().unwrap_or_default(),
            action: data.action.clone().unwrap_or_default(),
            connection_id: data.connection_id.clone(),
            user_id: self.user_id.to_string(),
            arguments,
            timeout_ms,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.invoker.invoke(&request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(InvokeError::Timeout(timeout_ms)),
            };

            match result {
                Ok(full) => {
                    let vars = extract_output_vars(data, &full);
                    let slim = slim_result(&full, self.config.slim_result_max_bytes);
                    let ttl = Duration::from_secs(self.config.idempotency_ttl_secs);
                    if let Err(e) = self.cache.put(key, &slim, ttl).await {
                        tracing::warn!(
                            run_id = %self.run_id,
                            node_key,
                            error = %e,
                            "failed to write idempotency cache"
                        );
                    }
                    tracing::info!(
                        run_id = %self.run_id,
                        node_key,
                        tool = request.tool.as_str(),
                        action = request.action.as_str(),
                        attempt,
                        "action succeeded"
                    );
                    let mut settlement = Settlement::done(slim).with_attempts(attempt);
                    settlement.vars = vars;
                    return settlement;
                }
                Err(e) if RetryHandler::should_retry(&data.retry, attempt) => {
                    let delay = RetryHandler::delay(&data.retry, attempt);
                    tracing::warn!(
                        run_id = %self.run_id,
                        node_key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "action failed, retrying"
                    );
                    self.event_bus.publish(EngineEvent::NodeRetrying {
                        run_id: self.run_id,
                        node_key: node_key.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = %self.run_id,
                        node_key,
                        attempt,
                        error = %e,
                        "action failed, retries exhausted"
                    );
                    return Settlement::failed(RetryHandler::exhausted_message(&e.to_string()))
                        .with_attempts(attempt);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Gateways
    // -----------------------------------------------------------------------

    /// First truthy branch wins, else `else_to`. Returns the chosen target.
    pub fn gateway_if(
        &self,
        data: &GatewayIfData,
        context: &Value,
        index: &DagIndex,
    ) -> (Settlement, Option<String>) {
        let mut chosen = None;
        for branch in &data.branches {
            match self.evaluator.evaluate_bool(&branch.expr, context) {
                Ok(true) => {
                    chosen = Some(branch.to.clone());
                    break;
                }
                Ok(false) => {}
                Err(e) => return (Settlement::failed(e.to_string()), None),
            }
        }
        let chosen = chosen.or_else(|| data.else_to.clone());

        if let Some(err) = unknown_target(chosen.as_deref(), index) {
            return (err, None);
        }
        (Settlement::done(json!({ "branch": chosen })), chosen)
    }

    /// First case equal to the selector value wins, else `default_to`.
    pub fn gateway_switch(
        &self,
        data: &GatewaySwitchData,
        context: &Value,
        index: &DagIndex,
    ) -> (Settlement, Option<String>) {
        let selected = match self.evaluator.evaluate_value(&data.selector, context) {
            Ok(value) => value,
            Err(e) => return (Settlement::failed(e.to_string()), None),
        };

        let matched = data.cases.iter().find(|case| values_match(&case.value, &selected));
        let case = matched.map(|c| c.value.clone()).unwrap_or(Value::Null);
        let chosen = matched
            .map(|c| c.to.clone())
            .or_else(|| data.default_to.clone());

        if let Some(err) = unknown_target(chosen.as_deref(), index) {
            return (err, None);
        }
        (
            Settlement::done(json!({ "case": case, "branch": chosen })),
            chosen,
        )
    }
}

fn unknown_target(chosen: Option<&str>, index: &DagIndex) -> Option<Settlement> {
    match chosen {
        Some(target) if !index.contains(target) => Some(Settlement::failed(format!(
            "routing gap: branch target '{target}' is not a node of this workflow"
        ))),
        _ => None,
    }
}

/// Switch equality: numbers compare numerically, everything else
/// structurally.
pub fn values_match(case: &Value, selected: &Value) -> bool {
    match (case, selected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => case == selected,
    }
}

/// Apply `output_vars` (name -> dotted path) to an action result.
pub fn extract_output_vars(data: &ActionData, result: &Value) -> Map<String, Value> {
    data.output_vars
        .iter()
        .map(|(name, path)| (name.clone(), lookup_path(result, path)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::in_memory::InMemoryIdempotencyCache;
    use crate::workflow::invoker::ActionInvoker;
    use runloom_types::dag::{Backoff, Dag, GatewayBranch, RetryPolicy, SwitchCase};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails the first `failures` calls, then echoes the arguments.
    struct FlakyInvoker {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl ActionInvoker for FlakyInvoker {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn invoke(&self, request: &ActionRequest) -> Result<Value, InvokeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(InvokeError::Provider(format!("call {n} failed")));
            }
            Ok(json!({ "call": n, "echo": request.arguments }))
        }
    }

    struct SlowInvoker;

    impl ActionInvoker for SlowInvoker {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(&self, _request: &ActionRequest) -> Result<Value, InvokeError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    struct Harness {
        evaluator: ExpressionEvaluator,
        cache: InMemoryIdempotencyCache,
        invoker: BoxActionInvoker,
        key_locks: KeyLocks,
        config: EngineConfig,
        event_bus: EventBus,
        run_id: Uuid,
    }

    impl Harness {
        fn new<I: ActionInvoker + 'static>(invoker: I) -> Self {
            Self {
                evaluator: ExpressionEvaluator::new(),
                cache: InMemoryIdempotencyCache::new(),
                invoker: BoxActionInvoker::new(invoker),
                key_locks: KeyLocks::new(),
                config: EngineConfig::default(),
                event_bus: EventBus::new(16),
                run_id: Uuid::now_v7(),
            }
        }

        fn runner(&self) -> NodeRunner<'_, InMemoryIdempotencyCache> {
            NodeRunner {
                evaluator: &self.evaluator,
                cache: &self.cache,
                invoker: &self.invoker,
                key_locks: &self.key_locks,
                config: &self.config,
                event_bus: &self.event_bus,
                run_id: self.run_id,
                user_id: "user-1",
            }
        }
    }

    fn action(retries: u32) -> ActionData {
        ActionData {
            tool: Some("gmail".to_string()),
            action: Some("send".to_string()),
            connection_id: Some("conn".to_string()),
            input_template: json!({ "to": "{{ inputs.to }}" }),
            output_vars: [("first_call".to_string(), "call".to_string())]
                .into_iter()
                .collect(),
            retry: RetryPolicy {
                retries,
                backoff: Backoff::Linear,
                delay_ms: 1,
            },
            ..ActionData::default()
        }
    }

    fn ctx() -> Value {
        json!({ "inputs": { "to": "a@example.com", "priority": "high", "score": 2.0 } })
    }

    #[tokio::test]
    async fn test_action_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = Harness::new(FlakyInvoker {
            failures: 2,
            calls: Arc::clone(&calls),
        });

        let settlement = h.runner().run_action("send", &action(2), &ctx()).await;
        assert_eq!(settlement.status, NodeStatus::Done);
        assert_eq!(settlement.attempts, 3);
        assert!(!settlement.from_cache);
        assert_eq!(settlement.output.as_ref().unwrap()["call"], 3);
        assert_eq!(settlement.output.as_ref().unwrap()["echo"]["to"], "a@example.com");
        assert_eq!(settlement.vars["first_call"], 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_action_cache_hit_skips_provider() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = Harness::new(FlakyInvoker {
            failures: 0,
            calls: Arc::clone(&calls),
        });

        let first = h.runner().run_action("send", &action(0), &ctx()).await;
        let second = h.runner().run_action("send", &action(0), &ctx()).await;
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.attempts, 0);
        assert_eq!(second.output, first.output);
        assert_eq!(second.vars["first_call"], 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_action_retries_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = Harness::new(FlakyInvoker {
            failures: u32::MAX,
            calls: Arc::clone(&calls),
        });

        let settlement = h.runner().run_action("send", &action(1), &ctx()).await;
        assert_eq!(settlement.status, NodeStatus::Error);
        assert_eq!(settlement.attempts, 2);
        assert_eq!(
            settlement.error.as_deref(),
            Some("Retries exhausted: provider error: call 2 failed")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_action_timeout_is_a_failure() {
        let h = Harness::new(SlowInvoker);
        let mut data = action(0);
        data.timeout_ms = Some(10);

        let settlement = h.runner().run_action("send", &data, &ctx()).await;
        assert_eq!(settlement.status, NodeStatus::Error);
        assert_eq!(
            settlement.error.as_deref(),
            Some("Retries exhausted: timed out after 10 ms")
        );
    }

    #[tokio::test]
    async fn test_action_template_failure() {
        let h = Harness::new(FlakyInvoker {
            failures: 0,
            calls: Arc::new(AtomicU32::new(0)),
        });
        let mut data = action(0);
        data.input_template = json!({ "to": "{{ inputs.to == }}" });

        let settlement = h.runner().run_action("send", &data, &ctx()).await;
        assert_eq!(settlement.status, NodeStatus::Error);
        assert_eq!(settlement.attempts, 0);
    }

    fn index_with(ids: &[&str]) -> DagIndex {
        let nodes: Vec<Value> = ids
            .iter()
            .map(|id| json!({ "id": id, "type": "parallel" }))
            .collect();
        let dag: Dag = serde_json::from_value(json!({ "nodes": nodes, "edges": [] })).unwrap();
        DagIndex::new(dag)
    }

    #[test]
    fn test_gateway_if_first_match_and_else() {
        let h = Harness::new(SlowInvoker);
        let index = index_with(&["a", "b", "c"]);
        let data = GatewayIfData {
            branches: vec![
                GatewayBranch {
                    expr: "inputs.priority == 'low'".to_string(),
                    to: "a".to_string(),
                },
                GatewayBranch {
                    expr: "inputs.priority == 'high'".to_string(),
                    to: "b".to_string(),
                },
            ],
            else_to: Some("c".to_string()),
        };

        let (settlement, chosen) = h.runner().gateway_if(&data, &ctx(), &index);
        assert_eq!(chosen.as_deref(), Some("b"));
        assert_eq!(settlement.output, Some(json!({ "branch": "b" })));

        let (_, chosen) = h
            .runner()
            .gateway_if(&data, &json!({ "inputs": { "priority": "none" } }), &index);
        assert_eq!(chosen.as_deref(), Some("c"));
    }

    #[test]
    fn test_gateway_if_unknown_target_errors() {
        let h = Harness::new(SlowInvoker);
        let index = index_with(&["a"]);
        let data = GatewayIfData {
            branches: vec![],
            else_to: Some("ghost".to_string()),
        };
        let (settlement, chosen) = h.runner().gateway_if(&data, &ctx(), &index);
        assert_eq!(settlement.status, NodeStatus::Error);
        assert!(settlement.error.unwrap().contains("ghost"));
        assert!(chosen.is_none());
    }

    #[test]
    fn test_gateway_switch_numeric_and_default() {
        let h = Harness::new(SlowInvoker);
        let index = index_with(&["one", "two", "other"]);
        let data = GatewaySwitchData {
            selector: "inputs.score".to_string(),
            cases: vec![
                SwitchCase {
                    value: json!(1),
                    to: "one".to_string(),
                },
                SwitchCase {
                    value: json!(2),
                    to: "two".to_string(),
                },
            ],
            default_to: Some("other".to_string()),
        };

        let (settlement, chosen) = h.runner().gateway_switch(&data, &ctx(), &index);
        assert_eq!(chosen.as_deref(), Some("two"));
        assert_eq!(settlement.output, Some(json!({ "case": 2, "branch": "two" })));

        let (settlement, chosen) = h
            .runner()
            .gateway_switch(&data, &json!({ "inputs": { "score": 9.0 } }), &index);
        assert_eq!(chosen.as_deref(), Some("other"));
        assert_eq!(settlement.output, Some(json!({ "case": null, "branch": "other" })));
    }

    #[test]
    fn test_values_match() {
        assert!(values_match(&json!(2), &json!(2.0)));
        assert!(values_match(&json!("high"), &json!("high")));
        assert!(!values_match(&json!("2"), &json!(2)));
    }
}
