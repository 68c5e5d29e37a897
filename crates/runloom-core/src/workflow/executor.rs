//! Workflow engine: ready-queue DAG orchestration with claimed node records.
//!
//! A run is driven by one orchestration loop per scope. The root scope is
//! seeded with the targets of every trigger edge; loop nodes open child
//! scopes whose node keys are prefixed with `"<loop key>[<n>]"`.
//!
//! # Execution flow
//!
//! 1. Preflight the DAG, create the `WorkflowRun`, register a cancellation
//!    token.
//! 2. Admit pending targets: joins record an arrival and wait for
//!    readiness, unknown targets are routing gaps.
//! 3. Claim each ready node (insert RUNNING) and spawn it on a `JoinSet`,
//!    bounded by `max_parallel_nodes`.
//! 4. On completion: merge the context update, route successors.
//! 5. When nothing is queued or in flight, finalize the run.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use runloom_types::config::EngineConfig;
use runloom_types::dag::{
    Dag, EdgeDefinition, EdgeWhen, JoinMode, LoopForeachData, LoopWhileData, NodeDefinition,
    NodeKind,
};
use runloom_types::error::RepositoryError;
use runloom_types::event::EngineEvent;
use runloom_types::run::{node_key, NodeExecution, NodeStatus, RunStatus, WorkflowRun};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::{IdempotencyCache, StateStore};

use super::context::{ContextUpdate, ExecutionContext, LoopFrame};
use super::expression::ExpressionEvaluator;
use super::graph::DagIndex;
use super::idempotency::KeyLocks;
use super::invoker::BoxActionInvoker;
use super::node_runner::{NodeRunner, Settlement};
use super::preflight::{preflight, PreflightError};

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait WorkflowExecutor: Send + Sync {
    /// Run `dag` to completion against `payload`. Returns the run id once the
    /// run has been finalized.
    fn execute(
        &self,
        dag: Dag,
        payload: Value,
        user_id: &str,
        workflow_id: &str,
        version: &str,
    ) -> impl Future<Output = Result<Uuid, EngineError>> + Send;

    /// Create the run and drive it in the background. Returns immediately.
    fn spawn_execute(
        &self,
        dag: Dag,
        payload: Value,
        user_id: &str,
        workflow_id: &str,
        version: &str,
    ) -> impl Future<Output = Result<Uuid, EngineError>> + Send;

    /// Request graceful cancellation of an active run.
    fn cancel(&self, run_id: &Uuid) -> Result<(), EngineError>;
}

/// Errors surfaced synchronously by the engine. Node failures never appear
/// here; they are recorded on the run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("preflight failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("run {0} is not active")]
    RunNotActive(Uuid),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// DAG engine generic over its state store and idempotency cache.
pub struct WorkflowEngine<S: StateStore, C: IdempotencyCache> {
    inner: Arc<EngineInner<S, C>>,
}

impl<S: StateStore, C: IdempotencyCache> Clone for WorkflowEngine<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<S: StateStore, C: IdempotencyCache> {
    store: Arc<S>,
    cache: Arc<C>,
    invoker: BoxActionInvoker,
    evaluator: ExpressionEvaluator,
    config: EngineConfig,
    event_bus: EventBus,
    key_locks: KeyLocks,
    /// Cancellation tokens keyed by run_id, present while a run is active.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: StateStore + 'static, C: IdempotencyCache + 'static> WorkflowEngine<S, C> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<C>,
        invoker: BoxActionInvoker,
        config: EngineConfig,
        event_bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                cache,
                invoker,
                evaluator: ExpressionEvaluator::new(),
                config,
                event_bus,
                key_locks: KeyLocks::new(),
                cancellation_tokens: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn invoker_name(&self) -> &str {
        self.inner.invoker.name()
    }

    /// Whether `run_id` is currently being driven by this engine.
    pub fn is_active(&self, run_id: &Uuid) -> bool {
        self.inner.cancellation_tokens.contains_key(run_id)
    }
}

impl<S: StateStore + 'static, C: IdempotencyCache + 'static> WorkflowExecutor
    for WorkflowEngine<S, C>
{
    async fn execute(
        &self,
        dag: Dag,
        payload: Value,
        user_id: &str,
        workflow_id: &str,
        version: &str,
    ) -> Result<Uuid, EngineError> {
        let (run, token) = self
            .inner
            .start_run(&dag, user_id, workflow_id, version)
            .await?;
        let run_id = run.id;
        Arc::clone(&self.inner)
            .drive_run(run, dag, payload, token)
            .await;
        Ok(run_id)
    }

    async fn spawn_execute(
        &self,
        dag: Dag,
        payload: Value,
        user_id: &str,
        workflow_id: &str,
        version: &str,
    ) -> Result<Uuid, EngineError> {
        let (run, token) = self
            .inner
            .start_run(&dag, user_id, workflow_id, version)
            .await?;
        let run_id = run.id;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive_run(run, dag, payload, token).await;
        });
        Ok(run_id)
    }

    fn cancel(&self, run_id: &Uuid) -> Result<(), EngineError> {
        match self.inner.cancellation_tokens.get(run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "run cancellation requested");
                Ok(())
            }
            None => Err(EngineError::RunNotActive(*run_id)),
        }
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// One orchestration scope: the run root, or a loop iteration/item.
#[derive(Clone)]
struct Scope {
    run_id: Uuid,
    user_id: String,
    /// Node key prefix; empty at the root.
    prefix: String,
    /// Loop node that owns this scope. Edges back to it end the scope.
    owner: Option<String>,
    index: Arc<DagIndex>,
    token: CancellationToken,
}

impl Scope {
    fn key(&self, node_id: &str) -> String {
        node_key(&self.prefix, node_id)
    }

    fn child(&self, prefix: String, owner: &str) -> Self {
        Self {
            prefix,
            owner: Some(owner.to_string()),
            ..self.clone()
        }
    }
}

/// A routed-to node id, with the node it was routed from.
struct Pending {
    target: String,
    source: Option<String>,
}

struct ReadyNode {
    node_id: String,
    /// Distinct arrivals, for joins.
    arrivals: u32,
}

/// Joins that have arrivals but are not ready yet: `(arrivals, needed)`.
type WaitingJoins = BTreeMap<String, (u32, u32)>;

struct ScopeOutcome {
    ctx: ExecutionContext,
    /// Run-level failures (routing gaps, stalled joins, lost tasks).
    failures: Vec<String>,
    cancelled: bool,
}

/// How a settled node's successors are chosen.
enum Routing {
    /// Every outgoing edge whose gates pass.
    Normal,
    /// Gateways: one edge toward the chosen target, if any.
    Chosen(Option<String>),
    /// Normal, minus the edge into the loop body.
    Except(String),
    /// Only `when: error` edges.
    ErrorEdges,
    Nothing,
}

struct NodeOutcome {
    node_id: String,
    status: NodeStatus,
    update: ContextUpdate,
    routing: Routing,
    failures: Vec<String>,
}

/// Result of a loop node: its own settlement plus everything its scopes did.
struct LoopResult {
    settlement: Settlement,
    update: ContextUpdate,
    failures: Vec<String>,
}

impl LoopResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            settlement: Settlement::failed(message),
            update: ContextUpdate::default(),
            failures: Vec::new(),
        }
    }
}

type ScopeFuture = Pin<Box<dyn Future<Output = ScopeOutcome> + Send>>;

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

impl<S: StateStore + 'static, C: IdempotencyCache + 'static> EngineInner<S, C> {
    async fn start_run(
        &self,
        dag: &Dag,
        user_id: &str,
        workflow_id: &str,
        version: &str,
    ) -> Result<(WorkflowRun, CancellationToken), EngineError> {
        preflight(dag)?;

        let run = WorkflowRun::start(workflow_id, version, user_id);
        self.store.create_run(&run).await?;

        let token = CancellationToken::new();
        self.cancellation_tokens.insert(run.id, token.clone());

        tracing::info!(
            run_id = %run.id,
            workflow_id,
            version,
            user_id,
            "run started"
        );
        self.event_bus.publish(EngineEvent::RunStarted {
            run_id: run.id,
            workflow_id: workflow_id.to_string(),
            version: version.to_string(),
        });
        Ok((run, token))
    }

    async fn drive_run(
        self: Arc<Self>,
        run: WorkflowRun,
        dag: Dag,
        payload: Value,
        token: CancellationToken,
    ) -> RunStatus {
        let index = Arc::new(DagIndex::new(dag));
        let seeds: Vec<Pending> = index
            .entry_edges()
            .into_iter()
            .map(|(source, target)| Pending {
                target: target.to_string(),
                source: Some(source.to_string()),
            })
            .collect();
        if seeds.is_empty() {
            tracing::warn!(run_id = %run.id, "no trigger edges, nothing to execute");
        }

        let ctx = ExecutionContext::new(run.id, &run.workflow_id, &run.user_id, payload);
        let scope = Scope {
            run_id: run.id,
            user_id: run.user_id.clone(),
            prefix: String::new(),
            owner: None,
            index,
            token,
        };

        let outcome = Arc::clone(&self).drive_scope(scope, ctx, seeds).await;
        self.finalize(run.id, outcome).await
    }

    /// Drive one scope until nothing is queued or in flight.
    fn drive_scope(
        self: Arc<Self>,
        scope: Scope,
        mut ctx: ExecutionContext,
        seeds: Vec<Pending>,
    ) -> ScopeFuture {
        Box::pin(async move {
            let mut queue: VecDeque<Pending> = seeds.into();
            let mut ready: VecDeque<ReadyNode> = VecDeque::new();
            let mut failures = Vec::new();
            let mut waiting = WaitingJoins::new();
            let mut join_set: JoinSet<NodeOutcome> = JoinSet::new();
            let limit = self.config.max_parallel_nodes.max(1);

            loop {
                while let Some(pending) = queue.pop_front() {
                    if let Some(node) = self
                        .admit(&scope, &mut ctx, pending, &mut waiting, &mut failures)
                        .await
                    {
                        ready.push_back(node);
                    }
                }

                while join_set.len() < limit && !scope.token.is_cancelled() {
                    let Some(node) = ready.pop_front() else {
                        break;
                    };
                    self.dispatch(&scope, &ctx, node, &mut join_set, &mut failures)
                        .await;
                }

                if join_set.is_empty() {
                    break;
                }

                match join_set.join_next().await {
                    Some(Ok(outcome)) => {
                        ctx.apply(outcome.update);
                        failures.extend(outcome.failures);
                        let next = self.route(
                            &scope,
                            &mut ctx,
                            &outcome.node_id,
                            outcome.status,
                            &outcome.routing,
                        );
                        queue.extend(next);
                    }
                    Some(Err(e)) => {
                        tracing::error!(run_id = %scope.run_id, error = %e, "node task panicked");
                        failures.push(format!("node task failed: {e}"));
                    }
                    None => break,
                }
            }

            if !ready.is_empty() {
                tracing::debug!(
                    run_id = %scope.run_id,
                    dropped = ready.len(),
                    "scope cancelled with ready nodes"
                );
            }

            if !scope.token.is_cancelled() {
                for (node_id, (arrivals, needed)) in waiting {
                    let key = scope.key(&node_id);
                    let message =
                        format!("join '{key}' never became ready ({arrivals} of {needed} arrivals)");
                    tracing::error!(
                        run_id = %scope.run_id,
                        node_key = %key,
                        arrivals,
                        needed,
                        "join stalled"
                    );
                    ctx.record_error(&key, message.clone());
                    failures.push(message);
                }
            }

            ScopeOutcome {
                ctx,
                failures,
                cancelled: scope.token.is_cancelled(),
            }
        })
    }

    /// Turn a routed-to target into a ready node, or hold it back.
    async fn admit(
        &self,
        scope: &Scope,
        ctx: &mut ExecutionContext,
        pending: Pending,
        waiting: &mut WaitingJoins,
        failures: &mut Vec<String>,
    ) -> Option<ReadyNode> {
        if scope.owner.as_deref() == Some(pending.target.as_str()) {
            return None;
        }

        let Some(node) = scope.index.node(&pending.target) else {
            let message = format!("routing gap: node '{}' does not exist", pending.target);
            tracing::error!(
                run_id = %scope.run_id,
                node_id = %pending.target,
                source = pending.source.as_deref().unwrap_or(""),
                "routing gap"
            );
            ctx.record_error(&scope.key(&pending.target), message.clone());
            failures.push(message);
            return None;
        };

        let NodeKind::Join(join) = &node.kind else {
            return Some(ReadyNode {
                node_id: pending.target,
                arrivals: 0,
            });
        };

        let key = scope.key(&node.id);
        let source = pending.source.as_deref().unwrap_or_default();
        let arrivals = match self
            .store
            .record_join_arrival(&scope.run_id, &key, source)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(run_id = %scope.run_id, node_key = %key, error = %e, "failed to record join arrival");
                failures.push(format!("join '{key}': {e}"));
                return None;
            }
        };

        let needed = match join.mode {
            JoinMode::All => u32::try_from(scope.index.in_degree(&node.id)).unwrap_or(u32::MAX),
            JoinMode::Any => 1,
            JoinMode::Quorum => join.count.unwrap_or(1),
        };
        let is_ready = arrivals >= needed;
        if is_ready {
            waiting.remove(&node.id);
        } else {
            waiting.insert(node.id.clone(), (arrivals, needed));
        }
        tracing::debug!(
            run_id = %scope.run_id,
            node_key = %key,
            source,
            arrivals,
            is_ready,
            "join arrival"
        );
        is_ready.then(|| ReadyNode {
            node_id: pending.target,
            arrivals,
        })
    }

    /// Claim a ready node and spawn its executor.
    async fn dispatch(
        self: &Arc<Self>,
        scope: &Scope,
        ctx: &ExecutionContext,
        ready: ReadyNode,
        join_set: &mut JoinSet<NodeOutcome>,
        failures: &mut Vec<String>,
    ) {
        let Some(node) = scope.index.node(&ready.node_id).cloned() else {
            return;
        };
        let key = scope.key(&node.id);
        let record = NodeExecution::claimed(scope.run_id, &key, &node.id, node.node_type());

        match self.store.claim_node(&record).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(run_id = %scope.run_id, node_key = %key, "node already claimed");
                return;
            }
            Err(e) => {
                tracing::error!(run_id = %scope.run_id, node_key = %key, error = %e, "failed to claim node");
                failures.push(format!("failed to claim node '{key}': {e}"));
                return;
            }
        }

        tracing::debug!(
            run_id = %scope.run_id,
            node_key = %key,
            node_type = %node.node_type(),
            "node dispatched"
        );
        self.event_bus.publish(EngineEvent::NodeStarted {
            run_id: scope.run_id,
            node_key: key,
            node_type: node.node_type().to_string(),
        });

        join_set.spawn(Arc::clone(self).run_node(
            scope.clone(),
            node,
            ready.arrivals,
            ctx.clone(),
            record,
        ));
    }

    /// Execute one claimed node, persist its terminal record, and report
    /// how to route from it.
    async fn run_node(
        self: Arc<Self>,
        scope: Scope,
        node: NodeDefinition,
        arrivals: u32,
        ctx: ExecutionContext,
        mut record: NodeExecution,
    ) -> NodeOutcome {
        let key = record.node_key.clone();
        let context_value = ctx.to_expression_context();
        let mut failures = Vec::new();
        let mut update = ContextUpdate::default();

        let (settlement, routing) = match &node.kind {
            NodeKind::Trigger(_) => (Settlement::skipped(), Routing::Normal),
            NodeKind::Parallel => {
                let branches = scope.index.outgoing(&node.id).len();
                (Settlement::done(json!({ "branches": branches })), Routing::Normal)
            }
            NodeKind::Join(_) => (
                Settlement::done(json!({ "arrived": arrivals })),
                Routing::Normal,
            ),
            NodeKind::Action(data) => {
                let settlement = self.runner(&scope).run_action(&key, data, &context_value).await;
                (settlement, Routing::Normal)
            }
            NodeKind::GatewayIf(data) => {
                let (settlement, chosen) =
                    self.runner(&scope).gateway_if(data, &context_value, &scope.index);
                let routing = gateway_routing(&settlement, chosen);
                (settlement, routing)
            }
            NodeKind::GatewaySwitch(data) => {
                let (settlement, chosen) =
                    self.runner(&scope)
                        .gateway_switch(data, &context_value, &scope.index);
                let routing = gateway_routing(&settlement, chosen);
                (settlement, routing)
            }
            NodeKind::LoopWhile(data) => {
                let result = Arc::clone(&self)
                    .loop_while(&scope, &node.id, &key, data, ctx)
                    .await;
                update = result.update;
                failures = result.failures;
                (result.settlement, Routing::Except(data.body_start.clone()))
            }
            NodeKind::LoopForeach(data) => {
                let result = Arc::clone(&self)
                    .loop_foreach(&scope, &node.id, &key, data, ctx)
                    .await;
                update = result.update;
                failures = result.failures;
                let routing = match (&data.body_start, result.settlement.status) {
                    (Some(body_start), _) => Routing::Except(body_start.clone()),
                    (None, NodeStatus::Error) => Routing::ErrorEdges,
                    (None, _) => Routing::Nothing,
                };
                (result.settlement, routing)
            }
        };

        update.vars.extend(settlement.vars.clone());
        update.last_node_id = Some(node.id.clone());
        if let Some(error) = &settlement.error {
            update.errors.insert(key.clone(), error.clone());
        }

        record.status = settlement.status;
        record.attempt = settlement.attempts;
        record.output = settlement.output;
        record.error = settlement.error;
        record.from_cache = settlement.from_cache;
        record.finished_at = Some(Utc::now());

        if let Err(e) = self.store.complete_node(&record).await {
            tracing::error!(run_id = %scope.run_id, node_key = %key, error = %e, "failed to persist node result");
        }

        match record.status {
            NodeStatus::Error => tracing::warn!(
                run_id = %scope.run_id,
                node_key = %key,
                error = record.error.as_deref().unwrap_or_default(),
                "node failed"
            ),
            status => tracing::info!(
                run_id = %scope.run_id,
                node_key = %key,
                status = %status,
                from_cache = record.from_cache,
                "node settled"
            ),
        }
        self.event_bus.publish(EngineEvent::NodeSettled {
            run_id: scope.run_id,
            node_key: key,
            status: record.status,
            from_cache: record.from_cache,
        });

        NodeOutcome {
            node_id: node.id,
            status: record.status,
            update,
            routing,
            failures,
        }
    }

    fn runner<'a>(&'a self, scope: &'a Scope) -> NodeRunner<'a, C> {
        NodeRunner {
            evaluator: &self.evaluator,
            cache: self.cache.as_ref(),
            invoker: &self.invoker,
            key_locks: &self.key_locks,
            config: &self.config,
            event_bus: &self.event_bus,
            run_id: scope.run_id,
            user_id: &scope.user_id,
        }
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    fn route(
        &self,
        scope: &Scope,
        ctx: &mut ExecutionContext,
        node_id: &str,
        status: NodeStatus,
        routing: &Routing,
    ) -> Vec<Pending> {
        let edges = scope.index.outgoing(node_id);
        let context_value = ctx.to_expression_context();
        let pending = |target: &str| Pending {
            target: target.to_string(),
            source: Some(node_id.to_string()),
        };

        let mut next = Vec::new();
        match routing {
            Routing::Nothing => {}
            Routing::Normal => {
                for edge in edges {
                    if self.edge_fires(scope, ctx, edge, status, &context_value) {
                        next.push(pending(&edge.target));
                    }
                }
            }
            Routing::Except(body_start) => {
                for edge in edges.into_iter().filter(|e| e.target != *body_start) {
                    if self.edge_fires(scope, ctx, edge, status, &context_value) {
                        next.push(pending(&edge.target));
                    }
                }
            }
            Routing::ErrorEdges => {
                for edge in edges
                    .into_iter()
                    .filter(|e| e.when == Some(EdgeWhen::Error))
                {
                    if self.edge_fires(scope, ctx, edge, status, &context_value) {
                        next.push(pending(&edge.target));
                    }
                }
            }
            Routing::Chosen(None) => {}
            Routing::Chosen(Some(target)) => {
                let candidates: Vec<&EdgeDefinition> =
                    edges.into_iter().filter(|e| e.target == *target).collect();
                if candidates.is_empty() {
                    next.push(pending(target));
                } else if let Some(edge) = candidates
                    .into_iter()
                    .find(|edge| self.edge_fires(scope, ctx, edge, status, &context_value))
                {
                    next.push(pending(&edge.target));
                } else {
                    tracing::debug!(
                        run_id = %scope.run_id,
                        node_id,
                        target = %target,
                        "no edge toward chosen branch passed its gates"
                    );
                }
            }
        }
        next
    }

    /// Apply the `when` and `condition` gates of one edge.
    fn edge_fires(
        &self,
        scope: &Scope,
        ctx: &mut ExecutionContext,
        edge: &EdgeDefinition,
        status: NodeStatus,
        context_value: &Value,
    ) -> bool {
        let when_passes = match edge.when {
            None | Some(EdgeWhen::Always) => true,
            Some(EdgeWhen::Success) => status == NodeStatus::Done,
            Some(EdgeWhen::Error) => status == NodeStatus::Error,
        };
        if !when_passes {
            return false;
        }

        let Some(condition) = &edge.condition else {
            return true;
        };
        match self.evaluator.evaluate_bool(condition, context_value) {
            Ok(passes) => passes,
            Err(e) => {
                tracing::warn!(
                    run_id = %scope.run_id,
                    source = %edge.source,
                    target = %edge.target,
                    error = %e,
                    "edge condition failed to evaluate"
                );
                ctx.record_error(&format!("{}->{}", edge.source, edge.target), e.to_string());
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    async fn loop_while(
        self: Arc<Self>,
        scope: &Scope,
        node_id: &str,
        key: &str,
        data: &LoopWhileData,
        mut ctx: ExecutionContext,
    ) -> LoopResult {
        let base = ctx.clone();
        let parent_frame = ctx.loop_frame.clone();
        let max_iterations = data
            .max_iterations
            .unwrap_or(self.config.max_loop_iterations);
        let mut failures = Vec::new();
        let mut iterations: u32 = 0;

        let settlement = loop {
            if scope.token.is_cancelled() {
                break Settlement::failed("run cancelled");
            }
            match self
                .evaluator
                .evaluate_bool(&data.condition, &ctx.to_expression_context())
            {
                Ok(true) => {}
                Ok(false) => {
                    break Settlement::done(json!({ "loop": "exited", "iterations": iterations }));
                }
                Err(e) => break Settlement::failed(e.to_string()),
            }
            if iterations >= max_iterations {
                break Settlement::failed(format!(
                    "loop exceeded max_iterations ({max_iterations})"
                ));
            }

            iterations += 1;
            ctx.apply(ContextUpdate::loop_iteration(node_id, iterations));
            let frame = LoopFrame {
                iteration: Some(iterations),
                ..parent_frame.clone().unwrap_or_default()
            };
            tracing::debug!(run_id = %scope.run_id, node_key = key, iteration = iterations, "loop iteration");

            let child = scope.child(format!("{key}[{}]", iterations - 1), node_id);
            let seeds = vec![Pending {
                target: data.body_start.clone(),
                source: Some(node_id.to_string()),
            }];
            let outcome = Arc::clone(&self)
                .drive_scope(child, ctx.with_loop_frame(frame), seeds)
                .await;

            ctx = outcome.ctx;
            ctx.loop_frame = parent_frame.clone();
            failures.extend(outcome.failures);
            if outcome.cancelled {
                break Settlement::failed("run cancelled");
            }
        };

        LoopResult {
            settlement,
            update: ctx.diff_since(&base),
            failures,
        }
    }

    async fn loop_foreach(
        self: Arc<Self>,
        scope: &Scope,
        node_id: &str,
        key: &str,
        data: &LoopForeachData,
        mut ctx: ExecutionContext,
    ) -> LoopResult {
        let base = ctx.clone();
        let context_value = ctx.to_expression_context();
        let items = match self
            .evaluator
            .evaluate_value(&data.source_array_expr, &context_value)
        {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                return LoopResult::failed(format!(
                    "source_array_expr must produce an array, got {}",
                    json_type(&other)
                ));
            }
            Err(e) => return LoopResult::failed(e.to_string()),
        };

        let entries: Vec<String> = match &data.body_start {
            Some(body_start) => vec![body_start.clone()],
            None => {
                let mut targets = Vec::new();
                for edge in scope.index.outgoing(node_id) {
                    if self.edge_fires(scope, &mut ctx, edge, NodeStatus::Done, &context_value) {
                        targets.push(edge.target.clone());
                    }
                }
                targets
            }
        };

        let spawned = items.len();
        let limit = data
            .max_concurrency
            .unwrap_or(self.config.max_parallel_nodes)
            .max(1);
        let parent_iteration = ctx.loop_frame.as_ref().and_then(|f| f.iteration);
        let snapshot = ctx.clone();

        let outcomes: Vec<ScopeOutcome> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let child = scope.child(format!("{key}[{index}]"), node_id);
                let frame = LoopFrame {
                    item: Some(item),
                    index: Some(index),
                    iteration: parent_iteration,
                };
                let seeds = entries
                    .iter()
                    .map(|target| Pending {
                        target: target.clone(),
                        source: Some(node_id.to_string()),
                    })
                    .collect();
                Arc::clone(&self).drive_scope(child, snapshot.with_loop_frame(frame), seeds)
            })
            .buffered(limit)
            .collect()
            .await;

        let mut failures = Vec::new();
        let mut cancelled = false;
        for outcome in outcomes {
            ctx.apply(outcome.ctx.diff_since(&snapshot));
            failures.extend(outcome.failures);
            cancelled |= outcome.cancelled;
        }
        let settlement = if cancelled {
            Settlement::failed("run cancelled")
        } else {
            Settlement::done(json!({ "spawned": spawned }))
        };
        LoopResult {
            settlement,
            update: ctx.diff_since(&base),
            failures,
        }
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    async fn finalize(&self, run_id: Uuid, outcome: ScopeOutcome) -> RunStatus {
        self.cancellation_tokens.remove(&run_id);
        let mut failures = outcome.failures;

        let errors = match self.store.count_errors(&run_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "failed to count node errors");
                failures.push(format!("failed to count node errors: {e}"));
                0
            }
        };

        let error = if outcome.cancelled {
            Some("run cancelled".to_string())
        } else if !failures.is_empty() {
            Some(failures.join("; "))
        } else if errors > 0 {
            Some(format!("{errors} node(s) failed"))
        } else {
            None
        };
        let status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        match self.store.finish_run(&run_id, status, error.as_deref()).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(run_id = %run_id, "run was already finalized"),
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "failed to finalize run"),
        }

        match &error {
            Some(reason) => tracing::warn!(run_id = %run_id, errors, reason = %reason, "run failed"),
            None => tracing::info!(run_id = %run_id, "run succeeded"),
        }
        self.event_bus.publish(EngineEvent::RunFinished {
            run_id,
            status,
            error,
        });
        status
    }
}

fn gateway_routing(settlement: &Settlement, chosen: Option<String>) -> Routing {
    match settlement.status {
        NodeStatus::Done => Routing::Chosen(chosen),
        _ => Routing::ErrorEdges,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
