//! Launches registered workflow versions.
//!
//! The launcher resolves `(workflow_id, version)` to a DAG through the
//! [`WorkflowStore`], shapes the raw trigger event with the trigger's
//! `data_mapping`, and hands the result to a [`WorkflowExecutor`].

use std::sync::Arc;

use runloom_types::dag::{Dag, NodeKind};
use runloom_types::error::RepositoryError;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::WorkflowStore;

use super::context::lookup_path;
use super::executor::{EngineError, WorkflowExecutor};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("workflow '{workflow_id}' has no version '{version}'")]
    UnknownVersion { workflow_id: String, version: String },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct RunLauncher<W: WorkflowStore, E: WorkflowExecutor> {
    workflows: Arc<W>,
    executor: E,
}

impl<W: WorkflowStore, E: WorkflowExecutor> RunLauncher<W, E> {
    pub fn new(workflows: Arc<W>, executor: E) -> Self {
        Self {
            workflows,
            executor,
        }
    }

    /// Launch and wait for the run to finish.
    pub async fn launch(
        &self,
        workflow_id: &str,
        version: &str,
        event: &Value,
        user_id: &str,
    ) -> Result<Uuid, LaunchError> {
        let (dag, inputs) = self.prepare(workflow_id, version, event).await?;
        Ok(self
            .executor
            .execute(dag, inputs, user_id, workflow_id, version)
            .await?)
    }

    /// Launch in the background; returns once the run record exists.
    pub async fn launch_detached(
        &self,
        workflow_id: &str,
        version: &str,
        event: &Value,
        user_id: &str,
    ) -> Result<Uuid, LaunchError> {
        let (dag, inputs) = self.prepare(workflow_id, version, event).await?;
        Ok(self
            .executor
            .spawn_execute(dag, inputs, user_id, workflow_id, version)
            .await?)
    }

    async fn prepare(
        &self,
        workflow_id: &str,
        version: &str,
        event: &Value,
    ) -> Result<(Dag, Value), LaunchError> {
        let dag = self
            .workflows
            .get_version(workflow_id, version)
            .await?
            .ok_or_else(|| LaunchError::UnknownVersion {
                workflow_id: workflow_id.to_string(),
                version: version.to_string(),
            })?;
        let inputs = map_trigger_payload(&dag, event);
        tracing::debug!(workflow_id, version, "workflow version resolved");
        Ok((dag, inputs))
    }
}

/// Apply the first trigger's `data_mapping` to a raw event.
///
/// Each mapping entry binds a context field to a dotted path into the
/// event. No trigger, or an empty mapping, passes the event through.
pub fn map_trigger_payload(dag: &Dag, event: &Value) -> Value {
    let mapping = dag.nodes.iter().find_map(|node| match &node.kind {
        NodeKind::Trigger(data) => Some(&data.data_mapping),
        _ => None,
    });

    match mapping {
        Some(mapping) if !mapping.is_empty() => {
            let fields: Map<String, Value> = mapping
                .iter()
                .map(|(field, path)| (field.clone(), lookup_path(event, path)))
                .collect();
            Value::Object(fields)
        }
        _ => event.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::repository::in_memory::{
        InMemoryIdempotencyCache, InMemoryStateStore, InMemoryWorkflowStore,
    };
    use crate::repository::StateStore;
    use crate::workflow::executor::WorkflowEngine;
    use crate::workflow::invoker::{ActionInvoker, ActionRequest, BoxActionInvoker, InvokeError};
    use runloom_types::config::EngineConfig;
    use runloom_types::run::RunStatus;
    use serde_json::json;

    struct Echo;

    impl ActionInvoker for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, request: &ActionRequest) -> Result<Value, InvokeError> {
            Ok(request.arguments.clone())
        }
    }

    fn dag() -> Dag {
        serde_json::from_value(json!({
            "nodes": [
                { "id": "start", "type": "trigger", "data": {
                    "event_type": "gmail.message_received",
                    "data_mapping": { "subject": "message.subject", "sender": "message.from.0" } } },
                { "id": "log", "type": "action", "data": {
                    "tool": "sheets", "action": "append", "requires_auth": false,
                    "input_template": { "row": "{{ inputs.sender }}: {{ inputs.subject }}" } } }
            ],
            "edges": [ { "source": "start", "target": "log" } ]
        }))
        .unwrap()
    }

    #[test]
    fn test_mapping_applied() {
        let event = json!({ "message": { "subject": "Hi", "from": ["ann@example.com"] } });
        assert_eq!(
            map_trigger_payload(&dag(), &event),
            json!({ "subject": "Hi", "sender": "ann@example.com" })
        );
    }

    #[test]
    fn test_empty_mapping_passes_through() {
        let mut dag = dag();
        dag.nodes[0] = serde_json::from_value(json!({ "id": "start", "type": "trigger" })).unwrap();
        let event = json!({ "anything": [1, 2] });
        assert_eq!(map_trigger_payload(&dag, &event), event);
    }

    #[tokio::test]
    async fn test_launch_registered_version() {
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        workflows.save_version("inbox", "1.0", &dag()).await.unwrap();

        let store = Arc::new(InMemoryStateStore::new());
        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::new(InMemoryIdempotencyCache::new()),
            BoxActionInvoker::new(Echo),
            EngineConfig::default(),
            EventBus::default(),
        );
        let launcher = RunLauncher::new(Arc::clone(&workflows), engine);

        let event = json!({ "message": { "subject": "Hi", "from": ["ann@example.com"] } });
        let run_id = launcher.launch("inbox", "1.0", &event, "user-1").await.unwrap();

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.workflow_id, "inbox");
        assert_eq!(run.version, "1.0");
        let log = store.get_node(&run_id, "log").await.unwrap().unwrap();
        assert_eq!(log.output, Some(json!({ "row": "ann@example.com: Hi" })));
    }

    #[tokio::test]
    async fn test_unknown_version() {
        let engine = WorkflowEngine::new(
            Arc::new(InMemoryStateStore::new()),
            Arc::new(InMemoryIdempotencyCache::new()),
            BoxActionInvoker::new(Echo),
            EngineConfig::default(),
            EventBus::default(),
        );
        let launcher = RunLauncher::new(Arc::new(InMemoryWorkflowStore::new()), engine);
        let err = launcher
            .launch("inbox", "9.9", &json!({}), "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::UnknownVersion { .. }));
    }
}
