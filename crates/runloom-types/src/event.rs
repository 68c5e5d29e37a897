//! Event types for the engine event bus.
//!
//! `EngineEvent` is broadcast while runs execute. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{NodeStatus, RunStatus};

/// Lifecycle events emitted by the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run was created and its entry nodes were seeded.
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
        version: String,
    },

    /// A node key was claimed and dispatched.
    NodeStarted {
        run_id: Uuid,
        node_key: String,
        node_type: String,
    },

    /// An action attempt failed and will be retried after `delay_ms`.
    NodeRetrying {
        run_id: Uuid,
        node_key: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A node reached a terminal status.
    NodeSettled {
        run_id: Uuid,
        node_key: String,
        status: NodeStatus,
        from_cache: bool,
    },

    /// The run settled.
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::NodeStarted { run_id, .. }
            | EngineEvent::NodeRetrying { run_id, .. }
            | EngineEvent::NodeSettled { run_id, .. }
            | EngineEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}
