//! Run and node execution records.
//!
//! A [`WorkflowRun`] is created once per `execute` call and settles exactly
//! once. Each dispatched node produces one [`NodeExecution`] keyed by its
//! scoped node key (see [`node_key`]).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::NodeType;

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Done,
    Error,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Done => "done",
            NodeStatus::Error => "error",
            NodeStatus::Skipped => "skipped",
        }
    }

    /// DONE, ERROR and SKIPPED are terminal; a terminal node is never re-run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Error | NodeStatus::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeStatus::Pending),
            "running" => Ok(NodeStatus::Running),
            "done" => Ok(NodeStatus::Done),
            "error" => Ok(NodeStatus::Error),
            "skipped" => Ok(NodeStatus::Skipped),
            other => Err(format!("invalid node status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One execution attempt of a DAG against a specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    pub workflow_id: String,
    pub version: String,
    pub user_id: String,
    pub status: RunStatus,
    /// Run-level failure reason (cancellation, routing gap, node errors).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// A fresh RUNNING run with a new time-sortable id.
    pub fn start(workflow_id: &str, version: &str, user_id: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            version: version.to_string(),
            user_id: user_id.to_string(),
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Lifecycle record of one node (in one scope) within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub run_id: Uuid,
    /// Scoped key; equal to `node_id` at the run's root scope.
    pub node_key: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    /// Number of provider calls made (actions); 1 for other node types.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// The RUNNING record inserted when a node key is claimed for dispatch.
    pub fn claimed(run_id: Uuid, node_key: &str, node_id: &str, node_type: NodeType) -> Self {
        Self {
            run_id,
            node_key: node_key.to_string(),
            node_id: node_id.to_string(),
            node_type,
            status: NodeStatus::Running,
            attempt: 0,
            output: None,
            error: None,
            from_cache: false,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }
}

/// Build the scoped key for `node_id` inside `scope`.
///
/// The root scope is the empty string; loop scopes look like `"loop[2]"` and
/// nest as `"outer[0]/inner[1]"`.
pub fn node_key(scope: &str, node_id: &str) -> String {
    if scope.is_empty() {
        node_id.to_string()
    } else {
        format!("{scope}/{node_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(NodeStatus::Done.is_terminal());
        assert!(NodeStatus::Error.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(!NodeStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!("skipped".parse::<NodeStatus>().unwrap(), NodeStatus::Skipped);
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(RunStatus::Success).unwrap(), "success");
        assert_eq!(serde_json::to_value(NodeStatus::Done).unwrap(), "done");
    }

    #[test]
    fn test_node_key_scoping() {
        assert_eq!(node_key("", "send"), "send");
        assert_eq!(node_key("loop[0]", "send"), "loop[0]/send");
        assert_eq!(node_key("outer[1]/inner[3]", "send"), "outer[1]/inner[3]/send");
    }

    #[test]
    fn test_run_start_is_running() {
        let run = WorkflowRun::start("wf", "1.0", "user-1");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());
        assert_eq!(run.id.get_version_num(), 7);
    }
}
