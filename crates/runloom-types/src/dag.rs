//! Workflow DAG types as produced by the upstream generator/validator.
//!
//! The JSON shape is consumed as-is:
//!
//! ```json
//! {
//!   "nodes": [ { "id": "send", "type": "action", "data": { "tool": "gmail", ... } } ],
//!   "edges": [ { "source": "start", "target": "send", "when": "always", "condition": null } ]
//! }
//! ```
//!
//! Each node's `data` payload is decoded into a typed [`NodeKind`] variant
//! keyed by the node's `type`. Nodes without a `data` field (e.g. `parallel`)
//! decode from an empty object.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

/// A workflow version: nodes plus typed edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

impl Dag {
    /// Look up a node definition by id.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Ids of every trigger node, in declaration order.
    pub fn trigger_ids(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.node_type() == NodeType::Trigger)
            .map(|n| n.id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// The node `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Action,
    GatewayIf,
    GatewaySwitch,
    Parallel,
    Join,
    LoopWhile,
    LoopForeach,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::Action => "action",
            NodeType::GatewayIf => "gateway_if",
            NodeType::GatewaySwitch => "gateway_switch",
            NodeType::Parallel => "parallel",
            NodeType::Join => "join",
            NodeType::LoopWhile => "loop_while",
            NodeType::LoopForeach => "loop_foreach",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown node type: '{s}'"))
    }
}

/// A single node in the DAG.
///
/// Serialized as `{ "id", "type", "data" }`; `kind` carries the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct NodeDefinition {
    pub id: String,
    pub kind: NodeKind,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

/// Type-specific node payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger(TriggerData),
    Action(ActionData),
    GatewayIf(GatewayIfData),
    GatewaySwitch(GatewaySwitchData),
    Parallel,
    Join(JoinData),
    LoopWhile(LoopWhileData),
    LoopForeach(LoopForeachData),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Trigger(_) => NodeType::Trigger,
            NodeKind::Action(_) => NodeType::Action,
            NodeKind::GatewayIf(_) => NodeType::GatewayIf,
            NodeKind::GatewaySwitch(_) => NodeType::GatewaySwitch,
            NodeKind::Parallel => NodeType::Parallel,
            NodeKind::Join(_) => NodeType::Join,
            NodeKind::LoopWhile(_) => NodeType::LoopWhile,
            NodeKind::LoopForeach(_) => NodeType::LoopForeach,
        }
    }
}

/// Wire form of a node, used only for (de)serialization.
#[derive(Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

fn decode<T: serde::de::DeserializeOwned>(id: &str, data: Value) -> Result<T, String> {
    let data = if data.is_null() { json!({}) } else { data };
    serde_json::from_value(data).map_err(|e| format!("node '{id}': invalid data: {e}"))
}

impl TryFrom<RawNode> for NodeDefinition {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let id = raw.id;
        let kind = match raw.node_type {
            NodeType::Trigger => NodeKind::Trigger(decode(&id, raw.data)?),
            NodeType::Action => NodeKind::Action(decode(&id, raw.data)?),
            NodeType::GatewayIf => NodeKind::GatewayIf(decode(&id, raw.data)?),
            NodeType::GatewaySwitch => NodeKind::GatewaySwitch(decode(&id, raw.data)?),
            NodeType::Parallel => NodeKind::Parallel,
            NodeType::Join => NodeKind::Join(decode(&id, raw.data)?),
            NodeType::LoopWhile => NodeKind::LoopWhile(decode(&id, raw.data)?),
            NodeType::LoopForeach => NodeKind::LoopForeach(decode(&id, raw.data)?),
        };
        Ok(Self { id, kind })
    }
}

impl From<NodeDefinition> for RawNode {
    fn from(node: NodeDefinition) -> Self {
        let node_type = node.node_type();
        let data = match node.kind {
            NodeKind::Trigger(d) => serde_json::to_value(d),
            NodeKind::Action(d) => serde_json::to_value(d),
            NodeKind::GatewayIf(d) => serde_json::to_value(d),
            NodeKind::GatewaySwitch(d) => serde_json::to_value(d),
            NodeKind::Parallel => Ok(Value::Null),
            NodeKind::Join(d) => serde_json::to_value(d),
            NodeKind::LoopWhile(d) => serde_json::to_value(d),
            NodeKind::LoopForeach(d) => serde_json::to_value(d),
        }
        .unwrap_or(Value::Null);
        Self {
            id: node.id,
            node_type,
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Node payloads
// ---------------------------------------------------------------------------

/// Trigger payload. `data_mapping` maps context field -> dotted path into
/// the raw trigger event; it is applied before the engine sees `inputs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data_mapping: BTreeMap<String, String>,
}

/// A side-effecting call to the external tool provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Whether the provider call needs a `connection_id` (default true).
    #[serde(default = "default_requires_auth")]
    pub requires_auth: bool,
    /// Argument template rendered against the execution context.
    #[serde(default = "empty_object")]
    pub input_template: Value,
    /// Local variable name -> dotted path into the action result.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_requires_auth() -> bool {
    true
}

fn empty_object() -> Value {
    json!({})
}

impl Default for ActionData {
    fn default() -> Self {
        Self {
            tool: None,
            action: None,
            connection_id: None,
            requires_auth: default_requires_auth(),
            input_template: empty_object(),
            output_vars: BTreeMap::new(),
            retry: RetryPolicy::default(),
            timeout_ms: None,
        }
    }
}

/// Retry policy for an action node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Base delay between attempts in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Linear,
    Exponential,
}

/// If/else-if/else branching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayIfData {
    #[serde(default)]
    pub branches: Vec<GatewayBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub else_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayBranch {
    pub expr: String,
    pub to: String,
}

/// Value-based multi-way branching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySwitchData {
    pub selector: String,
    #[serde(default)]
    pub cases: Vec<SwitchCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: Value,
    pub to: String,
}

/// Synchronization barrier over incoming branches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinData {
    #[serde(default)]
    pub mode: JoinMode,
    /// Required arrivals for `quorum` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    #[default]
    All,
    Any,
    Quorum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopWhileData {
    pub condition: String,
    pub body_start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopForeachData {
    pub source_array_expr: String,
    /// Entry node of the per-item body. When absent, the targets of the
    /// loop's outgoing edges are run once per item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A directed edge with an optional status gate and condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<EdgeWhen>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl EdgeDefinition {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            when: None,
            condition: None,
        }
    }

    pub fn when(mut self, when: EdgeWhen) -> Self {
        self.when = Some(when);
        self
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeWhen {
    Success,
    Error,
    Always,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> Value {
        json!({
            "nodes": [
                { "id": "start", "type": "trigger", "data": { "event_type": "gmail.new_email" } },
                { "id": "fan", "type": "parallel" },
                {
                    "id": "notify",
                    "type": "action",
                    "data": {
                        "tool": "slack",
                        "action": "post_message",
                        "connection_id": "conn-1",
                        "input_template": { "text": "{{ inputs.subject }}" },
                        "output_vars": { "ts": "message.ts" },
                        "retry": { "retries": 2, "backoff": "exponential", "delay_ms": 100 }
                    }
                },
                { "id": "sync", "type": "join", "data": { "mode": "quorum", "count": 2 } },
                {
                    "id": "route",
                    "type": "gateway_switch",
                    "data": {
                        "selector": "inputs.priority",
                        "cases": [ { "value": "high", "to": "notify" } ],
                        "default_to": "sync"
                    }
                }
            ],
            "edges": [
                { "source": "start", "target": "fan", "when": "always" },
                { "source": "fan", "target": "notify", "when": null, "condition": "inputs.ok" }
            ]
        })
    }

    #[test]
    fn test_deserialize_full_dag() {
        let dag: Dag = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(dag.nodes.len(), 5);
        assert_eq!(dag.edges.len(), 2);
        assert_eq!(dag.trigger_ids(), vec!["start"]);

        match &dag.node("notify").unwrap().kind {
            NodeKind::Action(data) => {
                assert_eq!(data.tool.as_deref(), Some("slack"));
                assert!(data.requires_auth);
                assert_eq!(data.retry.retries, 2);
                assert_eq!(data.retry.backoff, Backoff::Exponential);
                assert_eq!(data.output_vars["ts"], "message.ts");
            }
            other => panic!("expected action, got {other:?}"),
        }

        match &dag.node("sync").unwrap().kind {
            NodeKind::Join(data) => {
                assert_eq!(data.mode, JoinMode::Quorum);
                assert_eq!(data.count, Some(2));
            }
            other => panic!("expected join, got {other:?}"),
        }

        assert_eq!(dag.edges[0].when, Some(EdgeWhen::Always));
        assert_eq!(dag.edges[1].when, None);
        assert_eq!(dag.edges[1].condition.as_deref(), Some("inputs.ok"));
    }

    #[test]
    fn test_parallel_without_data() {
        let node: NodeDefinition =
            serde_json::from_value(json!({ "id": "p", "type": "parallel" })).unwrap();
        assert_eq!(node.kind, NodeKind::Parallel);
    }

    #[test]
    fn test_action_defaults() {
        let node: NodeDefinition = serde_json::from_value(json!({
            "id": "a",
            "type": "action",
            "data": { "tool": "t", "action": "x" }
        }))
        .unwrap();
        let NodeKind::Action(data) = node.kind else {
            panic!("expected action");
        };
        assert!(data.requires_auth);
        assert_eq!(data.input_template, json!({}));
        assert_eq!(data.retry, RetryPolicy::default());
        assert!(data.timeout_ms.is_none());
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let result: Result<NodeDefinition, _> =
            serde_json::from_value(json!({ "id": "x", "type": "teleport" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_data_reports_node_id() {
        let err = serde_json::from_value::<NodeDefinition>(json!({
            "id": "loop1",
            "type": "loop_while",
            "data": { "condition": "true" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("loop1"));
    }

    #[test]
    fn test_serialize_keeps_wire_shape() {
        let node = NodeDefinition::new(
            "j",
            NodeKind::Join(JoinData {
                mode: JoinMode::Any,
                count: None,
            }),
        );
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value, json!({ "id": "j", "type": "join", "data": { "mode": "any" } }));

        let parallel = serde_json::to_value(NodeDefinition::new("p", NodeKind::Parallel)).unwrap();
        assert_eq!(parallel, json!({ "id": "p", "type": "parallel" }));
    }

    #[test]
    fn test_node_type_from_str() {
        assert_eq!("gateway_if".parse::<NodeType>().unwrap(), NodeType::GatewayIf);
        assert!("nope".parse::<NodeType>().is_err());
        assert_eq!(NodeType::LoopForeach.to_string(), "loop_foreach");
    }
}
