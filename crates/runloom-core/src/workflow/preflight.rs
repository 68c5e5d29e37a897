//! Structural checks run before a run is created.
//!
//! A DAG that fails preflight never produces a run record. Catalog and
//! schema correctness are the upstream validator's job; these checks only
//! cover what the engine needs to execute the graph.

use std::collections::HashSet;

use runloom_types::dag::{Dag, JoinMode, NodeKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreflightError {
    #[error("workflow has no nodes")]
    NoNodes,

    #[error("workflow has no edges")]
    NoEdges,

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("edge {source_id} -> {target_id} references unknown node '{missing}'")]
    DanglingEdge {
        source_id: String,
        target_id: String,
        missing: String,
    },

    #[error("action node '{node}' is missing '{field}'")]
    MissingActionField { node: String, field: &'static str },

    #[error("action node '{0}' requires auth but has no connection_id")]
    MissingConnection(String),

    #[error("node '{node}' routes to unknown node '{target}'")]
    UnknownTarget { node: String, target: String },

    #[error("quorum join '{0}' needs a positive count")]
    InvalidQuorum(String),
}

/// Return the first structural problem in `dag`, if any.
pub fn preflight(dag: &Dag) -> Result<(), PreflightError> {
    match check_all(dag).into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Every structural problem in `dag`, in discovery order.
pub fn check_all(dag: &Dag) -> Vec<PreflightError> {
    let mut errors = Vec::new();

    if dag.nodes.is_empty() {
        errors.push(PreflightError::NoNodes);
    }
    if dag.edges.is_empty() {
        errors.push(PreflightError::NoEdges);
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for node in &dag.nodes {
        if !ids.insert(node.id.as_str()) {
            errors.push(PreflightError::DuplicateNode(node.id.clone()));
        }
    }

    for edge in &dag.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                errors.push(PreflightError::DanglingEdge {
                    source_id: edge.source.clone(),
                    target_id: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    let check_target = |node: &str, target: &str, errors: &mut Vec<PreflightError>| {
        if !ids.contains(target) {
            errors.push(PreflightError::UnknownTarget {
                node: node.to_string(),
                target: target.to_string(),
            });
        }
    };

    for node in &dag.nodes {
        let id = node.id.as_str();
        match &node.kind {
            NodeKind::Action(data) => {
                if data.tool.as_deref().is_none_or(str::is_empty) {
                    errors.push(PreflightError::MissingActionField {
                        node: id.to_string(),
                        field: "tool",
                    });
                }
                if data.action.as_deref().is_none_or(str::is_empty) {
                    errors.push(PreflightError::MissingActionField {
                        node: id.to_string(),
                        field: "action",
                    });
                }
                if data.requires_auth && data.connection_id.as_deref().is_none_or(str::is_empty) {
                    errors.push(PreflightError::MissingConnection(id.to_string()));
                }
            }
            NodeKind::GatewayIf(data) => {
                for branch in &data.branches {
                    check_target(id, &branch.to, &mut errors);
                }
                if let Some(else_to) = &data.else_to {
                    check_target(id, else_to, &mut errors);
                }
            }
            NodeKind::GatewaySwitch(data) => {
                for case in &data.cases {
                    check_target(id, &case.to, &mut errors);
                }
                if let Some(default_to) = &data.default_to {
                    check_target(id, default_to, &mut errors);
                }
            }
            NodeKind::LoopWhile(data) => check_target(id, &data.body_start, &mut errors),
            NodeKind::LoopForeach(data) => {
                if let Some(body_start) = &data.body_start {
                    check_target(id, body_start, &mut errors);
                }
            }
            NodeKind::Join(data) => {
                if data.mode == JoinMode::Quorum && data.count.unwrap_or(0) == 0 {
                    errors.push(PreflightError::InvalidQuorum(id.to_string()));
                }
            }
            NodeKind::Trigger(_) | NodeKind::Parallel => {}
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dag(value: serde_json::Value) -> Dag {
        serde_json::from_value(value).unwrap()
    }

    fn valid() -> serde_json::Value {
        json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "send", "type": "action",
                  "data": { "tool": "gmail", "action": "send", "connection_id": "c1" } }
            ],
            "edges": [ { "source": "start", "target": "send", "when": "always" } ]
        })
    }

    #[test]
    fn test_valid_dag_passes() {
        assert_eq!(preflight(&dag(valid())), Ok(()));
    }

    #[test]
    fn test_empty_graph_rejected() {
        let errors = check_all(&dag(json!({ "nodes": [], "edges": [] })));
        assert_eq!(errors, vec![PreflightError::NoNodes, PreflightError::NoEdges]);
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let mut value = valid();
        value["edges"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "source": "send", "target": "ghost" }));
        let err = preflight(&dag(value)).unwrap_err();
        assert_eq!(
            err,
            PreflightError::DanglingEdge {
                source_id: "send".to_string(),
                target_id: "ghost".to_string(),
                missing: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_action_missing_tool_rejected() {
        let mut value = valid();
        value["nodes"][1]["data"] = json!({ "action": "send", "connection_id": "c1" });
        assert_eq!(
            preflight(&dag(value)).unwrap_err(),
            PreflightError::MissingActionField {
                node: "send".to_string(),
                field: "tool"
            }
        );
    }

    #[test]
    fn test_connection_required_only_with_auth() {
        let mut value = valid();
        value["nodes"][1]["data"] = json!({ "tool": "http", "action": "get" });
        assert_eq!(
            preflight(&dag(value.clone())).unwrap_err(),
            PreflightError::MissingConnection("send".to_string())
        );

        value["nodes"][1]["data"]["requires_auth"] = json!(false);
        assert_eq!(preflight(&dag(value)), Ok(()));
    }

    #[test]
    fn test_duplicate_ids_and_unknown_targets() {
        let value = json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "start", "type": "parallel" },
                { "id": "gate", "type": "gateway_if",
                  "data": { "branches": [ { "expr": "true", "to": "nowhere" } ] } },
                { "id": "sync", "type": "join", "data": { "mode": "quorum" } }
            ],
            "edges": [ { "source": "start", "target": "gate" } ]
        });
        let errors = check_all(&dag(value));
        assert!(errors.contains(&PreflightError::DuplicateNode("start".to_string())));
        assert!(errors.contains(&PreflightError::UnknownTarget {
            node: "gate".to_string(),
            target: "nowhere".to_string(),
        }));
        assert!(errors.contains(&PreflightError::InvalidQuorum("sync".to_string())));
    }
}
