//! Per-run execution context.
//!
//! `ExecutionContext` is the mutable state that flows through a run:
//! the event payload (`inputs`), variables extracted from action results
//! (`vars`), free-form `artifacts`, per-node `errors`, and the loop frame
//! bound inside loop bodies. Node tasks work on snapshots and hand back a
//! [`ContextUpdate`], which the orchestrator merges in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub user_id: String,
    /// Event payload. Read-only after creation.
    pub inputs: Value,
    pub vars: Map<String, Value>,
    pub artifacts: Map<String, Value>,
    /// Node key (or `"<source>-><target>"` for edge conditions) -> message.
    pub errors: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_id: Option<String>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_frame: Option<LoopFrame>,
}

/// Values bound as `loop.*` inside a loop body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl ExecutionContext {
    pub fn new(run_id: Uuid, workflow_id: &str, user_id: &str, inputs: Value) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            inputs,
            vars: Map::new(),
            artifacts: Map::new(),
            errors: BTreeMap::new(),
            last_node_id: None,
            loop_frame: None,
        }
    }

    /// Build the JSON object that expressions and templates evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "inputs": { ... },
    ///   "vars": { ... },
    ///   "artifacts": { ... },
    ///   "errors": { "<node_key>": "<message>" },
    ///   "run": { "id": "...", "workflow_id": "...", "user_id": "..." },
    ///   "loop": { "item": ..., "index": 0, "iteration": 1 } | null
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        json!({
            "inputs": self.inputs,
            "vars": self.vars,
            "artifacts": self.artifacts,
            "errors": self.errors,
            "run": {
                "id": self.run_id.to_string(),
                "workflow_id": self.workflow_id,
                "user_id": self.user_id,
            },
            "loop": self.loop_frame,
        })
    }

    /// Merge a node's (or a sub-scope's) changes into this context.
    pub fn apply(&mut self, update: ContextUpdate) {
        for (name, value) in update.vars {
            self.vars.insert(name, value);
        }
        for (name, value) in update.artifacts {
            match self.artifacts.get_mut(&name) {
                Some(existing) => deep_merge(existing, value),
                None => {
                    self.artifacts.insert(name, value);
                }
            }
        }
        self.errors.extend(update.errors);
        if update.last_node_id.is_some() {
            self.last_node_id = update.last_node_id;
        }
    }

    /// Record a message in `errors`.
    pub fn record_error(&mut self, key: &str, message: impl Into<String>) {
        self.errors.insert(key.to_string(), message.into());
    }

    /// Derive the context for a loop body: same data, new loop frame.
    pub fn with_loop_frame(&self, frame: LoopFrame) -> Self {
        let mut scoped = self.clone();
        scoped.loop_frame = Some(frame);
        scoped
    }

    /// Everything in `self` that differs from `base`, as an update.
    ///
    /// Used to hand a sub-scope's accumulated changes back to its parent.
    pub fn diff_since(&self, base: &ExecutionContext) -> ContextUpdate {
        let vars = self
            .vars
            .iter()
            .filter(|(k, v)| base.vars.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let artifacts = self
            .artifacts
            .iter()
            .filter(|(k, v)| base.artifacts.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let errors = self
            .errors
            .iter()
            .filter(|(k, v)| base.errors.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ContextUpdate {
            vars,
            artifacts,
            errors,
            last_node_id: self.last_node_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextUpdate
// ---------------------------------------------------------------------------

/// Changes a node task hands back to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    pub vars: Map<String, Value>,
    /// Deep-merged into `artifacts`.
    pub artifacts: Map<String, Value>,
    pub errors: BTreeMap<String, String>,
    pub last_node_id: Option<String>,
}

impl ContextUpdate {
    /// Set `artifacts.loops.<node_id>.iteration`.
    pub fn loop_iteration(node_id: &str, iteration: u32) -> Self {
        let mut update = Self::default();
        update.artifacts.insert(
            "loops".to_string(),
            json!({ node_id: { "iteration": iteration } }),
        );
        update
    }
}

/// Resolve a dotted path (`"message.labels.0"`) inside `value`.
///
/// Numeric segments index arrays. A missing segment yields null; an empty
/// path yields the whole value.
pub fn lookup_path(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Recursively merge `patch` into `target`: objects merge key by key,
/// anything else replaces.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext::new(Uuid::now_v7(), "wf", "user-1", json!({ "subject": "hi" }))
    }

    #[test]
    fn test_expression_context_shape() {
        let ctx = context();
        let value = ctx.to_expression_context();
        assert_eq!(value["inputs"]["subject"], "hi");
        assert_eq!(value["run"]["workflow_id"], "wf");
        assert_eq!(value["run"]["user_id"], "user-1");
        assert_eq!(value["run"]["id"], ctx.run_id.to_string());
        assert!(value["vars"].as_object().unwrap().is_empty());
        assert!(value["loop"].is_null());
    }

    #[test]
    fn test_loop_frame_exposed() {
        let ctx = context().with_loop_frame(LoopFrame {
            item: Some(json!({ "id": 7 })),
            index: Some(2),
            iteration: None,
        });
        let value = ctx.to_expression_context();
        assert_eq!(value["loop"]["item"]["id"], 7);
        assert_eq!(value["loop"]["index"], 2);
    }

    #[test]
    fn test_apply_merges_artifacts_deeply() {
        let mut ctx = context();
        ctx.apply(ContextUpdate::loop_iteration("outer", 1));
        ctx.apply(ContextUpdate::loop_iteration("inner", 3));
        ctx.apply(ContextUpdate::loop_iteration("outer", 2));

        assert_eq!(
            ctx.artifacts["loops"],
            json!({ "outer": { "iteration": 2 }, "inner": { "iteration": 3 } })
        );
    }

    #[test]
    fn test_apply_vars_and_errors() {
        let mut ctx = context();
        let mut update = ContextUpdate::default();
        update.errors.insert("send".to_string(), "boom".to_string());
        update.vars.insert("ts".to_string(), json!("123"));
        update.last_node_id = Some("send".to_string());
        ctx.apply(update);

        assert_eq!(ctx.vars["ts"], "123");
        assert_eq!(ctx.errors["send"], "boom");
        assert_eq!(ctx.last_node_id.as_deref(), Some("send"));
    }

    #[test]
    fn test_diff_since_reports_only_changes() {
        let mut base = context();
        base.vars.insert("kept".to_string(), json!(1));

        let mut scoped = base.clone();
        scoped.vars.insert("new".to_string(), json!(2));
        scoped.record_error("loop[0]/a", "failed");

        let diff = scoped.diff_since(&base);
        assert!(!diff.vars.contains_key("kept"));
        assert_eq!(diff.vars["new"], 2);
        assert_eq!(diff.errors["loop[0]/a"], "failed");
    }

    #[test]
    fn test_lookup_path() {
        let value = json!({ "message": { "id": "m1", "labels": ["inbox", "work"] } });
        assert_eq!(lookup_path(&value, "message.id"), json!("m1"));
        assert_eq!(lookup_path(&value, "message.labels.1"), json!("work"));
        assert_eq!(lookup_path(&value, "message.labels.9"), Value::Null);
        assert_eq!(lookup_path(&value, "missing.deeper"), Value::Null);
        assert_eq!(lookup_path(&value, ""), value);
    }

    #[test]
    fn test_deep_merge_replaces_scalars() {
        let mut target = json!({ "a": { "b": 1, "c": 2 }, "d": [1] });
        deep_merge(&mut target, json!({ "a": { "b": 5 }, "d": [2, 3] }));
        assert_eq!(target, json!({ "a": { "b": 5, "c": 2 }, "d": [2, 3] }));
    }
}
