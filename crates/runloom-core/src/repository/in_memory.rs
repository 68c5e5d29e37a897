//! In-process adapters for the storage ports, backed by `DashMap`.
//!
//! Used by tests, dry runs and single-process deployments. Atomicity of
//! claims, join arrivals and cache writes comes from dashmap's per-shard
//! entry locks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use runloom_types::dag::Dag;
use runloom_types::error::RepositoryError;
use runloom_types::run::{NodeExecution, NodeStatus, RunStatus, WorkflowRun};
use serde_json::Value;
use uuid::Uuid;

use super::idempotency::IdempotencyCache;
use super::state_store::StateStore;
use super::workflow_store::WorkflowStore;

// ---------------------------------------------------------------------------
// State store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    runs: DashMap<Uuid, WorkflowRun>,
    /// (run_id, node_key) -> (claim sequence, record)
    nodes: DashMap<(Uuid, String), (u64, NodeExecution)>,
    arrivals: DashMap<(Uuid, String), HashSet<String>>,
    seq: AtomicU64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        match self.runs.entry(run.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(())
            }
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn list_runs(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn finish_run(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let mut run = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = status;
        run.error = error.map(str::to_string);
        run.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn claim_node(&self, node: &NodeExecution) -> Result<bool, RepositoryError> {
        match self.nodes.entry((node.run_id, node.node_key.clone())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                slot.insert((seq, node.clone()));
                Ok(true)
            }
        }
    }

    async fn complete_node(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        let mut entry = self
            .nodes
            .get_mut(&(node.run_id, node.node_key.clone()))
            .ok_or(RepositoryError::NotFound)?;
        entry.1 = node.clone();
        Ok(())
    }

    async fn get_node(
        &self,
        run_id: &Uuid,
        node_key: &str,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self
            .nodes
            .get(&(*run_id, node_key.to_string()))
            .map(|e| e.1.clone()))
    }

    async fn list_nodes(&self, run_id: &Uuid) -> Result<Vec<NodeExecution>, RepositoryError> {
        let mut nodes: Vec<(u64, NodeExecution)> = self
            .nodes
            .iter()
            .filter(|e| e.key().0 == *run_id)
            .map(|e| e.value().clone())
            .collect();
        nodes.sort_by_key(|(seq, _)| *seq);
        Ok(nodes.into_iter().map(|(_, n)| n).collect())
    }

    async fn count_errors(&self, run_id: &Uuid) -> Result<u32, RepositoryError> {
        Ok(self
            .nodes
            .iter()
            .filter(|e| e.key().0 == *run_id && e.value().1.status == NodeStatus::Error)
            .count() as u32)
    }

    async fn record_join_arrival(
        &self,
        run_id: &Uuid,
        join_key: &str,
        source_id: &str,
    ) -> Result<u32, RepositoryError> {
        let mut set = self
            .arrivals
            .entry((*run_id, join_key.to_string()))
            .or_default();
        set.insert(source_id.to_string());
        Ok(set.len() as u32)
    }
}

// ---------------------------------------------------------------------------
// Idempotency cache
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryIdempotencyCache {
    entries: DashMap<String, (Value, Instant)>,
}

impl InMemoryIdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, live or expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `now + ttl`, clamped to roughly a century out when that overflows.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

impl IdempotencyCache for InMemoryIdempotencyCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key).filter(|e| e.1 > now) {
            return Ok(Some(entry.0.clone()));
        }
        self.entries.remove_if(key, |_, entry| entry.1 <= now);
        Ok(None)
    }

    async fn put(&self, key: &str, value: &Value, ttl: Duration) -> Result<bool, RepositoryError> {
        let now = Instant::now();
        let expires_at = expiry(now, ttl);
        let inserted = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().1 > now {
                    return Ok(false);
                }
                slot.insert((value.clone(), expires_at));
                true
            }
            Entry::Vacant(slot) => {
                slot.insert((value.clone(), expires_at));
                true
            }
        };
        self.entries.retain(|_, entry| entry.1 > now);
        Ok(inserted)
    }
}

// ---------------------------------------------------------------------------
// Workflow store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    versions: DashMap<(String, String), (u64, Dag)>,
    seq: AtomicU64,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn save_version(
        &self,
        workflow_id: &str,
        version: &str,
        dag: &Dag,
    ) -> Result<(), RepositoryError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.versions
            .entry((workflow_id.to_string(), version.to_string()))
            .and_modify(|entry| entry.1 = dag.clone())
            .or_insert_with(|| (seq, dag.clone()));
        Ok(())
    }

    async fn get_version(
        &self,
        workflow_id: &str,
        version: &str,
    ) -> Result<Option<Dag>, RepositoryError> {
        Ok(self
            .versions
            .get(&(workflow_id.to_string(), version.to_string()))
            .map(|e| e.1.clone()))
    }

    async fn list_versions(&self, workflow_id: &str) -> Result<Vec<String>, RepositoryError> {
        let mut versions: Vec<(u64, String)> = self
            .versions
            .iter()
            .filter(|e| e.key().0 == workflow_id)
            .map(|e| (e.value().0, e.key().1.clone()))
            .collect();
        versions.sort();
        Ok(versions.into_iter().map(|(_, v)| v).collect())
    }
}
