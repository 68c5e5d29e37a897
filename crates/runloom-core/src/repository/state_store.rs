//! State store trait definition.
//!
//! Durable record of runs, per-node executions and join arrivals. Node
//! claims, join-arrival inserts and run finalization must be atomic in every
//! implementation: the orchestrator relies on them to never dispatch a node
//! key twice and never fire a join twice, even with several engine processes
//! sharing one store.

use runloom_types::error::RepositoryError;
use runloom_types::run::{NodeExecution, RunStatus, WorkflowRun};
use uuid::Uuid;

/// Repository trait for run state.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new RUNNING run record.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs of a workflow, newest first.
    fn list_runs(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Settle a run: set `status`, `error` and `finished_at`, but only while
    /// the run is still RUNNING. Returns `true` if this call performed the
    /// transition.
    fn finish_run(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Node executions
    // -----------------------------------------------------------------------

    /// Insert `node` if no record exists for `(run_id, node_key)`.
    /// Returns `false` when the key was already claimed.
    fn claim_node(
        &self,
        node: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Overwrite the claimed record with its terminal state.
    fn complete_node(
        &self,
        node: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get one node execution by scoped key.
    fn get_node(
        &self,
        run_id: &Uuid,
        node_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// All node executions of a run, in claim order.
    fn list_nodes(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Number of node executions of a run that settled ERROR (any scope).
    fn count_errors(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Join arrivals
    // -----------------------------------------------------------------------

    /// Add `source_id` to the arrival set of `join_key` and return the number
    /// of distinct sources recorded so far. Re-recording a source is a no-op.
    fn record_join_arrival(
        &self,
        run_id: &Uuid,
        join_key: &str,
        source_id: &str,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;
}
