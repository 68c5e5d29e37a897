//! Workflow store trait definition.
//!
//! Holds the DAGs registered by the upstream generator/validator, keyed by
//! `(workflow_id, version)`. Read by the run launcher.

use runloom_types::dag::Dag;
use runloom_types::error::RepositoryError;

pub trait WorkflowStore: Send + Sync {
    /// Upsert the DAG for `(workflow_id, version)`.
    fn save_version(
        &self,
        workflow_id: &str,
        version: &str,
        dag: &Dag,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_version(
        &self,
        workflow_id: &str,
        version: &str,
    ) -> impl std::future::Future<Output = Result<Option<Dag>, RepositoryError>> + Send;

    /// Registered versions of a workflow, oldest first.
    fn list_versions(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;
}
