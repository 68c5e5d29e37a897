//! SQLite workflow version registry.

use chrono::Utc;
use runloom_core::repository::WorkflowStore;
use runloom_types::dag::Dag;
use runloom_types::error::RepositoryError;

use super::pool::DatabasePool;

pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl WorkflowStore for SqliteWorkflowStore {
    /// Register or replace a version. Replacing keeps the original
    /// `created_at`, so listing order is registration order.
    async fn save_version(
        &self,
        workflow_id: &str,
        version: &str,
        dag: &Dag,
    ) -> Result<(), RepositoryError> {
        let dag_json = serde_json::to_string(dag)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize DAG: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_versions (workflow_id, version, dag, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (workflow_id, version) DO UPDATE SET dag = excluded.dag"#,
        )
        .bind(workflow_id)
        .bind(version)
        .bind(&dag_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(workflow_id, version, "workflow version saved");
        Ok(())
    }

    async fn get_version(
        &self,
        workflow_id: &str,
        version: &str,
    ) -> Result<Option<Dag>, RepositoryError> {
        let dag: Option<String> = sqlx::query_scalar(
            "SELECT dag FROM workflow_versions WHERE workflow_id = ? AND version = ?",
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        dag.map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("invalid stored DAG: {e}")))
    }

    async fn list_versions(&self, workflow_id: &str) -> Result<Vec<String>, RepositoryError> {
        sqlx::query_scalar(
            "SELECT version FROM workflow_versions WHERE workflow_id = ? \
             ORDER BY created_at, rowid",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dag(target: &str) -> Dag {
        serde_json::from_value(json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": target, "type": "parallel" }
            ],
            "edges": [ { "source": "start", "target": target } ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("wf.db").display());
        let store = SqliteWorkflowStore::new(DatabasePool::new(&url).await.unwrap());

        store.save_version("inbox", "1.0", &dag("a")).await.unwrap();
        store.save_version("inbox", "1.1", &dag("b")).await.unwrap();
        store.save_version("inbox", "1.0", &dag("c")).await.unwrap();

        let loaded = store.get_version("inbox", "1.0").await.unwrap().unwrap();
        assert_eq!(loaded, dag("c"));
        assert!(store.get_version("inbox", "2.0").await.unwrap().is_none());
        assert_eq!(
            store.list_versions("inbox").await.unwrap(),
            vec!["1.0".to_string(), "1.1".to_string()]
        );
        assert!(store.list_versions("other").await.unwrap().is_empty());
    }
}
