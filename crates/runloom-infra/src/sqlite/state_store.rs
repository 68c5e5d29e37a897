//! SQLite state store.
//!
//! Implements `StateStore` from `runloom-core`. Claims use
//! `INSERT .. ON CONFLICT DO NOTHING`, run finalization is a conditional
//! `UPDATE .. WHERE status = 'running'`, and join arrivals are counted inside
//! the same writer transaction that records them.

use chrono::{DateTime, Utc};
use runloom_core::repository::StateStore;
use runloom_types::dag::NodeType;
use runloom_types::error::RepositoryError;
use runloom_types::run::{NodeExecution, NodeStatus, RunStatus, WorkflowRun};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct RunRow {
    run_id: String,
    workflow_id: String,
    version: String,
    user_id: String,
    status: String,
    error: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            version: row.try_get("version")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        Ok(WorkflowRun {
            id: parse_uuid(&self.run_id)?,
            workflow_id: self.workflow_id,
            version: self.version,
            user_id: self.user_id,
            status: self.status.parse::<RunStatus>().map_err(RepositoryError::Query)?,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct NodeRow {
    run_id: String,
    node_key: String,
    node_id: String,
    node_type: String,
    status: String,
    attempt: i64,
    output: Option<String>,
    error: Option<String>,
    from_cache: bool,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl NodeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            node_key: row.try_get("node_key")?,
            node_id: row.try_get("node_id")?,
            node_type: row.try_get("node_type")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            from_cache: row.try_get("from_cache")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_node(self) -> Result<NodeExecution, RepositoryError> {
        let output = self
            .output
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("invalid output JSON: {e}")))?;

        Ok(NodeExecution {
            run_id: parse_uuid(&self.run_id)?,
            node_key: self.node_key,
            node_id: self.node_id,
            node_type: self.node_type.parse::<NodeType>().map_err(RepositoryError::Query)?,
            status: self.status.parse::<NodeStatus>().map_err(RepositoryError::Query)?,
            attempt: u32::try_from(self.attempt)
                .map_err(|e| RepositoryError::Query(format!("invalid attempt: {e}")))?,
            output,
            error: self.error,
            from_cache: self.from_cache,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

const NODE_COLUMNS: &str = "run_id, node_key, node_id, node_type, status, attempt, output, error, \
                            from_cache, started_at, finished_at";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn output_json(node: &NodeExecution) -> Result<Option<String>, RepositoryError> {
    node.output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::Query(format!("failed to serialize output: {e}")))
}

// ---------------------------------------------------------------------------
// StateStore implementation
// ---------------------------------------------------------------------------

impl StateStore for SqliteStateStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_runs
               (run_id, workflow_id, version, user_id, status, error, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_id)
        .bind(&run.version)
        .bind(&run.user_id)
        .bind(run.status.as_str())
        .bind(&run.error)
        .bind(format_datetime(&run.started_at))
        .bind(run.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("run {} already exists", run.id))
            }
            other => query_error(other),
        })?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| RunRow::from_row(&r).map_err(query_error)?.into_run())
            .transpose()
    }

    async fn list_runs(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE workflow_id = ? \
             ORDER BY started_at DESC, run_id DESC LIMIT ?",
        )
        .bind(workflow_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|r| RunRow::from_row(r).map_err(query_error)?.into_run())
            .collect()
    }

    async fn finish_run(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = ?, error = ?, finished_at = ? \
             WHERE run_id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_run(run_id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn claim_node(&self, node: &NodeExecution) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO node_executions
               (run_id, node_key, node_id, node_type, status, attempt, output, error,
                from_cache, started_at, finished_at, seq)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                       (SELECT COALESCE(MAX(seq), 0) + 1 FROM node_executions WHERE run_id = ?))
               ON CONFLICT (run_id, node_key) DO NOTHING"#,
        )
        .bind(node.run_id.to_string())
        .bind(&node.node_key)
        .bind(&node.node_id)
        .bind(node.node_type.as_str())
        .bind(node.status.as_str())
        .bind(i64::from(node.attempt))
        .bind(output_json(node)?)
        .bind(&node.error)
        .bind(node.from_cache)
        .bind(node.started_at.as_ref().map(format_datetime))
        .bind(node.finished_at.as_ref().map(format_datetime))
        .bind(node.run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_node(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE node_executions SET status = ?, attempt = ?, output = ?, error = ?, \
             from_cache = ?, finished_at = ? WHERE run_id = ? AND node_key = ?",
        )
        .bind(node.status.as_str())
        .bind(i64::from(node.attempt))
        .bind(output_json(node)?)
        .bind(&node.error)
        .bind(node.from_cache)
        .bind(node.finished_at.as_ref().map(format_datetime))
        .bind(node.run_id.to_string())
        .bind(&node.node_key)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_node(
        &self,
        run_id: &Uuid,
        node_key: &str,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_executions WHERE run_id = ? AND node_key = ?"
        ))
        .bind(run_id.to_string())
        .bind(node_key)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|r| NodeRow::from_row(&r).map_err(query_error)?.into_node())
            .transpose()
    }

    async fn list_nodes(&self, run_id: &Uuid) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_executions WHERE run_id = ? ORDER BY seq"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|r| NodeRow::from_row(r).map_err(query_error)?.into_node())
            .collect()
    }

    async fn count_errors(&self, run_id: &Uuid) -> Result<u32, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM node_executions WHERE run_id = ? AND status = 'error'",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(count as u32)
    }

    async fn record_join_arrival(
        &self,
        run_id: &Uuid,
        join_key: &str,
        source_id: &str,
    ) -> Result<u32, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            "INSERT INTO join_arrivals (run_id, join_key, source_id) VALUES (?, ?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(run_id.to_string())
        .bind(join_key)
        .bind(source_id)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM join_arrivals WHERE run_id = ? AND join_key = ?",
        )
        .bind(run_id.to_string())
        .bind(join_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(count as u32)
    }
}
