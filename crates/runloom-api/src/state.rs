//! Application state shared by CLI commands and REST handlers.
//!
//! Pins the engine's generics to the SQLite adapters and selects the action
//! invoker (HTTP provider or dry-run echo).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use runloom_core::event::EventBus;
use runloom_core::workflow::executor::WorkflowEngine;
use runloom_core::workflow::invoker::BoxActionInvoker;
use runloom_core::workflow::launcher::RunLauncher;
use runloom_infra::invoker::echo::EchoActionInvoker;
use runloom_infra::invoker::http::HttpActionInvoker;
use runloom_infra::sqlite::idempotency::SqliteIdempotencyCache;
use runloom_infra::sqlite::pool::{database_url, DatabasePool};
use runloom_infra::sqlite::state_store::SqliteStateStore;
use runloom_infra::sqlite::workflow_store::SqliteWorkflowStore;
use runloom_types::config::GlobalConfig;

pub type Engine = WorkflowEngine<SqliteStateStore, SqliteIdempotencyCache>;
pub type Launcher = RunLauncher<SqliteWorkflowStore, Engine>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub cache: Arc<SqliteIdempotencyCache>,
    pub workflows: Arc<SqliteWorkflowStore>,
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database under `data_dir` and wire the engine.
    pub async fn init(
        data_dir: PathBuf,
        config: GlobalConfig,
        invoker: BoxActionInvoker,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open {db_url}"))?;

        let cache = Arc::new(SqliteIdempotencyCache::new(db_pool.clone()));
        let engine = WorkflowEngine::new(
            Arc::new(SqliteStateStore::new(db_pool.clone())),
            Arc::clone(&cache),
            invoker,
            config.engine.clone(),
            EventBus::default(),
        );

        Ok(Self {
            engine,
            cache,
            workflows: Arc::new(SqliteWorkflowStore::new(db_pool)),
            config: Arc::new(config),
            data_dir,
        })
    }

    pub fn launcher(&self) -> Launcher {
        RunLauncher::new(Arc::clone(&self.workflows), self.engine.clone())
    }
}

/// Pick the action invoker: echo for dry runs, otherwise the configured
/// HTTP provider.
pub fn build_invoker(config: &GlobalConfig, dry_run: bool) -> anyhow::Result<BoxActionInvoker> {
    if dry_run {
        return Ok(BoxActionInvoker::new(EchoActionInvoker::new()));
    }
    let invoker = HttpActionInvoker::from_config(&config.provider)
        .context("action provider is not configured (use --dry-run to skip side effects)")?;
    Ok(BoxActionInvoker::new(invoker))
}
