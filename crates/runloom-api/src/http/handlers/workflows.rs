//! Registered workflow versions: register, list, launch, and their runs.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use runloom_core::repository::{StateStore, WorkflowStore};
use runloom_core::workflow::preflight::check_all;
use runloom_types::dag::Dag;
use runloom_types::run::WorkflowRun;
use serde::Deserialize;
use serde_json::{json, Value};

use super::runs::started_response;
use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LaunchRequest {
    /// Raw trigger event; shaped by the trigger's `data_mapping`.
    #[serde(default)]
    pub event: Value,
    pub user_id: String,
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

fn version_link(workflow_id: &str, version: &str) -> String {
    format!("/api/v1/workflows/{workflow_id}/versions/{version}")
}

/// PUT /api/v1/workflows/{id}/versions/{version}
///
/// Rejects DAGs that fail preflight, listing every problem found.
pub async fn register_version(
    State(state): State<AppState>,
    Path((workflow_id, version)): Path<(String, String)>,
    Json(dag): Json<Dag>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let started = Instant::now();
    let problems = check_all(&dag);
    if !problems.is_empty() {
        return Err(AppError::Preflight(problems));
    }
    state.workflows.save_version(&workflow_id, &version, &dag).await?;
    tracing::info!(%workflow_id, %version, nodes = dag.nodes.len(), "workflow version registered");

    let link = version_link(&workflow_id, &version);
    Ok(Json(
        ApiResponse::success(
            json!({ "workflow_id": workflow_id, "version": version, "nodes": dag.nodes.len() }),
            started,
        )
        .with_link("self", &link)
        .with_link("launch", &format!("{link}/launch")),
    ))
}

/// GET /api/v1/workflows/{id}/versions
pub async fn list_versions(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<String>>>, AppError> {
    let started = Instant::now();
    let versions = state.workflows.list_versions(&workflow_id).await?;
    Ok(Json(ApiResponse::success(versions, started).with_link(
        "self",
        &format!("/api/v1/workflows/{workflow_id}/versions"),
    )))
}

/// POST /api/v1/workflows/{id}/versions/{version}/launch
pub async fn launch_version(
    State(state): State<AppState>,
    Path((workflow_id, version)): Path<(String, String)>,
    Json(body): Json<LaunchRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Value>>), AppError> {
    let started = Instant::now();
    if body.user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id must not be empty".to_string()));
    }
    let launcher = state.launcher();
    let run_id = if body.wait {
        launcher
            .launch(&workflow_id, &version, &body.event, &body.user_id)
            .await?
    } else {
        launcher
            .launch_detached(&workflow_id, &version, &body.event, &body.user_id)
            .await?
    };
    started_response(&state, run_id, body.wait, started).await
}

/// GET /api/v1/workflows/{id}/runs
pub async fn list_runs(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowRun>>>, AppError> {
    let started = Instant::now();
    let runs = state
        .engine
        .store()
        .list_runs(&workflow_id, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(ApiResponse::success(runs, started).with_link(
        "self",
        &format!("/api/v1/workflows/{workflow_id}/runs"),
    )))
}
