//! Ad-hoc runs: submit a DAG with a payload, inspect, cancel.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use runloom_core::repository::StateStore;
use runloom_core::workflow::executor::WorkflowExecutor;
use runloom_types::dag::Dag;
use runloom_types::run::{NodeExecution, WorkflowRun};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub dag: Dag,
    #[serde(default)]
    pub payload: Value,
    pub user_id: String,
    #[serde(default = "default_workflow_id")]
    pub workflow_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Block until the run settles instead of returning 202 right away.
    #[serde(default)]
    pub wait: bool,
}

fn default_workflow_id() -> String {
    "adhoc".to_string()
}

pub(crate) fn default_version() -> String {
    "1.0".to_string()
}

/// A run with its node executions.
#[derive(Debug, Serialize)]
pub struct RunDetail {
    pub run: WorkflowRun,
    pub nodes: Vec<NodeExecution>,
}

pub(crate) fn run_link(run_id: &Uuid) -> String {
    format!("/api/v1/runs/{run_id}")
}

/// Respond 200 with the settled run, or 202 with just its id.
pub(crate) async fn started_response(
    state: &AppState,
    run_id: Uuid,
    waited: bool,
    started: Instant,
) -> Result<(StatusCode, Json<ApiResponse<Value>>), AppError> {
    let link = run_link(&run_id);
    if !waited {
        let resp = ApiResponse::success(json!({ "run_id": run_id }), started)
            .with_link("self", &link)
            .with_link("cancel", &format!("{link}/cancel"));
        return Ok((StatusCode::ACCEPTED, Json(resp)));
    }
    let detail = load_detail(state, &run_id).await?;
    let data = serde_json::to_value(&detail).map_err(|e| AppError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        Json(ApiResponse::success(data, started).with_link("self", &link)),
    ))
}

async fn load_detail(state: &AppState, run_id: &Uuid) -> Result<RunDetail, AppError> {
    let store = state.engine.store();
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("run {run_id} not found")))?;
    let nodes = store.list_nodes(run_id).await?;
    Ok(RunDetail { run, nodes })
}

/// POST /api/v1/runs
pub async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Value>>), AppError> {
    let started = Instant::now();
    if body.user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id must not be empty".to_string()));
    }

    let run_id = if body.wait {
        state
            .engine
            .execute(body.dag, body.payload, &body.user_id, &body.workflow_id, &body.version)
            .await?
    } else {
        state
            .engine
            .spawn_execute(body.dag, body.payload, &body.user_id, &body.workflow_id, &body.version)
            .await?
    };
    tracing::info!(run_id = %run_id, workflow_id = %body.workflow_id, "run submitted");

    started_response(&state, run_id, body.wait, started).await
}

/// GET /api/v1/runs/{run_id}
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ApiResponse<RunDetail>>, AppError> {
    let started = Instant::now();
    let detail = load_detail(&state, &run_id).await?;
    let link = run_link(&run_id);
    let workflow_runs = format!("/api/v1/workflows/{}/runs", detail.run.workflow_id);
    Ok(Json(
        ApiResponse::success(detail, started)
            .with_link("self", &link)
            .with_link("workflow_runs", &workflow_runs),
    ))
}

/// POST /api/v1/runs/{run_id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ApiResponse<Value>>), AppError> {
    let started = Instant::now();
    state.engine.cancel(&run_id)?;
    let resp = ApiResponse::success(json!({ "run_id": run_id, "cancelling": true }), started)
        .with_link("run", &run_link(&run_id));
    Ok((StatusCode::ACCEPTED, Json(resp)))
}
