use std::time::Instant;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /api/v1/health
pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let started = Instant::now();
    Json(
        ApiResponse::success(
            json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "invoker": state.engine.invoker_name(),
            }),
            started,
        )
        .with_link("self", "/api/v1/health"),
    )
}
