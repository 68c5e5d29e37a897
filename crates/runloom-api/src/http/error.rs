//! Application error type mapped to HTTP status codes and the envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use runloom_core::workflow::executor::EngineError;
use runloom_core::workflow::launcher::LaunchError;
use runloom_core::workflow::preflight::PreflightError;
use runloom_types::error::RepositoryError;

use super::response::ApiResponse;

#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    Launch(LaunchError),
    Repository(RepositoryError),
    /// Every structural problem found in a submitted DAG.
    Preflight(Vec<PreflightError>),
    NotFound(String),
    Validation(String),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<LaunchError> for AppError {
    fn from(e: LaunchError) -> Self {
        AppError::Launch(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Repository(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
        match self {
            AppError::Engine(e) | AppError::Launch(LaunchError::Engine(e)) => match e {
                EngineError::Preflight(p) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "PREFLIGHT_FAILED",
                    p.to_string(),
                    None,
                ),
                EngineError::RunNotActive(_) => {
                    (StatusCode::CONFLICT, "RUN_NOT_ACTIVE", e.to_string(), None)
                }
                EngineError::Repository(r) => repository_parts(r),
            },
            AppError::Launch(e @ LaunchError::UnknownVersion { .. }) => {
                (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND", e.to_string(), None)
            }
            AppError::Launch(LaunchError::Repository(r)) | AppError::Repository(r) => {
                repository_parts(r)
            }
            AppError::Preflight(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "PREFLIGHT_FAILED",
                format!("{} structural problem(s) in workflow", errors.len()),
                Some(serde_json::json!(
                    errors.iter().map(ToString::to_string).collect::<Vec<_>>()
                )),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone(), None)
            }
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
                None,
            ),
        }
    }
}

fn repository_parts(
    e: &RepositoryError,
) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
    match e {
        RepositoryError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string(), None),
        RepositoryError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT", e.to_string(), None),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            e.to_string(),
            None,
        ),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }
        (status, Json(ApiResponse::error(code, message, details))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                AppError::Engine(EngineError::RunNotActive(Uuid::nil())),
                StatusCode::CONFLICT,
            ),
            (
                AppError::Engine(EngineError::Preflight(PreflightError::NoNodes)),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AppError::Launch(LaunchError::UnknownVersion {
                    workflow_id: "wf".to_string(),
                    version: "1.0".to_string(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::Repository(RepositoryError::Query("x".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::Validation("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
