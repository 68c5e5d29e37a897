//! Axum router with CORS and request tracing.

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health::health))
        // Ad-hoc runs
        .route("/runs", post(handlers::runs::start_run))
        .route("/runs/{run_id}", get(handlers::runs::get_run))
        .route("/runs/{run_id}/cancel", post(handlers::runs::cancel_run))
        // Registered workflow versions
        .route(
            "/workflows/{id}/versions",
            get(handlers::workflows::list_versions),
        )
        .route(
            "/workflows/{id}/versions/{version}",
            put(handlers::workflows::register_version),
        )
        .route(
            "/workflows/{id}/versions/{version}/launch",
            post(handlers::workflows::launch_version),
        )
        .route("/workflows/{id}/runs", get(handlers::workflows::list_runs));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloom_core::workflow::invoker::BoxActionInvoker;
    use runloom_infra::invoker::echo::EchoActionInvoker;
    use runloom_types::config::GlobalConfig;
    use serde_json::{json, Value};

    async fn serve() -> (String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::init(
            dir.path().to_path_buf(),
            GlobalConfig::default(),
            BoxActionInvoker::new(EchoActionInvoker::new()),
        )
        .await
        .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        (format!("http://{addr}/api/v1"), dir)
    }

    fn dag() -> Value {
        json!({
            "nodes": [
                { "id": "start", "type": "trigger", "data": {
                    "data_mapping": { "subject": "message.subject" } } },
                { "id": "notify", "type": "action", "data": {
                    "tool": "slack", "action": "post_message", "requires_auth": false,
                    "input_template": { "text": "New: {{ inputs.subject }}" } } }
            ],
            "edges": [ { "source": "start", "target": "notify" } ]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _dir) = serve().await;
        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["invoker"], "echo");
    }

    #[tokio::test]
    async fn test_adhoc_run_waits_and_reports_nodes() {
        let (base, _dir) = serve().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/runs"))
            .json(&json!({
                "dag": dag(),
                "payload": { "subject": "Hello" },
                "user_id": "user-1",
                "workflow_id": "notify",
                "wait": true
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["run"]["status"], "success");
        let notify = &body["data"]["nodes"][0];
        assert_eq!(notify["node_id"], "notify");
        assert_eq!(notify["output"]["arguments"]["text"], "New: Hello");

        let run_id = body["data"]["run"]["id"].as_str().unwrap().to_string();
        let fetched: Value = client
            .get(format!("{base}/runs/{run_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["data"]["run"]["id"], run_id.as_str());
        assert_eq!(fetched["_links"]["workflow_runs"], "/api/v1/workflows/notify/runs");

        let cancel = client
            .post(format!("{base}/runs/{run_id}/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(cancel.status(), 409);
    }

    #[tokio::test]
    async fn test_register_launch_and_list() {
        let (base, _dir) = serve().await;
        let client = reqwest::Client::new();

        let resp = client
            .put(format!("{base}/workflows/inbox/versions/1.0"))
            .json(&dag())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("{base}/workflows/inbox/versions/1.0/launch"))
            .json(&json!({ "event": { "message": { "subject": "Hi" } }, "user_id": "u", "wait": true }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["nodes"][0]["output"]["arguments"]["text"], "New: Hi");

        let versions: Value = client
            .get(format!("{base}/workflows/inbox/versions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(versions["data"], json!(["1.0"]));

        let runs: Value = client
            .get(format!("{base}/workflows/inbox/runs?limit=5"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(runs["data"].as_array().unwrap().len(), 1);
        assert_eq!(runs["data"][0]["version"], "1.0");

        let missing = client
            .post(format!("{base}/workflows/inbox/versions/9.9/launch"))
            .json(&json!({ "user_id": "u" }))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_invalid_dag_rejected() {
        let (base, _dir) = serve().await;
        let client = reqwest::Client::new();
        let bad = json!({
            "nodes": [ { "id": "start", "type": "trigger" } ],
            "edges": [ { "source": "start", "target": "ghost" } ]
        });

        let resp = client
            .put(format!("{base}/workflows/bad/versions/1.0"))
            .json(&bad)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "PREFLIGHT_FAILED");

        let resp = client
            .post(format!("{base}/runs"))
            .json(&json!({ "dag": bad, "user_id": "u" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);
    }
}
