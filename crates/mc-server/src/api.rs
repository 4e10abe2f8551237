use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mc_core::ErrorKind;
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::tools::{ToolFailure, ToolRouter};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// The HTTP front door: every tool is `POST /api/tools/{name}` with a JSON
/// body, plus `GET /api/health` for probes. Transport only; all semantics
/// live in [`ToolRouter`].
pub fn api_router(tools: ToolRouter) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/events", get(recent_events))
        .route("/api/tools/{name}", post(call_tool))
        .layer(CorsLayer::permissive())
        .with_state(tools)
}

async fn health(State(tools): State<ToolRouter>) -> Response {
    match tools.engine().diagnose().await {
        Ok(snapshot) => (StatusCode::OK, Json(serde_json::json!(snapshot))).into_response(),
        Err(e) => failure_response(&ToolFailure::from(e)),
    }
}

async fn recent_events(State(tools): State<ToolRouter>) -> Response {
    let events = tools.engine().recent_events(100).await;
    (StatusCode::OK, Json(serde_json::json!({ "events": events }))).into_response()
}

async fn call_tool(
    State(tools): State<ToolRouter>,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Response {
    match tools.handle(&name, params).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(failure) => failure_response(&failure),
    }
}

fn failure_response(failure: &ToolFailure) -> Response {
    (status_for(failure.kind), Json(failure.envelope())).into_response()
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::UnknownAgent
        | ErrorKind::UnknownTask
        | ErrorKind::NotFound
        | ErrorKind::NoActiveProject => StatusCode::NOT_FOUND,
        ErrorKind::Ambiguous | ErrorKind::AlreadyRegistered | ErrorKind::Conflict => {
            StatusCode::CONFLICT
        }
        ErrorKind::StaleLease => StatusCode::GONE,
        ErrorKind::StorageUnavailable
        | ErrorKind::ProviderUnavailable
        | ErrorKind::AiUnavailable
        | ErrorKind::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::UnfixableGraph => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use mc_core::config::Config;
    use mc_core::{FileStore, Persistence};
    use mc_engine::CoordinationEngine;
    use mc_providers::{InMemoryKanban, StubAi};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    async fn app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let persistence: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
        let engine = CoordinationEngine::new(
            Config::default(),
            persistence,
            Arc::new(InMemoryKanban::new()),
            Arc::new(StubAi),
        )
        .await
        .unwrap();
        (api_router(ToolRouter::new(engine)), dir)
    }

    fn post_json(uri: &str, body: Value) -> axum::http::Request<axum::body::Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_a_snapshot() {
        let (app, _dir) = app().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["workers"], 0);
    }

    #[tokio::test]
    async fn tool_call_roundtrip() {
        let (app, _dir) = app().await;
        let response = app
            .oneshot(post_json(
                "/api/tools/register_agent",
                serde_json::json!({ "agent_id": "a1", "role": "coder" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["registered"], true);
    }

    #[tokio::test]
    async fn error_envelope_and_status_mapping() {
        let (app, _dir) = app().await;
        let response = app
            .oneshot(post_json(
                "/api/tools/request_next_task",
                serde_json::json!({ "agent_id": "ghost" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "unknown_agent");
        assert!(body["error"]["message"].as_str().is_some());
    }

    #[tokio::test]
    async fn unknown_tool_is_bad_request() {
        let (app, _dir) = app().await;
        let response = app
            .oneshot(post_json("/api/tools/nope", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
