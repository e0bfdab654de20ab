//! Side-channel HTTP routes.
//!
//! - `GET /health` - unauthenticated liveness check
//! - `GET /status` - secret-protected runtime status

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::{request_token, secret_matches};
use crate::state::ServerState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: &'static str,
    pub version: String,
    pub tool_available: bool,
    pub workspace_root: String,
    pub connections: usize,
    /// Targets with a tool run in progress, as `owner/name`
    pub running: Vec<String>,
}

/// Handler for GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Handler for GET /status
pub async fn status(State(state): State<Arc<ServerState>>, req: Request) -> Response {
    let token = request_token(&req);
    if !secret_matches(&state.config.secret, token.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            "Invalid or missing authentication token",
        )
            .into_response();
    }

    let report = StatusReport {
        status: "ok",
        version: state.config.version.clone(),
        tool_available: state.orchestrator.is_available().await,
        workspace_root: state.repos.workspace().root().display().to_string(),
        connections: state.connections.len(),
        running: state
            .orchestrator
            .running_targets()
            .iter()
            .map(|t| t.id())
            .collect(),
    };
    Json(report).into_response()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::handlers::tests::{Env, SECRET};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn get(env: &Env, uri: &str, bearer: Option<&str>) -> (StatusCode, Vec<u8>) {
        let app = crate::router(Arc::new(env.state("exit 0")));
        let mut req = Request::builder().uri(uri);
        if let Some(token) = bearer {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let response = app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let env = Env::new();
        let (status, body) = get(&env, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_rejects_missing_or_wrong_secret() {
        let env = Env::new();
        assert_eq!(get(&env, "/status", None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(
            get(&env, "/status", Some("wrong")).await.0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            get(&env, "/status?token=wrong", None).await.0,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn status_reports_runtime_state() {
        let env = Env::new();
        let (status, body) = get(&env, "/status", Some(SECRET)).await;
        assert_eq!(status, StatusCode::OK);

        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
        assert!(json["toolAvailable"].is_boolean());
        assert_eq!(
            json["workspaceRoot"],
            env.root.path().display().to_string()
        );
        assert_eq!(json["running"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn status_accepts_query_token() {
        let env = Env::new();
        let (status, _) = get(&env, &format!("/status?token={SECRET}"), None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
