//! HTTP server implementation using Axum.
//!
//! Session lifecycle endpoints orchestrating the workspace pipeline and the
//! process supervisor, plus the WebSocket upgrade route.

use crate::error::{AppError, ErrorCode};
use crate::origin;
use crate::session::SessionStatus;
use crate::state::AppState;
use crate::workspace;
use crate::ws;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Typed into the session when a start request targets a sub-exercise, so the
/// agent opens with an orientation pass over the instructions.
const SUB_EXERCISE_PROMPT: &str =
    "Read the instructions file in this exercise directory and summarize the task.\n";

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    exercise_id: String,
    #[serde(default)]
    sub_exercise: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    session_id: String,
    ws_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetRequest {
    exercise_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    claude_in_path: bool,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|value| origin::origin_allowed(Some(value)))
                .unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        // Session lifecycle
        .route("/sessions/start", post(start_session))
        .route("/sessions/reset", post(reset_session))
        .route("/sessions/:id/status", get(session_status))
        // Terminal transport
        .route("/sessions/:id/ws", get(ws::terminal_ws))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    let app = router(state.clone());

    // Localhost tool by design; the transport carries raw terminal access.
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    // Don't leave an orphaned PTY child behind the exiting server.
    state.sessions.kill_current();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        claude_in_path: state.sessions.claude_available(),
    })
}

async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, AppError> {
    let exercise_id = req.exercise_id.trim();
    if !is_valid_token(exercise_id) {
        return Err(AppError::new(
            ErrorCode::InvalidRequest,
            "exerciseId must be a non-empty token of word characters, dots, and hyphens",
        ));
    }
    let sub_exercise = req
        .sub_exercise
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(sub) = sub_exercise {
        if !is_valid_token(sub) {
            return Err(AppError::new(
                ErrorCode::InvalidRequest,
                "subExercise must be a token of word characters, dots, and hyphens",
            ));
        }
    }

    let workspace_root = state.workspaces.ensure(exercise_id).await?;
    let target = match sub_exercise {
        Some(sub) => workspace::resolve_sub_exercise(&workspace_root, sub),
        None => workspace_root,
    };

    // A UI that mounts twice sends two start requests for the same resolved
    // path; hand the second caller the session the first one created.
    if let Some(existing) = state.sessions.find_by_workspace(&target) {
        info!(session = %existing, "reusing session for already-running workspace");
        return Ok(Json(StartResponse {
            ws_url: ws_url(&existing),
            session_id: existing,
        }));
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let initial_input = sub_exercise.map(|_| SUB_EXERCISE_PROMPT);
    state
        .sessions
        .spawn(&session_id, exercise_id, &target, initial_input)?;

    Ok(Json(StartResponse {
        ws_url: ws_url(&session_id),
        session_id,
    }))
}

async fn reset_session(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Result<StatusCode, AppError> {
    let exercise_id = req.exercise_id.trim();
    if !is_valid_token(exercise_id) {
        return Err(AppError::new(
            ErrorCode::InvalidRequest,
            "exerciseId must be a non-empty token of word characters, dots, and hyphens",
        ));
    }

    // Kill first, delete second: the workspace must not disappear under a
    // running process. Reset is coarse and takes down whatever session is
    // live, not just the targeted exercise's.
    state.sessions.kill_current();
    state.workspaces.reset(exercise_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, AppError> {
    state
        .sessions
        .status(&id)
        .map(Json)
        .ok_or_else(|| AppError::new(ErrorCode::SessionNotFound, format!("no session with id '{id}'")))
}

fn ws_url(session_id: &str) -> String {
    format!("/sessions/{session_id}/ws")
}

/// Strict token syntax shared by exerciseId and subExercise: word characters,
/// dots, and hyphens only, with path-traversal sequences rejected outright.
/// Runs before any filesystem or network access.
fn is_valid_token(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app() -> (TempDir, Router) {
        let tmp = TempDir::new().unwrap();
        let state = AppState::new(None, tmp.path().to_path_buf());
        (tmp, router(state))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn token_validation_rejects_dangerous_input() {
        assert!(is_valid_token("getting-started"));
        assert!(is_valid_token("1.1"));
        assert!(is_valid_token("module_2"));

        assert!(!is_valid_token(""));
        assert!(!is_valid_token("../../../etc/passwd"));
        assert!(!is_valid_token("a..b"));
        assert!(!is_valid_token("has space"));
        assert!(!is_valid_token("semi;colon"));
        assert!(!is_valid_token("null\0byte"));
        assert!(!is_valid_token("dollar$(cmd)"));
        assert!(!is_valid_token("slash/path"));
        assert!(!is_valid_token(&"a".repeat(65)));
    }

    #[tokio::test]
    async fn start_rejects_malformed_ids_before_io() {
        let (tmp, app) = test_app();
        for bad in ["../escape", "has space", "semi;colon", "nul\u{0}byte", ""] {
            let response = app
                .clone()
                .oneshot(post_json(
                    "/sessions/start",
                    serde_json::json!({ "exerciseId": bad }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "input {bad:?}");
            let body = body_json(response).await;
            assert_eq!(body["code"], "INVALID_REQUEST");
        }
        assert!(
            fs::read_dir(tmp.path()).unwrap().next().is_none(),
            "validation failures must not touch the filesystem"
        );
    }

    #[tokio::test]
    async fn start_rejects_malformed_sub_exercise() {
        let (tmp, app) = test_app();
        let response = app
            .oneshot(post_json(
                "/sessions/start",
                serde_json::json!({ "exerciseId": "getting-started", "subExercise": "1.1; rm -rf" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn start_unknown_exercise_is_not_found() {
        let (tmp, app) = test_app();
        let response = app
            .oneshot(post_json(
                "/sessions/start",
                serde_json::json!({ "exerciseId": "no-such-exercise" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "EXERCISE_NOT_FOUND");
        assert!(fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn status_unknown_session_is_not_found() {
        let (_tmp, app) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions/does-not-exist/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn reset_succeeds_without_a_live_session() {
        let (tmp, app) = test_app();
        fs::create_dir_all(tmp.path().join("getting-started")).unwrap();
        fs::write(tmp.path().join("getting-started/README.md"), "x").unwrap();

        let response = app
            .oneshot(post_json(
                "/sessions/reset",
                serde_json::json!({ "exerciseId": "getting-started" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!tmp.path().join("getting-started").exists());
    }

    #[tokio::test]
    async fn health_reports_version_and_tool_presence() {
        let (_tmp, app) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["claudeInPath"], false);
    }

    fn upgrade_request(uri: &str, origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(uri)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "x3JJHMbDL1EzLkh9GBhXDw==");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn ws_upgrade_rejects_disallowed_origin_before_handshake() {
        let (_tmp, app) = test_app();
        let response = app
            .oneshot(upgrade_request(
                "/sessions/some-id/ws",
                Some("https://evil.example"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn ws_upgrade_rejects_unknown_session() {
        let (_tmp, app) = test_app();
        let response = app
            .oneshot(upgrade_request(
                "/sessions/some-id/ws",
                Some("http://localhost:3000"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
