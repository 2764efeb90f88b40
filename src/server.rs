//! HTTP transport over the engine: JSON for one-shot calls, SSE for streams.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::diagnostics::RuntimeReport;
use crate::engine::{Engine, EventStream, Runtime};
use crate::errors::{GenerationError, OrchestratorError, PreviewError, WorkspaceError};
use crate::preview::Framework;

pub type SharedEngine = Arc<Engine>;

pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3140,
            dev_mode: false,
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PromptRequest {
    #[serde(alias = "message")]
    pub prompt: String,
    pub framework: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct FrameworkRequest {
    pub framework: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let msg = e.to_string();
        match e {
            OrchestratorError::NoPlanFound { .. } => ApiError::NotFound(msg),
            OrchestratorError::InvalidTransition { .. } => ApiError::Conflict(msg),
            OrchestratorError::Workspace(w) | OrchestratorError::Preview(PreviewError::Workspace(w)) => {
                match w {
                    WorkspaceError::MissingProject { .. } | WorkspaceError::MissingFile { .. } => {
                        ApiError::NotFound(msg)
                    }
                    WorkspaceError::InvalidSessionId(_) | WorkspaceError::PathTraversal { .. } => {
                        ApiError::BadRequest(msg)
                    }
                    _ => ApiError::Internal(msg),
                }
            }
            OrchestratorError::Preview(PreviewError::NotFound(_)) => ApiError::NotFound(msg),
            OrchestratorError::Preview(
                PreviewError::AtCapacity { .. } | PreviewError::PortExhausted { .. },
            ) => ApiError::Unavailable(msg),
            OrchestratorError::Generation(GenerationError::RateLimited(_)) => {
                ApiError::TooManyRequests(msg)
            }
            _ => ApiError::Internal(msg),
        }
    }
}

fn parse_framework(raw: Option<&str>) -> Result<Option<Framework>, ApiError> {
    raw.map(|s| s.parse::<Framework>().map_err(ApiError::BadRequest))
        .transpose()
}

fn event_stream(events: EventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = events.into_stream().map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().event(event.kind()).data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/sessions/{id}/plan", post(plan))
        .route("/api/sessions/{id}/plan/stream", post(plan_stream))
        .route("/api/sessions/{id}/approve", post(approve))
        .route("/api/sessions/{id}/approve/stream", post(approve_stream))
        .route("/api/sessions/{id}/fast", post(fast))
        .route("/api/sessions/{id}/repair", post(repair))
        .route("/api/sessions/{id}/messages", post(messages))
        .route("/api/sessions/{id}/reset", post(reset))
        .route(
            "/api/sessions/{id}/preview",
            get(preview_status).post(preview_start).delete(preview_stop),
        )
        .route("/api/sessions/{id}/runtime-errors", post(runtime_error))
        .route("/api/sessions/{id}/diagnostics", get(diagnostics))
        .route("/api/previews", get(list_previews))
        .with_state(engine)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn plan(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let framework = parse_framework(req.framework.as_deref())?.unwrap_or_default();
    let response = engine.plan(&id, &req.prompt, framework).await?;
    Ok(Json(response))
}

async fn plan_stream(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let framework = parse_framework(req.framework.as_deref())?.unwrap_or_default();
    Ok(event_stream(engine.plan_stream(&id, &req.prompt, framework)))
}

async fn approve(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let content = engine.approve_and_code(&id).await?;
    let phase = engine.phase(&id).await?;
    Ok(Json(json!({"content": content, "phase": phase})))
}

async fn approve_stream(State(engine): State<SharedEngine>, Path(id): Path<String>) -> impl IntoResponse {
    event_stream(engine.approve_and_code_stream(&id))
}

async fn fast(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let framework = parse_framework(req.framework.as_deref())?.unwrap_or_default();
    Ok(event_stream(engine.fast_mode(&id, &req.prompt, framework)))
}

async fn repair(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    body: Option<Json<FrameworkRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let framework = match parse_framework(req.framework.as_deref())? {
        Some(f) => f,
        None => engine
            .store()
            .get_framework(&id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .unwrap_or_default(),
    };
    Ok(event_stream(engine.repair(&id, framework)))
}

async fn messages(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let framework = parse_framework(req.framework.as_deref())?.unwrap_or_default();
    let events = engine.dispatch(&id, &req.prompt, framework).await?;
    Ok(event_stream(events))
}

async fn reset(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let from = engine.reset(&id).await?;
    Ok(Json(json!({"from": from, "phase": "idle"})))
}

async fn preview_status(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine
        .pool()
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No preview process for session {}", id)))
}

async fn preview_start(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    body: Option<Json<FrameworkRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let framework = parse_framework(req.framework.as_deref())?;
    let status = engine.start_preview(&id, framework).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn preview_stop(State(engine): State<SharedEngine>, Path(id): Path<String>) -> impl IntoResponse {
    let stopped = engine.pool().stop(&id).await;
    Json(json!({"stopped": stopped}))
}

async fn list_previews(State(engine): State<SharedEngine>) -> impl IntoResponse {
    Json(engine.pool().list())
}

async fn runtime_error(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(report): Json<RuntimeReport>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = engine.ingest_runtime_error(&id, &report)?;
    Ok(Json(json!({"accepted": accepted})))
}

async fn diagnostics(State(engine): State<SharedEngine>, Path(id): Path<String>) -> impl IntoResponse {
    Json(engine.runtime_errors(&id))
}

// ── Serving ───────────────────────────────────────────────────────────

/// Serve until Ctrl-C, then drain the runtime.
pub async fn start_server(runtime: Runtime, config: ServerConfig) -> Result<()> {
    let mut app = build_router(Arc::clone(runtime.engine()));
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, dev = config.dev_mode, "studio server listening");
    println!("Studio running at http://{}", local_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    runtime.shutdown().await;
    println!("Server shut down gracefully.");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::RuntimeLog;
    use crate::engine::EngineParts;
    use crate::generation::ScriptedGenerator;
    use crate::preview::{PoolConfig, ProcessPool, Profiles};
    use crate::session::MemoryStore;
    use crate::workspace::WorkspaceManager;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router(generator: Arc<ScriptedGenerator>) -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = WorkspaceManager::new(dir.path(), 2, Duration::from_secs(10));
        let profiles = Profiles::default();
        let pool = ProcessPool::new(PoolConfig::default(), profiles.clone(), workspaces.clone());
        let engine = Arc::new(Engine::new(EngineParts {
            store: Arc::new(MemoryStore::new()),
            generator,
            workspaces,
            pool,
            profiles,
            runtime_log: Arc::new(RuntimeLog::default()),
            settle: Duration::from_millis(1),
        }));
        (dir, build_router(engine))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = test_router(Arc::new(ScriptedGenerator::new()));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_plan_returns_awaiting_approval() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_text("## Steps\n1. Build the list\n");
        let (_dir, app) = test_router(generator);

        let resp = app
            .oneshot(post_json(
                "/api/sessions/s1/plan",
                json!({"prompt": "Create a todo app", "framework": "nextjs"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["phase"], "awaiting_approval");
        assert!(!body["plan_text"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approve_without_plan_is_404() {
        let (_dir, app) = test_router(Arc::new(ScriptedGenerator::new()));
        let resp = app
            .oneshot(post_json("/api/sessions/s1/approve", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("No plan found"));
    }

    #[tokio::test]
    async fn test_unknown_framework_is_400() {
        let (_dir, app) = test_router(Arc::new(ScriptedGenerator::new()));
        let resp = app
            .oneshot(post_json(
                "/api/sessions/s1/plan",
                json!({"prompt": "x", "framework": "angular"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_runtime_errors_ingest_and_list() {
        let (_dir, app) = test_router(Arc::new(ScriptedGenerator::new()));
        let report = json!({"type": "unhandledrejection", "message": "fetch failed"});

        let resp = app
            .clone()
            .oneshot(post_json("/api/sessions/s1/runtime-errors", report.clone()))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["accepted"], true);
        let resp = app
            .clone()
            .oneshot(post_json("/api/sessions/s1/runtime-errors", report))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["accepted"], false);

        let req = Request::builder()
            .uri("/api/sessions/s1/diagnostics")
            .body(Body::empty())
            .unwrap();
        let body = body_json(app.oneshot(req).await.unwrap()).await;
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0]["text"].as_str().unwrap().contains("fetch failed"));
    }

    #[tokio::test]
    async fn test_preview_status_missing_is_404() {
        let (_dir, app) = test_router(Arc::new(ScriptedGenerator::new()));
        let req = Request::builder()
            .uri("/api/sessions/s1/preview")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_repair_on_missing_project_streams_error_event() {
        let (_dir, app) = test_router(Arc::new(ScriptedGenerator::new()));

        let resp = app
            .oneshot(post_json(
                "/api/sessions/s1/repair",
                json!({"framework": "vite"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: error"));
        assert!(text.contains("does not exist"));
    }
}
