//! Turtle HTTP 接口
//!
//! 启动: cargo run --bin turtle-web --features web
//! POST /chat {"message", "thread_id"?} -> {"response", "thread_id"}；GET /health；GET /threads/:id

#![cfg(feature = "web")]

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use turtle::config::load_config;
use turtle::core::{OrchestrationError, Orchestrator, OrchestratorBuilder};
use turtle::memory::Thread;

struct AppState {
    orchestrator: Orchestrator,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatResponse {
    response: String,
    thread_id: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    time: String,
}

/// 错误响应：HTTP 状态码由错误类别决定
struct ApiError(OrchestrationError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestrationError::InvalidState(_) => StatusCode::BAD_REQUEST,
            OrchestrationError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestrationError::Conflict(_) => StatusCode::CONFLICT,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(e: OrchestrationError) -> Self {
        Self(e)
    }
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(api_chat))
        .route("/health", get(api_health))
        .route("/threads/:id", get(api_thread))
        .with_state(state)
}

async fn api_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let thread_id = req.thread_id.as_deref().filter(|s| !s.trim().is_empty());
    let outcome = state.orchestrator.handle_turn(&req.message, thread_id).await?;
    Ok(Json(ChatResponse {
        response: outcome.response,
        thread_id: outcome.thread_id,
    }))
}

async fn api_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    })
}

async fn api_thread(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(state.orchestrator.thread(&id).await?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    turtle::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let orchestrator = OrchestratorBuilder::new(cfg)
        .build()
        .await
        .context("Failed to build orchestrator")?;

    let state = Arc::new(AppState { orchestrator });
    tracing::info!("Turtle API: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
