//! REST API Server for the request pipeline
//!
//! Exposes the orchestrator via HTTP endpoints

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::models::{HistoryTurn, Request, RequestInput, RequestOptions, UserState};
use crate::pipeline::Orchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub caller_id: String,
    pub session_id: Option<String>,
    pub message: Option<String>,
    /// Base64 image or PDF, sent instead of (or with) a message
    pub image_base64: Option<String>,
    pub mime_type: Option<String>,
    pub user_state: Option<UserState>,
    pub options: Option<RequestOptions>,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    /// max_tools used when a request carries no options
    pub default_max_tools: usize,
}

/// Image payloads travel as a data URI so decoding errors surface as
/// the normalizer's unreadable-input answer
fn request_input(req: &ChatRequest) -> Option<RequestInput> {
    match (&req.image_base64, &req.message) {
        (Some(image), _) if !image.trim().is_empty() => {
            let mime_type = req.mime_type.as_deref().unwrap_or("application/octet-stream");
            Some(RequestInput::DataUri(format!("data:{};base64,{}", mime_type, image.trim())))
        }
        (_, Some(message)) if !message.trim().is_empty() => Some(RequestInput::Text(message.clone())),
        _ => None,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(input) = request_input(&req) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Either message or image_base64 is required".into())),
        );
    };

    let options = req.options.unwrap_or_else(|| RequestOptions {
        max_tools: state.default_max_tools,
        ..RequestOptions::default()
    });

    let mut request = Request::new(req.caller_id, input)
        .with_user_state(req.user_state.unwrap_or_default())
        .with_options(options)
        .with_history(req.history);
    if let Some(session_id) = req.session_id {
        request = request.with_session(session_id);
    }

    info!(
        request_id = %request.request_id,
        caller_id = %request.caller_id,
        session_id = ?request.session_id,
        "chat_handler: request received"
    );

    let result = state.orchestrator.process(request).await;
    (StatusCode::OK, Json(ApiResponse::success(result)))
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>, default_max_tools: usize) -> Router {
    let state = ApiState {
        orchestrator,
        default_max_tools,
    };

    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    default_max_tools: usize,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator, default_max_tools);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
