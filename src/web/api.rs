//! Defines the Axum API routes and handlers.

use crate::channel::Channel;
use crate::command::Message;
use crate::handler::{is_local_model_key, CommandHandler, HandlerError};
use crate::web::models::{GcodeCommandRequest, StatusResponse};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

pub type AppState = Arc<CommandHandler>;

/// Helper to create a JSON error response with a message and status code
fn json_error(message: &str, status: StatusCode) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/gcode", post(execute_gcode))
        .route("/api/v1/model/{key}", get(get_model))
        .with_state(state)
}

async fn get_status(State(handler): State<AppState>) -> Json<StatusResponse> {
    let job = handler.job().snapshot().await;
    let model = handler.model().read().await;
    Json(StatusResponse {
        status: model.state.status,
        name: model.network.name.clone(),
        job,
    })
}

/// Runs one code on the HTTP channel and returns its result. The code is
/// cancelled when the host starts terminating.
async fn execute_gcode(
    State(handler): State<AppState>,
    Json(payload): Json<GcodeCommandRequest>,
) -> axum::response::Response {
    tracing::debug!("HTTP code {}", payload.code);
    let cancel = handler.lifecycle().shutdown_token().child_token();
    match handler.execute_line(&payload.code, Channel::Http, cancel).await {
        Ok(message) => Json::<Message>(message).into_response(),
        Err(e @ (HandlerError::Unsupported(_) | HandlerError::Parse(_))) => {
            json_error(&e.to_string(), StatusCode::BAD_REQUEST)
        }
        Err(e @ HandlerError::Cancelled) => json_error(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE),
        Err(e @ HandlerError::Timeout { .. }) => json_error(&e.to_string(), StatusCode::GATEWAY_TIMEOUT),
        Err(e @ HandlerError::Firmware(_)) => json_error(&e.to_string(), StatusCode::BAD_GATEWAY),
    }
}

/// Reads a key of the namespaces the host serves itself.
async fn get_model(State(handler): State<AppState>, Path(key): Path<String>) -> axum::response::Response {
    if !is_local_model_key(&key) {
        return json_error("Key is not served by the host", StatusCode::NOT_FOUND);
    }
    match handler.model().read().await.query(&key) {
        Some(value) => Json(value).into_response(),
        None => json_error("Unknown key", StatusCode::NOT_FOUND),
    }
}
