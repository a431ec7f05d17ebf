//! Front-end facing API: the endpoints the browser talks to.
//!
//! This is intentionally a thin layer: the relay logic lives in
//! [`crate::relay`]. Handlers pull HTTP concerns (headers, JSON bodies) out
//! of the request and hand them to the relay.

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::Value;

use crate::{
    error::ApiError,
    relay::{self, AppState},
    upstream::INFERENCE_ID,
};

/// Build the axum router. Both bare and `/v1`-prefixed paths are served.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/models", get(list_models))
        .route("/v1/models", get(list_models))
        .route("/user", get(crate::api::user::current_user))
        .with_state(state)
}

/// `POST /chat/completions`: relay a completion to the upstream gateway.
///
/// The response body is the upstream's own (an SSE token stream, or a JSON
/// document when `stream` is false).
///
/// The body is read as raw bytes so that a missing `Content-Type` or an
/// unparsable body still gets the relay's `{"error": ...}` answer.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let inference_id = headers
        .get(INFERENCE_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    // Unparsable JSON has no `messages` array and is rejected as such.
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);

    relay::handle_completion(&state, body, inference_id).await
}

/// `GET /models`: the upstream model list, unchanged.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    relay::list_models(&state).await.map(Json)
}
