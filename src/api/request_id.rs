//! Request ID middleware.
//!
//! Every inbound request gets an `X-Request-ID`: the caller's own value when
//! one is supplied, a fresh UUID v4 otherwise. The handler runs inside a
//! `request` span carrying the ID, so relay warnings (upstream failures,
//! truncated streams) can be matched to the response the caller saw. The ID
//! is echoed back on the response.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest caller-supplied ID that is honoured; longer values are replaced.
const MAX_ID_LEN: usize = 128;

/// Apply **inside** `tower_http::TraceLayer` so the span nests under it.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_ID_LEN)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}
