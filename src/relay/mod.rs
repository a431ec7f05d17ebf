//! The completion relay: turns one inbound chat request into one upstream
//! call and relays the result back.
//!
//! Per request:
//!
//! ```text
//! Received ─► Validated ─► UpstreamCalled ─┬─► Streaming ─┬─► Completed
//!                                          │              └─► Aborted
//!                                          ├─► Failed (structured upstream error)
//!                                          └─► Failed (unstructured ─► re-issued ─► extracted)
//! ```
//!
//! There is exactly one upstream attempt. The re-issue on an unstructured
//! failure only recovers an error message; its body is never relayed as a
//! completion.

pub mod diagnose;
pub mod request;
pub mod stream;

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt as _;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::ApiError,
    upstream::{ByteStream, UpstreamClient, UpstreamError, UpstreamResponse},
};
use request::{CompletionRequest, UpstreamRequest};
use stream::RelayStream;

/// Response headers that describe the upstream connection rather than the
/// payload, and so are not copied onto the outbound response.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "content-length",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared application state injected into every handler via
/// [`axum::extract::State`]. Immutable after startup.
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: UpstreamClient,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(&config.upstream)?;
        Ok(Self { config, upstream })
    }
}

/// Relay one chat-completion request.
///
/// `inference_id` is the caller's routing header; it is forwarded only when
/// no static API key is configured.
///
/// # Errors
/// Every failure is already normalized into the `{"error": ...}` shape:
/// `422` for invalid input, relayed or recovered upstream statuses, `500`
/// for unrecoverable upstream failures and `503` when a non-streaming call
/// misses its deadline.
#[tracing::instrument(
    skip_all,
    fields(
        model = tracing::field::Empty,
        service = tracing::field::Empty,
        stream = tracing::field::Empty,
    )
)]
pub async fn handle_completion(
    state: &AppState,
    body: Value,
    inference_id: Option<&str>,
) -> Result<Response, ApiError> {
    let request = CompletionRequest::from_value(body)?;
    let stream = request.stream;
    let upstream_request = request.into_upstream(&state.config.upstream.tool_gateway_service);

    let span = tracing::Span::current();
    span.record("model", upstream_request.payload.model.as_str());
    span.record("service", upstream_request.inference_service.as_str());
    span.record("stream", stream);

    if inference_id.is_none() && !state.upstream.is_authenticated() {
        debug!("no API key configured and no inference-id supplied");
    }

    if stream {
        relay_stream(state, &upstream_request, inference_id).await
    } else {
        relay_buffered(state, &upstream_request, inference_id).await
    }
}

/// Streaming path: commit status and headers once the first chunk arrives,
/// then pipe the rest.
async fn relay_stream(
    state: &AppState,
    request: &UpstreamRequest,
    inference_id: Option<&str>,
) -> Result<Response, ApiError> {
    match state.upstream.chat_completions(request, inference_id).await {
        Ok(response) => stream_response(response).await,
        Err(e) => Err(normalize_failure(state, request, inference_id, e).await),
    }
}

/// Turn a successful upstream call into the outbound streaming response.
///
/// Nothing is committed until the first chunk arrives; a body that fails
/// before then answers `500 {"error": "Upstream error"}`.
async fn stream_response(response: UpstreamResponse) -> Result<Response, ApiError> {
    if !response.status.is_success() {
        return Err(rejected(response.status));
    }

    let body = RelayStream::open(response.body).await.map_err(|e| {
        warn!(error = %format!("{e:#}"), "upstream stream failed before any output");
        ApiError::internal("Upstream error")
    })?;
    debug!(state = ?body.state(), "relaying upstream body");

    Ok(relayed(response.status, &response.headers, Body::from_stream(body)))
}

/// Non-streaming path: the call and the full body must arrive within the
/// configured deadline.
async fn relay_buffered(
    state: &AppState,
    request: &UpstreamRequest,
    inference_id: Option<&str>,
) -> Result<Response, ApiError> {
    let deadline = Duration::from_millis(state.config.upstream.non_stream_timeout_ms);

    let call = async {
        let response = state.upstream.chat_completions(request, inference_id).await?;
        let body = collect(response.body).await;
        Ok::<_, UpstreamError>((response.status, response.headers, body))
    };

    let (status, headers, body) = match tokio::time::timeout(deadline, call).await {
        Err(_) => {
            warn!(deadline_ms = deadline.as_millis() as u64, "non-streaming upstream call timed out");
            return Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "Upstream request timed out",
            ));
        }
        Ok(Err(e)) => return Err(normalize_failure(state, request, inference_id, e).await),
        Ok(Ok(parts)) => parts,
    };

    if !status.is_success() {
        return Err(rejected(status));
    }

    let body = body.map_err(|e| {
        warn!(error = %format!("{e:#}"), "reading upstream body failed");
        ApiError::internal("Upstream error")
    })?;

    Ok(relayed(status, &headers, Body::from(body)))
}

async fn collect(mut body: ByteStream) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Build the outbound response from upstream status and headers.
fn relayed(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in upstream_headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}

/// Non-2xx upstream reply without a body: relay the status and its reason.
fn rejected(status: StatusCode) -> ApiError {
    warn!(status = status.as_u16(), "upstream rejected completion without a body");
    ApiError::new(status, status.canonical_reason().unwrap_or("Upstream error"))
}

/// Map a failed upstream call onto the caller-facing error.
///
/// Structured errors are relayed verbatim. Anything else triggers one
/// diagnostic re-issue whose raw body is mined for a message.
async fn normalize_failure(
    state: &AppState,
    request: &UpstreamRequest,
    inference_id: Option<&str>,
    err: UpstreamError,
) -> ApiError {
    match err {
        UpstreamError::Structured { status, error } => {
            warn!(status = status.as_u16(), error = %error, "upstream returned a structured error");
            ApiError::with_value(status, error)
        }
        UpstreamError::Unstructured(e) => {
            warn!(error = %format!("{e:#}"), "upstream call failed, re-issuing to recover error detail");
            match state.upstream.diagnose(request, inference_id).await {
                Ok((status, body)) => {
                    let err = diagnose::normalize(status, &body);
                    debug!(status = err.status().as_u16(), error = %err.error(), "recovered upstream error");
                    err
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "diagnostic re-issue failed");
                    ApiError::internal(diagnose::UNKNOWN_ERROR)
                }
            }
        }
    }
}

/// Relay the upstream model list.
///
/// # Errors
/// `500 {"error": "Failed to fetch models."}` on any upstream failure.
pub async fn list_models(state: &AppState) -> Result<Value, ApiError> {
    state.upstream.models().await.map_err(|e| {
        warn!(error = %format!("{e:#}"), "listing upstream models failed");
        ApiError::internal("Failed to fetch models.")
    })
}
