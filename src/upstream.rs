//! HTTP client for the upstream inference gateway.
//!
//! An [`UpstreamClient`] is built once at startup from [`UpstreamConfig`] and
//! shared by every request; [`reqwest::Client`] pools connections internally.
//! Completions are returned raw (status, headers, byte stream) so the relay can
//! pipe the body without buffering it.

use std::{pin::Pin, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Client, RequestBuilder, StatusCode,
};
use serde_json::Value;
use thiserror::Error;

use crate::{config::UpstreamConfig, relay::request::UpstreamRequest};

/// Upstream response body as a stream of chunks, in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Routing header naming the service (model or tool gateway) to run.
pub const INFERENCE_SERVICE: &str = "inference-service";
/// Routing header naming the calling portal.
pub const INFERENCE_PORTAL: &str = "inference-portal";
/// Per-user routing credential, used only when no API key is configured.
pub const INFERENCE_ID: &str = "inference-id";

/// Why an upstream completion call did not produce a usable response.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream answered with a non-2xx status and a JSON body carrying an
    /// `error` field. Relayed to the caller as-is.
    #[error("upstream returned HTTP {status}: {error}")]
    Structured { status: StatusCode, error: Value },

    /// Anything else: transport failures, or a non-2xx body without an
    /// `error` field.
    #[error(transparent)]
    Unstructured(#[from] anyhow::Error),
}

/// Raw upstream reply, not yet relayed.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
    portal: String,
    authenticated: bool,
    /// Bound on calls that are read to completion (diagnostics, model list).
    request_timeout: Duration,
}

impl UpstreamClient {
    /// Construct the client for the configured upstream.
    ///
    /// When an API key is configured it becomes a default
    /// `Authorization: Bearer ...` header on every call. No overall request
    /// timeout is set: streamed completions may legitimately run for minutes.
    pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();

        let api_key = cfg.api_key();
        if let Some(key) = &api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {key}"))
                .context("invalid API key value for Authorization header")?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            portal: cfg.service_name.clone(),
            authenticated: api_key.is_some(),
            request_timeout: Duration::from_millis(cfg.non_stream_timeout_ms),
        })
    }

    /// Whether calls carry a static bearer credential.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Build `POST /chat/completions` with routing headers and credential.
    ///
    /// `inference_id` is forwarded only when no API key is configured.
    fn completion_request(&self, request: &UpstreamRequest, inference_id: Option<&str>) -> RequestBuilder {
        let mut builder = self
            .client
            .post(self.completions_url())
            .header(INFERENCE_SERVICE, &request.inference_service)
            .header(INFERENCE_PORTAL, &self.portal)
            .json(&request.payload);

        if !self.authenticated {
            if let Some(id) = inference_id {
                builder = builder.header(INFERENCE_ID, id);
            }
        }
        builder
    }

    /// Send a completion request and return the raw response.
    ///
    /// 2xx responses come back with their body unread. Non-2xx responses are
    /// classified: an empty body is returned as-is (the caller relays the
    /// status), a JSON body with an `error` field becomes
    /// [`UpstreamError::Structured`], anything else is
    /// [`UpstreamError::Unstructured`].
    pub async fn chat_completions(
        &self,
        request: &UpstreamRequest,
        inference_id: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.completions_url();
        let response = self
            .completion_request(request, inference_id)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(anyhow::Error::from));
            return Ok(UpstreamResponse {
                status,
                headers,
                body: Box::pin(body),
            });
        }

        let text = response
            .text()
            .await
            .context("reading upstream error body")?;

        if text.trim().is_empty() {
            return Ok(UpstreamResponse {
                status,
                headers,
                body: Box::pin(futures_util::stream::empty::<anyhow::Result<Bytes>>()),
            });
        }

        match structured_error(&text) {
            Some(error) => Err(UpstreamError::Structured { status, error }),
            None => Err(anyhow::anyhow!("upstream returned HTTP {status}: {text}").into()),
        }
    }

    /// Re-send a failed completion as a plain call and read the whole reply.
    ///
    /// Used only to recover a readable error message after
    /// [`chat_completions`][Self::chat_completions] failed; the body is never
    /// relayed as a completion.
    pub async fn diagnose(
        &self,
        request: &UpstreamRequest,
        inference_id: Option<&str>,
    ) -> anyhow::Result<(StatusCode, String)> {
        let url = self.completions_url();
        let response = self
            .completion_request(request, inference_id)
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("diagnostic POST {url}"))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("reading diagnostic response body")?;
        Ok((status, text))
    }

    /// `GET /models`, parsed as JSON.
    ///
    /// # Errors
    /// Transport failures, non-2xx statuses and non-JSON bodies.
    pub async fn models(&self) -> anyhow::Result<Value> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "models listing returned HTTP {status}");

        response
            .json()
            .await
            .context("parsing models response as JSON")
    }
}

/// The `error` field of a JSON error body, if there is a non-null one.
fn structured_error(body: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed.get("error").filter(|e| !e.is_null()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::request::CompletionRequest;
    use serde_json::json;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn cfg_for(server: &MockServer, api_key: Option<&str>) -> UpstreamConfig {
        UpstreamConfig {
            base_url: format!("{}/v1", server.uri()),
            api_key: api_key.map(String::from),
            service_name: "Test Portal".into(),
            non_stream_timeout_ms: 5_000,
            ..Default::default()
        }
    }

    fn upstream_request(model: &str) -> UpstreamRequest {
        CompletionRequest::from_value(json!({
            "model": model,
            "messages": [{ "role": "user", "content": "hi" }],
        }))
        .unwrap()
        .into_upstream("gateway")
    }

    async fn drain(mut body: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    // -----------------------------------------------------------------------
    // UpstreamClient::new
    // -----------------------------------------------------------------------

    #[test]
    fn new_without_key_is_unauthenticated() {
        let client = UpstreamClient::new(&UpstreamConfig::default()).unwrap();
        assert!(!client.is_authenticated());
    }

    #[test]
    fn new_rejects_key_with_invalid_header_bytes() {
        let cfg = UpstreamConfig {
            api_key: Some("bad\nkey".into()),
            ..Default::default()
        };
        assert!(UpstreamClient::new(&cfg).is_err());
    }

    // -----------------------------------------------------------------------
    // chat_completions: headers
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn api_key_sends_bearer_and_omits_inference_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_eq("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&cfg_for(&server, Some("sk-test"))).unwrap();
        client
            .chat_completions(&upstream_request("llama"), Some("user-42"))
            .await
            .expect("call should succeed");

        let received = server.received_requests().await.unwrap();
        assert!(received[0].headers.get(INFERENCE_ID).is_none());
    }

    #[tokio::test]
    async fn without_key_forwards_inference_id_and_no_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_eq(INFERENCE_ID, "user-42"))
            .and(header_eq(INFERENCE_SERVICE, "llama"))
            .and(header_eq(INFERENCE_PORTAL, "Test Portal"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&cfg_for(&server, None)).unwrap();
        client
            .chat_completions(&upstream_request("llama"), Some("user-42"))
            .await
            .expect("call should succeed");

        let received = server.received_requests().await.unwrap();
        assert!(received[0].headers.get("authorization").is_none());
    }

    // -----------------------------------------------------------------------
    // chat_completions: classification
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn success_returns_unread_body_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("data: hi\n\n", "text/event-stream"))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&cfg_for(&server, None)).unwrap();
        let response = client
            .chat_completions(&upstream_request("llama"), None)
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(drain(response.body).await, b"data: hi\n\n");
    }

    #[tokio::test]
    async fn error_field_yields_structured_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({ "error": { "message": "slow down" } })),
            )
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&cfg_for(&server, None)).unwrap();
        let err = client
            .chat_completions(&upstream_request("llama"), None)
            .await
            .err()
            .unwrap();

        match err {
            UpstreamError::Structured { status, error } => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(error["message"], "slow down");
            }
            other => panic!("expected structured error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn body_without_error_field_is_unstructured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "nope" })))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&cfg_for(&server, None)).unwrap();
        let err = client
            .chat_completions(&upstream_request("llama"), None)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, UpstreamError::Unstructured(_)), "got {err:?}");
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn empty_error_body_is_returned_as_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&cfg_for(&server, None)).unwrap();
        let response = client
            .chat_completions(&upstream_request("llama"), None)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(drain(response.body).await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_unstructured() {
        // Port 1 is reserved and never responds: guaranteed connection refusal.
        let cfg = UpstreamConfig {
            base_url: "http://127.0.0.1:1/v1".into(),
            ..Default::default()
        };
        let err = UpstreamClient::new(&cfg)
            .unwrap()
            .chat_completions(&upstream_request("llama"), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UpstreamError::Unstructured(_)));
    }

    // -----------------------------------------------------------------------
    // diagnose
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn diagnose_returns_status_and_raw_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&cfg_for(&server, None)).unwrap();
        let (status, text) = client
            .diagnose(&upstream_request("llama"), None)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(text, "bad gateway");
    }

    // -----------------------------------------------------------------------
    // models
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn models_returns_parsed_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header_eq("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "a" }])))
            .mount(&server)
            .await;

        let models = UpstreamClient::new(&cfg_for(&server, Some("sk-test")))
            .unwrap()
            .models()
            .await
            .unwrap();
        assert_eq!(models, json!([{ "id": "a" }]));
    }

    #[tokio::test]
    async fn models_errors_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = UpstreamClient::new(&cfg_for(&server, None))
            .unwrap()
            .models()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"), "got: {err}");
    }

    #[test]
    fn structured_error_ignores_null_and_missing_fields() {
        assert!(structured_error(r#"{"error": null}"#).is_none());
        assert!(structured_error(r#"{"detail": "x"}"#).is_none());
        assert!(structured_error("plain text").is_none());
        assert_eq!(structured_error(r#"{"error": "boom"}"#), Some(json!("boom")));
    }
}
