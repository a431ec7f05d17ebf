//! Inbound completion request and the upstream payload built from it.
//!
//! The browser sends a loosely-shaped JSON body. [`CompletionRequest::from_value`]
//! turns it into a typed request with every default applied, and
//! [`CompletionRequest::into_upstream`] applies the forwarding rules:
//!
//! 1. model, messages, sampling parameters and `stream` pass through;
//! 2. `arcana` is kept only when it names a non-empty id;
//! 3. tool use re-routes internal models to the tool gateway and filters
//!    `tools` down to [`ALLOWED_TOOL_TYPES`];
//! 4. `timeout` is clamped, then dropped for arcana/RAG/sauerkraut models.
//!
//! Top-level fields not listed on [`CompletionRequest`] are dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;

pub const DEFAULT_TEMPERATURE: f64 = 0.5;
pub const DEFAULT_TOP_P: f64 = 0.5;

/// Bounds applied to the caller's advisory `timeout` before it is forwarded.
pub const MIN_TIMEOUT_MS: u64 = 5_000;
pub const MAX_TIMEOUT_MS: u64 = 900_000;

/// Tool types the tool gateway understands. Anything else is dropped.
pub const ALLOWED_TOOL_TYPES: [&str; 5] = [
    "web_search_preview",
    "code_interpreter",
    "image_generation",
    "file_search",
    "mcp",
];

/// Prefix of models hosted outside the primary provider.
const EXTERNAL_MODEL_PREFIX: &str = "openai-";

/// Served under the external prefix but hosted internally.
const INTERNAL_EXCEPTION: &str = "gpt-oss-120b";

/// Model-name fragments whose upstreams reject a `timeout` field.
const NO_TIMEOUT_MODEL_MARKERS: [&str; 2] = ["rag", "sauerkraut"];

/// A single chat message. Fields beyond `role`/`content` (tool calls, names)
/// are preserved as-is. Entries are not validated beyond being objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Knowledge-base binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arcana {
    #[serde(default)]
    pub id: Option<String>,
}

/// A tool entry. Only `type` is interpreted; the rest is forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// Wire shape of the inbound body. Every optional field tolerates `null`.
#[derive(Debug, Deserialize)]
struct RawCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    arcana: Option<Arcana>,
    #[serde(default)]
    enable_tools: Option<bool>,
    #[serde(default)]
    tools: Option<Vec<Tool>>,
    #[serde(default, rename = "mcp-servers", alias = "mcp_servers")]
    mcp_servers: Option<Vec<Value>>,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    stream: Option<bool>,
}

/// A validated chat-completion request with all defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub top_p: f64,
    pub arcana: Option<Arcana>,
    pub enable_tools: bool,
    pub tools: Vec<Tool>,
    pub mcp_servers: Vec<Value>,
    /// Caller-supplied advisory timeout in milliseconds, unclamped.
    pub timeout: Option<f64>,
    pub stream: bool,
}

impl CompletionRequest {
    /// Validate and type an inbound JSON body.
    ///
    /// # Errors
    /// `422` when `messages` is not an array, or when the body otherwise fails
    /// to deserialize (missing `model`, malformed message entries).
    pub fn from_value(body: Value) -> Result<Self, ApiError> {
        if !body.get("messages").is_some_and(Value::is_array) {
            return Err(ApiError::unprocessable("Invalid messages provided"));
        }

        let raw: RawCompletionRequest = serde_json::from_value(body)
            .map_err(|e| ApiError::unprocessable(format!("Invalid request: {e}")))?;

        Ok(Self {
            model: raw.model,
            messages: raw.messages,
            temperature: raw.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: raw.top_p.unwrap_or(DEFAULT_TOP_P),
            arcana: raw.arcana,
            enable_tools: raw.enable_tools.unwrap_or(false),
            tools: raw.tools.unwrap_or_default(),
            mcp_servers: raw.mcp_servers.unwrap_or_default(),
            timeout: raw.timeout,
            stream: raw.stream.unwrap_or(true),
        })
    }

    /// Whether the model is hosted outside the primary provider.
    pub fn is_external_model(&self) -> bool {
        self.model.starts_with(EXTERNAL_MODEL_PREFIX) && !self.model.contains(INTERNAL_EXCEPTION)
    }

    /// The arcana id, if it is a non-empty string.
    pub fn arcana_id(&self) -> Option<&str> {
        self.arcana
            .as_ref()
            .and_then(|a| a.id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Whether `inference-service` should point at the tool gateway.
    pub fn routes_through_tool_gateway(&self) -> bool {
        self.enable_tools && !self.is_external_model()
    }

    /// Whether the upstream for this request accepts a `timeout` field.
    fn accepts_timeout(&self) -> bool {
        if self.arcana_id().is_some() {
            return false;
        }
        !NO_TIMEOUT_MODEL_MARKERS
            .iter()
            .any(|m| self.model.contains(m))
    }

    /// Apply the forwarding rules and produce the upstream call.
    ///
    /// `tool_gateway_service` replaces the model name in the
    /// `inference-service` header when tool routing applies.
    pub fn into_upstream(self, tool_gateway_service: &str) -> UpstreamRequest {
        let arcana = self.arcana_id().map(|id| Arcana {
            id: Some(id.to_owned()),
        });
        let tool_routed = self.routes_through_tool_gateway();
        let timeout = if self.accepts_timeout() {
            self.timeout.map(clamp_timeout)
        } else {
            None
        };

        let inference_service = if tool_routed {
            tool_gateway_service.to_owned()
        } else {
            self.model.clone()
        };

        let tools = match (self.enable_tools, tool_routed) {
            (false, _) => None,
            (true, true) => Some(
                self.tools
                    .into_iter()
                    .filter(|t| ALLOWED_TOOL_TYPES.contains(&t.kind.as_str()))
                    .collect(),
            ),
            (true, false) => Some(self.tools),
        };

        let mcp_servers = (self.enable_tools && !self.mcp_servers.is_empty())
            .then_some(self.mcp_servers);

        UpstreamRequest {
            inference_service,
            payload: UpstreamPayload {
                model: self.model,
                messages: self.messages,
                temperature: self.temperature,
                top_p: self.top_p,
                stream: self.stream,
                arcana,
                tools,
                mcp_servers,
                timeout,
            },
        }
    }
}

/// Clamp an advisory timeout (ms) into `[MIN_TIMEOUT_MS, MAX_TIMEOUT_MS]`.
pub fn clamp_timeout(ms: f64) -> u64 {
    ms.clamp(MIN_TIMEOUT_MS as f64, MAX_TIMEOUT_MS as f64) as u64
}

/// JSON body sent to `POST {base}/chat/completions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamPayload {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub top_p: f64,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arcana: Option<Arcana>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(rename = "mcp-servers", skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Everything request-specific about one upstream call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    /// Value of the `inference-service` routing header.
    pub inference_service: String,
    pub payload: UpstreamPayload,
}
