//! Configuration types for chat-relay.
//!
//! Config is loaded once at startup from a TOML file and never mutated
//! afterwards. Unlike request-level failures, a broken config file must not
//! keep the relay from starting: [`Config::load_or_default`] falls back to
//! built-in defaults and hands the error back for logging.
//!
//! # Example
//! ```toml
//! [server]
//! port = 3001
//!
//! [upstream]
//! base_url     = "https://gateway.example.org/v1"
//! api_key_env  = "CHAT_RELAY_API_KEY"
//! service_name = "Chat AI"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Placeholder identity served from `GET /user`.
    #[serde(default)]
    pub user: UserConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or fall back to [`Config::default`] when the file is
    /// missing, malformed, or fails validation.
    ///
    /// The load error is handed back rather than logged: the config decides
    /// the log level, so tracing is not up yet when this runs.
    pub fn load_or_default(path: &Path) -> (Self, Option<anyhow::Error>) {
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        let url = reqwest::Url::parse(&self.upstream.base_url)
            .with_context(|| format!("upstream.base_url `{}` is not a URL", self.upstream.base_url))?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "upstream.base_url must be http or https, got `{}`",
            url.scheme()
        );
        anyhow::ensure!(
            self.upstream.non_stream_timeout_ms > 0,
            "upstream.non_stream_timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.upstream.connect_timeout_ms > 0,
            "upstream.connect_timeout_ms must be positive"
        );
        if let Some(key) = self.upstream.api_key() {
            anyhow::ensure!(
                reqwest::header::HeaderValue::from_str(&format!("Bearer {key}")).is_ok(),
                "upstream API key contains characters not allowed in a header"
            );
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port the HTTP API listens on (default: 3001).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Answer browser preflight requests with a permissive CORS policy.
    ///
    /// Needed when the front-end is served from a different origin.
    #[serde(default = "defaults::cors")]
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            log_level: None,
            cors: defaults::cors(),
        }
    }
}

/// The OpenAI-compatible inference gateway all completions are sent to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Base URL including any version prefix; `/chat/completions` and
    /// `/models` are appended verbatim.
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    /// Static API key. When present (here or via `api_key_env`) every
    /// upstream call carries `Authorization: Bearer <key>` and the caller's
    /// `inference-id` header is not forwarded.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key. Takes precedence over
    /// `api_key` so secrets can stay out of the file.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Display name sent as the `inference-portal` routing header.
    #[serde(default = "defaults::service_name")]
    pub service_name: String,

    /// `inference-service` value used when a request is routed through the
    /// tool gateway.
    #[serde(default = "defaults::tool_gateway_service")]
    pub tool_gateway_service: String,

    /// Local deadline for non-streaming completions (default: 120 000).
    #[serde(default = "defaults::non_stream_timeout_ms")]
    pub non_stream_timeout_ms: u64,

    /// TCP connect timeout for upstream calls (default: 10 000).
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl UpstreamConfig {
    /// Resolve the static API key, if one is configured.
    ///
    /// Empty values count as "not configured".
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| self.api_key.clone())
            .filter(|k| !k.is_empty())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            api_key: None,
            api_key_env: None,
            service_name: defaults::service_name(),
            tool_gateway_service: defaults::tool_gateway_service(),
            non_stream_timeout_ms: defaults::non_stream_timeout_ms(),
            connect_timeout_ms: defaults::connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    #[serde(default = "defaults::user_id")]
    pub id: String,
    #[serde(default = "defaults::user_name")]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            id: defaults::user_id(),
            name: defaults::user_name(),
            email: String::new(),
        }
    }
}

mod defaults {
    pub fn port() -> u16 { 3001 }
    pub fn cors() -> bool { true }
    pub fn base_url() -> String { "http://127.0.0.1:8000/v1".into() }
    pub fn service_name() -> String { "Chat AI".into() }
    pub fn tool_gateway_service() -> String { "saia-openai-gateway".into() }
    pub fn non_stream_timeout_ms() -> u64 { 120_000 }
    pub fn connect_timeout_ms() -> u64 { 10_000 }
    pub fn user_id() -> String { "local".into() }
    pub fn user_name() -> String { "Local User".into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Parsing & validation
    // -----------------------------------------------------------------------

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.server.port, 3001);
        assert!(config.server.cors);
        assert_eq!(config.upstream.base_url, "http://127.0.0.1:8000/v1");
        assert_eq!(config.upstream.tool_gateway_service, "saia-openai-gateway");
        assert_eq!(config.upstream.non_stream_timeout_ms, 120_000);
        assert_eq!(config.user.id, "local");
        config.validate().expect("defaults should be valid");
    }

    #[test]
    fn validation_rejects_non_url_base() {
        let mut config = Config::default();
        config.upstream.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_non_http_scheme() {
        let mut config = Config::default();
        config.upstream.base_url = "ftp://gateway.example.org".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_or_default_falls_back_on_invalid_values() {
        let path = std::env::temp_dir().join(format!("chat-relay-invalid-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[server]\nport = 9000\n[upstream]\nbase_url = \"nope\"\n").unwrap();
        let (config, err) = Config::load_or_default(&path);
        assert!(err.is_some());
        assert_eq!(config.server.port, 3001, "partially valid file must not leak through");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn validation_rejects_unusable_api_key() {
        let mut config = Config::default();
        config.upstream.api_key = Some("sk-\nbroken".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_deadline() {
        let mut config = Config::default();
        config.upstream.non_stream_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    // -----------------------------------------------------------------------
    // Fallback loading
    // -----------------------------------------------------------------------

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let (config, err) = Config::load_or_default(Path::new("/definitely/not/here/config.toml"));
        assert_eq!(config.server.port, 3001);
        assert!(err.is_some());
    }

    #[test]
    fn load_or_default_tolerates_malformed_file() {
        let path = std::env::temp_dir().join(format!("chat-relay-bad-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[server\nport = ").unwrap();
        let (config, err) = Config::load_or_default(&path);
        assert_eq!(config.server.port, 3001);
        assert!(format!("{:#}", err.unwrap()).contains("parsing config TOML"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_reads_valid_file() {
        let path = std::env::temp_dir().join(format!("chat-relay-ok-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
            [server]
            port = 9000
            [upstream]
            base_url = "https://gateway.example.org/v1"
            "#,
        )
        .unwrap();
        let (config, err) = Config::load_or_default(&path);
        assert!(err.is_none(), "unexpected error: {err:?}");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.upstream.base_url, "https://gateway.example.org/v1");
        std::fs::remove_file(&path).ok();
    }

    // -----------------------------------------------------------------------
    // API key resolution
    // -----------------------------------------------------------------------

    #[test]
    fn api_key_from_literal() {
        let cfg = UpstreamConfig {
            api_key: Some("sk-literal".into()),
            ..Default::default()
        };
        assert_eq!(cfg.api_key().as_deref(), Some("sk-literal"));
    }

    #[test]
    fn api_key_env_takes_precedence_over_literal() {
        let var = "CHAT_RELAY_TEST_KEY_PRECEDENCE_41";
        // SAFETY: unique variable name; no other test reads it.
        unsafe { std::env::set_var(var, "sk-from-env") };
        let cfg = UpstreamConfig {
            api_key: Some("sk-literal".into()),
            api_key_env: Some(var.into()),
            ..Default::default()
        };
        assert_eq!(cfg.api_key().as_deref(), Some("sk-from-env"));
        unsafe { std::env::remove_var(var) };
    }

    #[test]
    fn unset_env_var_falls_back_to_literal() {
        let cfg = UpstreamConfig {
            api_key: Some("sk-literal".into()),
            api_key_env: Some("CHAT_RELAY_TEST_DEFINITELY_NOT_SET_XYZ_99".into()),
            ..Default::default()
        };
        assert_eq!(cfg.api_key().as_deref(), Some("sk-literal"));
    }

    #[test]
    fn empty_key_counts_as_unconfigured() {
        let cfg = UpstreamConfig {
            api_key: Some(String::new()),
            ..Default::default()
        };
        assert!(cfg.api_key().is_none());
    }
}
