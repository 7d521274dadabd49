//! Configuration types for the Block Tutor relay.
//!
//! Non-secret settings come from an optional `block-tutor.json` file where
//! every field has a default. Secrets (the chat provider key and the Upstash
//! credentials) are read from the environment and never serialized back.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// The default config file name.
pub const CONFIG_FILE_NAME: &str = "block-tutor.json";

/// Environment variable holding the chat provider API key.
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
/// Environment variable overriding the chat provider base URL.
pub const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
/// Environment variable holding the Upstash Redis REST URL.
pub const ENV_UPSTASH_URL: &str = "UPSTASH_REDIS_REST_URL";
/// Environment variable holding the Upstash Redis REST token.
pub const ENV_UPSTASH_TOKEN: &str = "UPSTASH_REDIS_REST_TOKEN";

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8787
}

fn default_openai_base_url() -> String {
    tutor_llm::DEFAULT_BASE_URL.to_string()
}

const fn default_insight_max_tokens() -> u32 {
    1024
}

/// Delay between streamed characters, in milliseconds.
const fn default_typing_delay_ms() -> u64 {
    20
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "https://block-tutor.pages.dev".to_string(),
    ]
}

fn default_json_model() -> String {
    "gpt-4-1106-preview".to_string()
}

fn default_code_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_insight_model() -> String {
    "gpt-4-vision-preview".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_rate_limit() -> u32 {
    10
}

const fn default_window_secs() -> u64 {
    10
}

fn default_ip_header() -> String {
    "cf-connecting-ip".to_string()
}

fn default_prefix() -> String {
    "block-tutor".to_string()
}

/// Main configuration for the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    /// Chat provider API key. Only ever read from the environment.
    #[serde(skip)]
    pub openai_api_key: Option<String>,

    /// Model used by each route.
    #[serde(default)]
    pub models: ModelConfig,

    /// Token cap for image explanations.
    #[serde(default = "default_insight_max_tokens")]
    pub insight_max_tokens: u32,

    /// Delay between characters on streaming routes. `0` streams deltas as fast as they arrive.
    #[serde(default = "default_typing_delay_ms")]
    pub typing_delay_ms: u64,

    /// Origins allowed by CORS.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Per-IP rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            openai_base_url: default_openai_base_url(),
            openai_api_key: None,
            models: ModelConfig::default(),
            insight_max_tokens: default_insight_max_tokens(),
            typing_delay_ms: default_typing_delay_ms(),
            allowed_origins: default_allowed_origins(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `block-tutor.json`; if absent, returns the defaults.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            ServerError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_file(&current_dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// A missing file yields the defaults. Secrets are not applied here;
    /// call [`Config::apply_env`] afterwards and then [`Config::validate`].
    ///
    /// # Errors
    ///
    /// Returns `ServerError::ConfigParseError` if the file cannot be read or
    /// contains invalid JSON.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ServerError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        serde_json::from_str(&contents).map_err(|e| ServerError::config_parse(path, e.to_string()))
    }

    /// Applies secrets and overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Applies secrets and overrides from an arbitrary lookup.
    ///
    /// Blank values are treated as unset.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_OPENAI_API_KEY) {
            self.openai_api_key = Some(key);
        }
        if let Some(url) = get(ENV_OPENAI_BASE_URL) {
            self.openai_base_url = url;
        }
        if let Some(url) = get(ENV_UPSTASH_URL) {
            self.rate_limit.upstash_url = Some(url);
        }
        if let Some(token) = get(ENV_UPSTASH_TOKEN) {
            self.rate_limit.upstash_token = Some(token);
        }
    }

    /// Returns the typing delay as a [`std::time::Duration`].
    #[must_use]
    pub const fn typing_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.typing_delay_ms)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::MissingSecret` when a required secret is absent
    /// and `ServerError::ConfigValidationError` for any other invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.openai_api_key.is_none() {
            return Err(ServerError::missing_secret(ENV_OPENAI_API_KEY));
        }

        if self.openai_base_url.trim().is_empty() {
            return Err(ServerError::config_validation(
                "openaiBaseUrl must not be empty",
                "Remove openaiBaseUrl from block-tutor.json to use the public API",
            ));
        }

        self.models.validate()?;

        if self.allowed_origins.is_empty() {
            return Err(ServerError::config_validation(
                "allowedOrigins must list at least one origin",
                "Add the editor's origin, e.g. \"http://localhost:5173\"",
            ));
        }

        if let Some(origin) = self
            .allowed_origins
            .iter()
            .find(|origin| axum::http::HeaderValue::from_str(origin).is_err())
        {
            return Err(ServerError::config_validation(
                format!("allowedOrigins contains an invalid origin: '{origin}'"),
                "Use plain scheme://host[:port] origins",
            ));
        }

        self.rate_limit.validate()
    }
}

/// Model identifiers per route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// `POST /build-block`.
    #[serde(default = "default_json_model")]
    pub build: String,
    /// `PATCH /build-block`.
    #[serde(default = "default_json_model")]
    pub patch: String,
    /// `POST /block-fix`.
    #[serde(default = "default_json_model")]
    pub fix: String,
    /// `POST /ask`.
    #[serde(default = "default_json_model")]
    pub ask: String,
    /// `POST /code-block`.
    #[serde(default = "default_code_model")]
    pub code: String,
    /// `POST /blockly-insight`; must accept image input.
    #[serde(default = "default_insight_model")]
    pub insight: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            build: default_json_model(),
            patch: default_json_model(),
            fix: default_json_model(),
            ask: default_json_model(),
            code: default_code_model(),
            insight: default_insight_model(),
        }
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<()> {
        let fields = [
            ("build", &self.build),
            ("patch", &self.patch),
            ("fix", &self.fix),
            ("ask", &self.ask),
            ("code", &self.code),
            ("insight", &self.insight),
        ];
        for (name, model) in fields {
            if model.trim().is_empty() {
                return Err(ServerError::config_validation(
                    format!("models.{name} must not be empty"),
                    "Provide a model identifier or remove the field to use the default",
                ));
            }
        }
        Ok(())
    }
}

/// Where rate-limit counters live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitBackend {
    /// In this process (single instance, lost on restart).
    #[default]
    Memory,
    /// Upstash Redis over its REST API.
    Upstash,
}

impl RateLimitBackend {
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "upstash" => Some(Self::Upstash),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for RateLimitBackend {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid rate limit backend '{s}': expected one of 'memory', 'upstash'"
            ))
        })
    }
}

impl Serialize for RateLimitBackend {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            Self::Memory => "memory",
            Self::Upstash => "upstash",
        })
    }
}

/// Per-IP sliding-window rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Whether requests are limited at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Counter storage.
    #[serde(default)]
    pub backend: RateLimitBackend,

    /// Requests admitted per window.
    #[serde(default = "default_rate_limit")]
    pub limit: u32,

    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Header carrying the client IP, set by the fronting proxy.
    #[serde(default = "default_ip_header")]
    pub ip_header: String,

    /// Key prefix in the counter store.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Upstash REST URL. Only ever read from the environment.
    #[serde(skip)]
    pub upstash_url: Option<String>,

    /// Upstash REST token. Only ever read from the environment.
    #[serde(skip)]
    pub upstash_token: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            backend: RateLimitBackend::default(),
            limit: default_rate_limit(),
            window_secs: default_window_secs(),
            ip_header: default_ip_header(),
            prefix: default_prefix(),
            upstash_url: None,
            upstash_token: None,
        }
    }
}

impl RateLimitConfig {
    /// Window length in milliseconds.
    #[must_use]
    pub const fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.limit == 0 {
            return Err(ServerError::config_validation(
                "rateLimit.limit must be greater than 0",
                "Set rateLimit.limit to at least 1, or set rateLimit.enabled to false",
            ));
        }

        if self.window_secs == 0 {
            return Err(ServerError::config_validation(
                "rateLimit.windowSecs must be greater than 0",
                "Set rateLimit.windowSecs to at least 1 second",
            ));
        }

        if axum::http::HeaderName::from_bytes(self.ip_header.as_bytes()).is_err() {
            return Err(ServerError::config_validation(
                format!("rateLimit.ipHeader is not a valid header name: '{}'", self.ip_header),
                "Use the header your proxy sets, e.g. \"cf-connecting-ip\" or \"x-real-ip\"",
            ));
        }

        if self.backend == RateLimitBackend::Upstash {
            if self.upstash_url.is_none() {
                return Err(ServerError::missing_secret(ENV_UPSTASH_URL));
            }
            if self.upstash_token.is_none() {
                return Err(ServerError::missing_secret(ENV_UPSTASH_TOKEN));
            }
        }

        Ok(())
    }
}
