//! Client for the chat-completion API.
//!
//! [`ChatClient`] wraps an [`async_openai::Client`] pointed at the
//! configured base URL and exposes buffered and streamed completions.

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::CreateChatCompletionRequest;
use async_openai::Client;
use backoff::ExponentialBackoffBuilder;
use tracing::{debug, instrument, warn};

use crate::stream::{delta_stream, require_content, DeltaStream};
use crate::LlmError;

/// Base URL of the public `OpenAI` API.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for an OpenAI-compatible chat-completion endpoint.
///
/// Cloning is cheap; clones share the connection pool. Failed requests are
/// not retried.
///
/// # Example
///
/// ```no_run
/// use tutor_llm::{messages, ChatClient, CreateChatCompletionRequestArgs, DEFAULT_BASE_URL};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ChatClient::new(
///     reqwest::Client::new(),
///     std::env::var("OPENAI_API_KEY").ok(),
///     DEFAULT_BASE_URL,
/// )?;
/// let request = CreateChatCompletionRequestArgs::default()
///     .model("gpt-3.5-turbo")
///     .messages([messages::user("hello")?])
///     .build()?;
/// let text = client.complete(request).await?;
/// println!("{text}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChatClient {
    client: Client<OpenAIConfig>,
    base_url: String,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Creates a client for the provider at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::MissingApiKey`] if `api_key` is absent or blank.
    pub fn new(
        http: reqwest::Client,
        api_key: Option<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let config = OpenAIConfig::default()
            .with_api_base(&base_url)
            .with_api_key(api_key);
        let no_retry = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        Ok(Self {
            client: Client::with_config(config)
                .with_http_client(http)
                .with_backoff(no_retry),
            base_url,
        })
    }

    /// Returns the configured base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Runs a buffered completion and returns the first choice's text.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Api`] when the provider fails the request,
    /// [`LlmError::Parse`] for unexpected bodies and
    /// [`LlmError::EmptyResponse`] when the first choice has no text.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn complete(
        &self,
        mut request: CreateChatCompletionRequest,
    ) -> Result<String, LlmError> {
        request.stream = None;
        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!(error = %e, "Chat API request failed");
            LlmError::from(e)
        })?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        debug!(chars = text.chars().count(), "Completion received");
        Ok(text)
    }

    /// Starts a streamed completion.
    ///
    /// This returns once the first non-blank text has arrived, so an upstream
    /// failure or an answer without text surfaces as an error here rather
    /// than inside the stream.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Stream`] for non-2xx answers and
    /// [`LlmError::EmptyResponse`] when the stream ends without text.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn stream(
        &self,
        mut request: CreateChatCompletionRequest,
    ) -> Result<DeltaStream, LlmError> {
        request.stream = Some(true);
        let chunks = self.client.chat().create_stream(request).await?;

        let deltas = require_content(delta_stream(chunks)).await.map_err(|e| {
            warn!(error = %e, "Chat API stream failed before any text");
            e
        })?;
        debug!("Streaming completion started");
        Ok(deltas)
    }
}
