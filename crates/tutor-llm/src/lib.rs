//! Block Tutor chat-completion client
//!
//! Talks to an OpenAI-compatible `/chat/completions` endpoint through
//! `async-openai`.
//!
//! [`ChatClient`] performs buffered and streamed completions, [`messages`]
//! builds the system, text and image messages the relay sends, and
//! [`stream`] turns the provider's chunk stream into plain text deltas.

use async_openai::error::OpenAIError;
use thiserror::Error;

pub mod client;
pub mod messages;
pub mod stream;

pub use async_openai::types::{
    ChatCompletionRequestMessage, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    ResponseFormat,
};
pub use client::{ChatClient, DEFAULT_BASE_URL};
pub use stream::{delta_stream, DeltaStream};

/// Maximum number of characters of a provider error message kept in [`LlmError`].
pub const MAX_ERROR_BODY_CHARS: usize = 400;

/// Errors that can occur while talking to the chat provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// No API key was configured.
    #[error("missing API key for the chat provider")]
    MissingApiKey,

    /// The provider rejected or failed the request.
    #[error("chat API request failed: {0}")]
    Api(String),

    /// The request could not be built or sent.
    #[error("chat API request error: {0}")]
    Request(String),

    /// The provider returned a body that does not match the expected shape.
    #[error("chat API parse error: {0}")]
    Parse(String),

    /// The event stream failed or carried an error.
    #[error("chat API stream error: {0}")]
    Stream(String),

    /// The completion contained no text.
    #[error("chat API returned an empty response")]
    EmptyResponse,
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

impl From<OpenAIError> for LlmError {
    fn from(error: OpenAIError) -> Self {
        match error {
            OpenAIError::ApiError(api) => Self::Api(truncate(&api.to_string())),
            OpenAIError::StreamError(message) => Self::Stream(truncate(&message)),
            OpenAIError::JSONDeserialize(e) => Self::Parse(e.to_string()),
            other => Self::Request(truncate(&other.to_string())),
        }
    }
}
