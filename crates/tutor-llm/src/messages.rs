//! Builders for the messages the relay sends.
//!
//! Every route sends one system prompt followed by one user message. The
//! insight route attaches a screenshot of the workspace as an image part.

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
    ImageUrlArgs,
};

use crate::LlmError;

/// Builds a system message.
pub fn system(text: impl Into<String>) -> Result<ChatCompletionRequestMessage, LlmError> {
    Ok(ChatCompletionRequestSystemMessageArgs::default()
        .content(text.into())
        .build()?
        .into())
}

/// Builds a plain-text user message.
pub fn user(text: impl Into<String>) -> Result<ChatCompletionRequestMessage, LlmError> {
    Ok(ChatCompletionRequestUserMessageArgs::default()
        .content(text.into())
        .build()?
        .into())
}

/// Builds a user message carrying text followed by an image.
///
/// `image_url` may be an `https://` URL or a `data:` URL.
pub fn user_with_image(
    text: impl Into<String>,
    image_url: impl Into<String>,
) -> Result<ChatCompletionRequestMessage, LlmError> {
    let text = ChatCompletionRequestMessageContentPartTextArgs::default()
        .text(text.into())
        .build()?;
    let image = ChatCompletionRequestMessageContentPartImageArgs::default()
        .image_url(ImageUrlArgs::default().url(image_url.into()).build()?)
        .build()?;

    let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![text.into(), image.into()];
    Ok(ChatCompletionRequestUserMessageArgs::default()
        .content(parts)
        .build()?
        .into())
}
