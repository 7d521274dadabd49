//! Text deltas from a streamed completion.

use async_openai::types::ChatCompletionResponseStream;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};

use crate::LlmError;

/// Stream of text deltas produced by a streamed completion.
pub type DeltaStream = BoxStream<'static, Result<String, LlmError>>;

/// Maps provider chunks to the text of their first choice.
///
/// Chunks without text are skipped. The stream ends after the first error,
/// so a malformed chunk cuts the answer short instead of being skipped over.
pub fn delta_stream(chunks: ChatCompletionResponseStream) -> DeltaStream {
    chunks
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .filter_map(|item| {
            future::ready(match item {
                Ok(chunk) => chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|text| !text.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(LlmError::from(e))),
            })
        })
        .boxed()
}

/// Waits for the first non-blank text and returns a stream that replays it.
///
/// Leading whitespace-only deltas are held back and replayed with the first
/// real text.
///
/// # Errors
///
/// Returns the first error the stream yields before any text, or
/// [`LlmError::EmptyResponse`] if it ends without text.
pub async fn require_content(mut deltas: DeltaStream) -> Result<DeltaStream, LlmError> {
    let mut prefix = String::new();
    while let Some(delta) = deltas.next().await {
        prefix.push_str(&delta?);
        if !prefix.trim().is_empty() {
            return Ok(stream::once(future::ready(Ok(prefix))).chain(deltas).boxed());
        }
    }
    Err(LlmError::EmptyResponse)
}
