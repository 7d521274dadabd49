//! Re-chunking of model deltas into a typed-out HTTP body.

use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use tracing::warn;
use tutor_llm::{DeltaStream, LlmError};

/// Content type of streamed replies.
pub const EVENT_STREAM: &str = "text/event-stream; charset=utf-8";

/// Splits every delta into single characters, in arrival order.
///
/// With a non-zero `delay` each character is held back by that long, which
/// gives the editor its typing effect. A zero delay passes deltas through
/// unchanged. An error ends the stream after everything before it.
pub fn typing_stream(deltas: DeltaStream, delay: Duration) -> BoxStream<'static, Result<String, LlmError>> {
    let logged = deltas.inspect_err(|e| warn!(error = %e, "Upstream stream failed"));

    if delay.is_zero() {
        return logged.boxed();
    }

    logged
        .flat_map(|delta| {
            let items: Vec<Result<String, LlmError>> = match delta {
                Ok(text) => text.chars().map(|c| Ok(c.to_string())).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
        .then(move |item| async move {
            if item.is_ok() {
                tokio::time::sleep(delay).await;
            }
            item
        })
        .boxed()
}

/// Wraps a character stream in a `text/event-stream` response.
pub fn stream_response(chars: BoxStream<'static, Result<String, LlmError>>) -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM)),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        Body::from_stream(chars),
    )
        .into_response()
}
