//! HTTP API of the Block Tutor relay.
//!
//! The editor never talks to the chat provider directly. Every request goes
//! through one of these endpoints, which pick the system prompt, call the
//! provider and relay the answer back.
//!
//! # Endpoints
//!
//! - `POST /build-block` - Generate blocks from a prompt (streamed)
//! - `PATCH /build-block` - Modify the current blocks (streamed)
//! - `POST /block-fix` - Repair blocks given an error message (streamed)
//! - `POST /blockly-insight` - Explain a workspace snapshot (streamed)
//! - `POST /ask` - Answer a programming question
//! - `POST /code-block` - Return the first fenced code block of a completion
//! - `GET /health` - Liveness check, not rate limited
//!
//! Streamed endpoints accept `?stream=false` to receive the whole answer at once.
//!
//! # Example
//!
//! ```no_run
//! use tutor_server::{create_router, AppState, Config};
//!
//! # async fn example() -> tutor_server::Result<()> {
//! let mut config = Config::default();
//! config.apply_env();
//! config.validate()?;
//!
//! let router = create_router(AppState::from_config(config)?);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8787").await?;
//! axum::serve(listener, router).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use tutor_llm::{
    messages, ChatClient, CreateChatCompletionRequest, CreateChatCompletionRequestArgs, LlmError,
    ResponseFormat,
};

use crate::error::{Result, ServerError};
use crate::extract::{first_code_block, BlockReply, NO_CODE_BLOCK};
use crate::prompts::{self, Level};
use crate::ratelimit::{rate_limit_middleware, RateLimitDecision, RateLimitGuard, RateLimiter};
use crate::relay;
use crate::Config;

/// Connect timeout for outgoing HTTP requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Preflight cache lifetime advertised to browsers.
const CORS_MAX_AGE: Duration = Duration::from_secs(600);

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for `POST /build-block`, `PATCH /build-block` and `POST /code-block`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// What the child wants to build or change.
    pub prompt: String,
    /// Learner level.
    pub level: Level,
    /// Current block document. Only used by `PATCH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml: Option<String>,
}

/// Request body for `POST /block-fix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRequest {
    /// Error reported by the editor.
    pub error: String,
    /// Block document that caused it.
    pub xml: String,
}

/// Request body for `POST /ask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    /// The child's question.
    pub prompt: String,
    /// Learner level, beginner when omitted.
    #[serde(default)]
    pub level: Level,
}

/// Request body for `POST /blockly-insight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRequest {
    /// PNG snapshot of the workspace, as a data URI or bare base64.
    pub image: String,
    /// Block document shown in the snapshot.
    pub xml: String,
    /// Learner level.
    pub level: Level,
}

/// Buffered text answer (`/ask`, `/blockly-insight?stream=false`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Model answer.
    pub message: String,
}

/// Response body of `POST /code-block`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodeBlockResponse {
    /// The first fenced code block, trimmed.
    Code {
        /// Block content.
        code: String,
    },
    /// No code block was found.
    Error {
        /// Always [`NO_CODE_BLOCK`].
        error: String,
    },
}

/// Response body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
}

/// Query parameters of the streamed endpoints.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RelayMode {
    /// `false` buffers the whole answer. Defaults to streaming.
    #[serde(default)]
    pub stream: Option<bool>,
}

impl RelayMode {
    const fn streaming(self) -> bool {
        !matches!(self.stream, Some(false))
    }
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
#[derive(Debug)]
pub struct AppState {
    /// Validated configuration.
    pub config: Config,
    /// Chat provider client.
    pub llm: ChatClient,
    /// Per-IP limiter, absent when rate limiting is disabled.
    pub limiter: Option<Arc<RateLimitGuard>>,
}

impl AppState {
    /// Builds the state from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the chat client or the rate limiter cannot be created.
    pub fn from_config(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let llm = ChatClient::new(
            http.clone(),
            config.openai_api_key.clone(),
            config.openai_base_url.clone(),
        )?;

        let limiter = match RateLimiter::from_config(&config.rate_limit, http)? {
            Some(limiter) => {
                let ip_header = HeaderName::from_bytes(config.rate_limit.ip_header.as_bytes())
                    .map_err(|e| {
                        ServerError::config_validation(
                            format!("rateLimit.ipHeader is not a valid header name: {e}"),
                            "Use the header your proxy sets, e.g. \"cf-connecting-ip\"",
                        )
                    })?;
                Some(Arc::new(RateLimitGuard::new(limiter, ip_header)))
            }
            None => None,
        };

        Ok(Self {
            config,
            llm,
            limiter,
        })
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// Error type for API handlers and middleware.
#[derive(Debug)]
pub(crate) enum ApiError {
    /// Body or query failed validation.
    InvalidRequest(String),
    /// The client IP header is missing.
    MissingClientIp,
    /// The client exceeded its allowance.
    RateLimited(RateLimitDecision),
    /// The rate-limit store failed.
    RateLimiterUnavailable,
    /// The chat provider failed before the answer started.
    Upstream(LlmError),
    /// The model answered with something other than a block reply.
    InvalidReply,
}

impl From<LlmError> for ApiError {
    fn from(error: LlmError) -> Self {
        Self::Upstream(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::MissingClientIp => (StatusCode::BAD_REQUEST, "IP not found".to_string()),
            Self::RateLimited(decision) => {
                let headers = [
                    (
                        HeaderName::from_static("x-ratelimit-limit"),
                        decision.limit.to_string(),
                    ),
                    (
                        HeaderName::from_static("x-ratelimit-remaining"),
                        decision.remaining.to_string(),
                    ),
                    (
                        HeaderName::from_static("x-ratelimit-reset"),
                        decision.reset.to_string(),
                    ),
                ];
                let body = Json(ErrorResponse {
                    error: "Too many requests".to_string(),
                });
                return (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response();
            }
            Self::RateLimiterUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Rate limiter unavailable".to_string(),
            ),
            Self::Upstream(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            Self::InvalidReply => (
                StatusCode::BAD_GATEWAY,
                "The model did not return blocks in the expected format".to_string(),
            ),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> std::result::Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(format!("Invalid request body: {e}")))
}

fn parse_mode(
    mode: std::result::Result<Query<RelayMode>, QueryRejection>,
) -> std::result::Result<RelayMode, ApiError> {
    mode.map(|Query(mode)| mode)
        .map_err(|e| ApiError::InvalidRequest(e.body_text()))
}

fn require(field: &str, value: &str) -> std::result::Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Wraps bare base64 PNG data in a data URI.
fn image_data_url(image: &str) -> String {
    let image = image.trim();
    if image.starts_with("data:") {
        image.to_string()
    } else {
        format!("data:image/png;base64,{image}")
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router with all endpoints.
///
/// The router carries:
/// - per-IP rate limiting on every endpoint except `/health`
/// - CORS restricted to the configured origins
/// - tracing middleware for request logging
pub fn create_router(state: AppState) -> Router {
    let origins: Arc<Vec<HeaderValue>> = Arc::new(
        state
            .config
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect(),
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins.iter().cloned()))
        .allow_methods([Method::POST, Method::GET, Method::PATCH, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("x-custom-header"),
            header::UPGRADE_INSECURE_REQUESTS,
            header::CONTENT_TYPE,
        ])
        .expose_headers([
            header::CONTENT_LENGTH,
            HeaderName::from_static("x-kuma-revision"),
        ])
        .max_age(CORS_MAX_AGE)
        .allow_credentials(true);

    let mut relay_routes = Router::new()
        .route("/build-block", post(handle_build).patch(handle_patch))
        .route("/block-fix", post(handle_fix))
        .route("/blockly-insight", post(handle_insight))
        .route("/ask", post(handle_ask))
        .route("/code-block", post(handle_code_block));

    if let Some(guard) = state.limiter.clone() {
        relay_routes =
            relay_routes.route_layer(middleware::from_fn_with_state(guard, rate_limit_middleware));
    }

    Router::new()
        .route("/health", get(handle_health))
        .merge(relay_routes)
        .layer(cors)
        .layer(middleware::from_fn_with_state(origins, reject_foreign_preflight))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Answers 403 to preflights from origins outside the allow list.
///
/// Simple requests from foreign origins still reach the handlers; browsers
/// withhold the response because no CORS headers are attached.
async fn reject_foreign_preflight(
    State(origins): State<Arc<Vec<HeaderValue>>>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let is_preflight = request.method() == Method::OPTIONS
        && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

    if is_preflight {
        let allowed = headers
            .get(header::ORIGIN)
            .is_some_and(|origin| origins.contains(origin));
        if !allowed {
            warn!(origin = ?headers.get(header::ORIGIN), "Rejected preflight from foreign origin");
            let body = Json(ErrorResponse {
                error: "Origin not allowed".to_string(),
            });
            return (StatusCode::FORBIDDEN, body).into_response();
        }
    }

    next.run(request).await
}

// ============================================================================
// Relay helpers
// ============================================================================

/// Streams the completion to the client, typed out character by character.
///
/// Nothing is sent until the provider produced its first text, so a failure
/// or an empty answer still becomes a 502.
async fn relay_stream(
    state: &AppState,
    chat: CreateChatCompletionRequest,
) -> std::result::Result<Response, ApiError> {
    let deltas = state.llm.stream(chat).await.map_err(|e| {
        warn!(error = %e, "Chat stream could not be opened");
        ApiError::Upstream(e)
    })?;
    Ok(relay::stream_response(relay::typing_stream(
        deltas,
        state.config.typing_delay(),
    )))
}

/// Runs a buffered completion.
async fn relay_complete(
    state: &AppState,
    chat: CreateChatCompletionRequest,
) -> std::result::Result<String, ApiError> {
    state.llm.complete(chat).await.map_err(|e| {
        warn!(error = %e, "Chat completion failed");
        ApiError::Upstream(e)
    })
}

/// Relays a request whose answer is a [`BlockReply`].
async fn relay_block_reply(
    state: &AppState,
    chat: CreateChatCompletionRequest,
    mode: RelayMode,
) -> std::result::Result<Response, ApiError> {
    if mode.streaming() {
        return relay_stream(state, chat).await;
    }

    let text = relay_complete(state, chat).await?;
    let Some(reply) = BlockReply::parse(&text) else {
        warn!(reply_len = text.len(), "Model reply is not a block reply");
        return Err(ApiError::InvalidReply);
    };
    Ok(Json(reply).into_response())
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for `GET /health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Handler for `POST /build-block`.
async fn handle_build(
    State(state): State<Arc<AppState>>,
    mode: std::result::Result<Query<RelayMode>, QueryRejection>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let mode = parse_mode(mode)?;
    let request: BuildRequest = parse_body(&body)?;
    require("prompt", &request.prompt)?;

    info!(level = %request.level, prompt_len = request.prompt.len(), "Build request");

    let chat = CreateChatCompletionRequestArgs::default()
        .model(&state.config.models.build)
        .messages([
            messages::system(prompts::build(request.level))?,
            messages::user(request.prompt)?,
        ])
        .response_format(ResponseFormat::JsonObject)
        .build()
        .map_err(LlmError::from)?;

    relay_block_reply(&state, chat, mode).await
}

/// Handler for `PATCH /build-block`.
async fn handle_patch(
    State(state): State<Arc<AppState>>,
    mode: std::result::Result<Query<RelayMode>, QueryRejection>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let mode = parse_mode(mode)?;
    let request: BuildRequest = parse_body(&body)?;
    require("prompt", &request.prompt)?;

    info!(
        level = %request.level,
        prompt_len = request.prompt.len(),
        has_xml = request.xml.is_some(),
        "Patch request"
    );

    let chat = CreateChatCompletionRequestArgs::default()
        .model(&state.config.models.patch)
        .messages([
            messages::system(prompts::patch(request.level))?,
            messages::user(prompts::patch_user_message(
                &request.prompt,
                request.xml.as_deref(),
            ))?,
        ])
        .response_format(ResponseFormat::JsonObject)
        .build()
        .map_err(LlmError::from)?;

    relay_block_reply(&state, chat, mode).await
}

/// Handler for `POST /block-fix`.
async fn handle_fix(
    State(state): State<Arc<AppState>>,
    mode: std::result::Result<Query<RelayMode>, QueryRejection>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let mode = parse_mode(mode)?;
    let request: FixRequest = parse_body(&body)?;
    require("error", &request.error)?;
    require("xml", &request.xml)?;

    info!(xml_len = request.xml.len(), "Fix request");

    let chat = CreateChatCompletionRequestArgs::default()
        .model(&state.config.models.fix)
        .messages([
            messages::system(prompts::fix())?,
            messages::user(prompts::fix_user_message(&request.error, &request.xml))?,
        ])
        .response_format(ResponseFormat::JsonObject)
        .build()
        .map_err(LlmError::from)?;

    relay_block_reply(&state, chat, mode).await
}

/// Handler for `POST /blockly-insight`.
async fn handle_insight(
    State(state): State<Arc<AppState>>,
    mode: std::result::Result<Query<RelayMode>, QueryRejection>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let mode = parse_mode(mode)?;
    let request: InsightRequest = parse_body(&body)?;
    require("image", &request.image)?;
    require("xml", &request.xml)?;

    info!(
        level = %request.level,
        image_len = request.image.len(),
        "Insight request"
    );

    // Deprecated upstream; vision models still read `max_tokens`.
    #[allow(deprecated)]
    let chat = CreateChatCompletionRequestArgs::default()
        .model(&state.config.models.insight)
        .messages([
            messages::system(prompts::insight(request.level))?,
            messages::user_with_image(
                prompts::insight_user_text(&request.xml),
                image_data_url(&request.image),
            )?,
        ])
        .max_tokens(state.config.insight_max_tokens)
        .build()
        .map_err(LlmError::from)?;

    if mode.streaming() {
        return relay_stream(&state, chat).await;
    }

    let message = relay_complete(&state, chat).await?;
    Ok(Json(MessageResponse { message }).into_response())
}

/// Handler for `POST /ask`.
async fn handle_ask(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> std::result::Result<Json<MessageResponse>, ApiError> {
    let request: AskRequest = parse_body(&body)?;
    require("prompt", &request.prompt)?;

    info!(level = %request.level, prompt_len = request.prompt.len(), "Ask request");

    let chat = CreateChatCompletionRequestArgs::default()
        .model(&state.config.models.ask)
        .messages([
            messages::system(prompts::ask(request.level))?,
            messages::user(request.prompt)?,
        ])
        .build()
        .map_err(LlmError::from)?;

    let message = relay_complete(&state, chat).await?;
    Ok(Json(MessageResponse { message }))
}

/// Handler for `POST /code-block`.
///
/// A completion without a code block is reported in the body with status 200.
async fn handle_code_block(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> std::result::Result<Json<CodeBlockResponse>, ApiError> {
    let request: BuildRequest = parse_body(&body)?;
    require("prompt", &request.prompt)?;

    info!(prompt_len = request.prompt.len(), "Code block request");

    let chat = CreateChatCompletionRequestArgs::default()
        .model(&state.config.models.code)
        .messages([
            messages::system(prompts::code())?,
            messages::user(request.prompt)?,
        ])
        .build()
        .map_err(LlmError::from)?;

    let text = relay_complete(&state, chat).await?;
    let response = match first_code_block(&text) {
        Some(code) => CodeBlockResponse::Code {
            code: code.to_string(),
        },
        None => {
            debug!(reply_len = text.len(), "No code block in completion");
            CodeBlockResponse::Error {
                error: NO_CODE_BLOCK.to_string(),
            }
        }
    };
    Ok(Json(response))
}
