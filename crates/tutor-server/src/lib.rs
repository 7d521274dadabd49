//! Block Tutor relay
//!
//! HTTP service between the Blockly editor and a chat-completion API:
//! prompt selection, streamed relaying, per-IP rate limiting and CORS.

pub mod api;
pub mod config;
pub mod error;
pub mod extract;
pub mod prompts;
pub mod ratelimit;
pub mod relay;

pub use api::{
    create_router, AppState, AskRequest, BuildRequest, CodeBlockResponse, ErrorResponse,
    FixRequest, HealthResponse, InsightRequest, MessageResponse, RelayMode,
};
pub use config::{Config, ModelConfig, RateLimitBackend, RateLimitConfig, CONFIG_FILE_NAME};
pub use error::{Result, ServerError};
pub use extract::{first_code_block, BlockReply, NO_CODE_BLOCK};
pub use prompts::Level;
pub use ratelimit::{MemoryLimiter, RateLimitDecision, RateLimiter, UpstashLimiter};
