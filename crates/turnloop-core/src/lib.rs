//! turnloop-core: Tool-calling conversation loop
//!
//! Provides:
//! - Configuration loading (turnloop.toml)
//! - Conversation store abstraction with an in-memory backend
//! - Sliding-window rate limiter and retry executor
//! - Tool registry, router and invocation guard
//! - Anthropic Messages API client
//! - The agent loop that ties them together

pub mod agent;
pub mod anthropic;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod message;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod tools;

pub use agent::{AgentConfig, AgentLoop, AgentReply, LoopState, Outcome};
pub use anthropic::AnthropicClient;
pub use client::{GenerationParams, ModelClient, ModelResponse, StopReason, Usage};
pub use config::Config;
pub use conversation::{ConversationStore, InMemoryConversationStore, Session, SessionKey};
pub use error::{
    is_retryable_error, retry_after_hint, AgentError, StoreError, UpstreamError, UpstreamErrorKind,
};
pub use message::{ContentBlock, Role, ToolInvocationRequest, Turn, TurnContent};
pub use metrics::{InMemoryMetrics, MetricsObserver, MetricsSnapshot, NoopMetrics};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimitStats, RateLimiter};
pub use retry::{with_retry, with_retry_hinted, RetryError, RetryPolicy};
pub use tools::{
    invoke, ParameterProperty, ParameterSchema, Tool, ToolContext, ToolDefinition, ToolRegistry,
    ToolResult, ToolRouter,
};
