//! Error types shared across the crate

use std::time::Duration;
use thiserror::Error;

use crate::rate_limit::RateLimitError;
use crate::retry::RetryError;

/// Conversation store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Appending to a session that was never created
    #[error("session not found: {0}")]
    SessionNotFound(String),
    /// Failure reported by a storage backend
    #[error("session store backend error: {0}")]
    Backend(String),
}

/// Upstream model failure with retry classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    /// Server-provided hint for when to try again
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Timeout, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::RateLimit, message).with_status(429)
    }

    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::ServerError, message).with_status(status)
    }

    pub fn auth(status: u16, message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Auth, message).with_status(status)
    }

    pub fn invalid_request(status: u16, message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::InvalidRequest, message).with_status(status)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Parse, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Unknown, message)
    }

    /// Classify an HTTP status that was not a success
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            429 => Self::rate_limit(message),
            401 | 403 => Self::auth(status, message),
            500..=599 => Self::server_error(status, message),
            400..=499 => Self::invalid_request(status, message),
            _ => Self::unknown(message).with_status(status),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// Connection refused or reset
    Network,
    /// Request took longer than the configured timeout
    Timeout,
    /// 429
    RateLimit,
    /// 5xx
    ServerError,
    /// 401, 403
    Auth,
    /// Other 4xx
    InvalidRequest,
    /// Response body could not be decoded
    Parse,
    Unknown,
}

impl UpstreamErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServerError
        )
    }
}

/// Default retry classification for upstream calls
pub fn is_retryable_error(error: &UpstreamError) -> bool {
    error.is_retryable()
}

/// Server-requested minimum wait before the next attempt
pub fn retry_after_hint(error: &UpstreamError) -> Option<Duration> {
    error.retry_after
}

/// Failures that escape `AgentLoop::process_message`
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("upstream model call failed: {0}")]
    Upstream(#[from] RetryError<UpstreamError>),
    #[error("rate limiter refused admission: {0}")]
    RateLimit(#[from] RateLimitError),
}

impl AgentError {
    /// The upstream failure that ended the call, if any
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            AgentError::Upstream(err) => Some(err.last_error()),
            _ => None,
        }
    }

    /// True when a retryable upstream failure persisted past the retry budget
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Upstream(RetryError::Exhausted { .. }))
    }
}
