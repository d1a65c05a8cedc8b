//! Error types for the gateway core.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway core.
///
/// Variants line up with the error kinds the core is required to
/// distinguish: malformed input, credential/auth failure, transient and
/// permanent upstream failure, context overflow, decode noise, tool
/// failure, and quota rejection.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied malformed input (missing messages, bad id).
    #[error("validation error: {0}")]
    Validation(String),

    /// Credential missing, expired, or refused by the upstream.
    #[error("auth error: {0}")]
    Auth(String),

    /// 429 or 5xx from the upstream; retryable with backoff.
    #[error("upstream transient error ({status}): {body}")]
    UpstreamTransient { status: u16, body: String },

    /// Context-overflow signal that survived compression up to level 3.
    #[error("context limit exceeded after maximum compression")]
    ContextLimit,

    /// Any other 4xx from the upstream.
    #[error("upstream permanent error ({status}): {body}")]
    UpstreamPermanent {
        status: u16,
        error_type: Option<String>,
        request_id: Option<String>,
        body: String,
    },

    /// A decoded frame's structure was unrecognized. Never fatal; the
    /// caller logs and skips.
    #[error("parse error: {0}")]
    Parse(String),

    /// Tool execution failed; captured into the tool-result payload, not
    /// propagated past the agentic loop.
    #[error("tool execution error: {0}")]
    Tool(String),

    /// Admission rejected by the quota engine; names the limit that was hit.
    #[error("quota exceeded: {limit}")]
    Quota { limit: &'static str },

    /// HTTP transport error.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Streaming error (connection, framing).
    #[error("streaming error: {0}")]
    Stream(String),

    /// Invalid input from a caller that isn't covered by `Validation`.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Request timeout.
    #[error("request timeout")]
    Timeout,

    /// Catch-all.
    #[error("error: {0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    pub fn upstream_transient(status: u16, body: impl Into<String>) -> Self {
        Error::UpstreamTransient {
            status,
            body: body.into(),
        }
    }

    pub fn upstream_permanent(
        status: u16,
        error_type: Option<String>,
        request_id: Option<String>,
        body: impl Into<String>,
    ) -> Self {
        Error::UpstreamPermanent {
            status,
            error_type,
            request_id,
            body: body.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    pub fn quota(limit: &'static str) -> Self {
        Error::Quota { limit }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn timeout() -> Self {
        Error::Timeout
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True for the upstream-transient/timeout/stream class the retry
    /// policy should re-attempt; false for everything else.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UpstreamTransient { .. } | Error::Timeout | Error::Stream(_)
        )
    }

    /// True for the context-overflow signal (HTTP 400 + `ValidationException`)
    /// that the caller should route through the `ContextCompressor` instead
    /// of the generic retry policy.
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, Error::ContextLimit)
    }
}
