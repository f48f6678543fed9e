//! Typed completion errors and the failure classifier.
//!
//! Every failure crossing the completion client is classified once, at the
//! point it first appears, into a `CompletionError`. Downstream layers branch
//! on `kind()` instead of re-deriving meaning from error text. Substring
//! matching on raw messages exists only as a fallback for transport libraries
//! that surface untyped errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure category, used for retry decisions and host-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Connection,
    Timeout,
    ServerError,
    ContextLengthExceeded,
    Streaming,
    UserInterrupted,
    Validation,
    RetryExhausted,
    Unknown,
}

impl ErrorKind {
    /// Whether the retry state machine may re-attempt this failure.
    ///
    /// `ContextLengthExceeded` is never retried: the caller must compact.
    /// `UserInterrupted` short-circuits any pending retry loop.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::ServerError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServerError => "server-error",
            ErrorKind::ContextLengthExceeded => "context-length-exceeded",
            ErrorKind::Streaming => "streaming",
            ErrorKind::UserInterrupted => "user-interrupted",
            ErrorKind::Validation => "validation",
            ErrorKind::RetryExhausted => "retry-exhausted",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// A classified completion failure.
///
/// The display strings are the human-readable summaries shown to the host;
/// the raw transport text rides along in the variant payload.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompletionError {
    #[error("the provider is rate limiting requests: {0}")]
    RateLimited(String),
    #[error("could not reach the provider: {0}")]
    Connection(String),
    #[error("the request timed out: {0}")]
    Timeout(String),
    #[error("the provider reported a server error: {0}")]
    ServerError(String),
    #[error("the conversation no longer fits the model's context window; compact it to continue")]
    ContextLengthExceeded,
    #[error("the response stream failed: {0}")]
    Streaming(String),
    #[error("interrupted")]
    UserInterrupted,
    #[error("the provider rejected the request: {0}")]
    Validation(String),
    #[error("gave up after repeated {last} failures: {detail}")]
    RetryExhausted { last: ErrorKind, detail: String },
    #[error("unexpected completion failure: {0}")]
    Unknown(String),
}

impl CompletionError {
    pub fn from_kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::RateLimited => CompletionError::RateLimited(detail),
            ErrorKind::Connection => CompletionError::Connection(detail),
            ErrorKind::Timeout => CompletionError::Timeout(detail),
            ErrorKind::ServerError => CompletionError::ServerError(detail),
            ErrorKind::ContextLengthExceeded => CompletionError::ContextLengthExceeded,
            ErrorKind::Streaming => CompletionError::Streaming(detail),
            ErrorKind::UserInterrupted => CompletionError::UserInterrupted,
            ErrorKind::Validation => CompletionError::Validation(detail),
            ErrorKind::RetryExhausted => CompletionError::RetryExhausted {
                last: ErrorKind::Unknown,
                detail,
            },
            ErrorKind::Unknown => CompletionError::Unknown(detail),
        }
    }

    /// Wrap the last failure once the full retry protocol is spent, so
    /// callers can tell "still failing transiently" from "we gave up".
    pub fn retry_exhausted(last: CompletionError) -> Self {
        CompletionError::RetryExhausted {
            last: last.kind(),
            detail: last.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CompletionError::RateLimited(_) => ErrorKind::RateLimited,
            CompletionError::Connection(_) => ErrorKind::Connection,
            CompletionError::Timeout(_) => ErrorKind::Timeout,
            CompletionError::ServerError(_) => ErrorKind::ServerError,
            CompletionError::ContextLengthExceeded => ErrorKind::ContextLengthExceeded,
            CompletionError::Streaming(_) => ErrorKind::Streaming,
            CompletionError::UserInterrupted => ErrorKind::UserInterrupted,
            CompletionError::Validation(_) => ErrorKind::Validation,
            CompletionError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            CompletionError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }
}

/// Classify an HTTP error response. Structured classification: the status
/// code decides the kind, with the body consulted only to tell a context
/// overflow apart from other 4xx rejections.
pub fn classify_status(status: u16, body: &str) -> CompletionError {
    match status {
        429 => CompletionError::RateLimited(format!("HTTP 429: {}", first_line(body))),
        408 => CompletionError::Timeout(format!("HTTP 408: {}", first_line(body))),
        500..=599 => {
            CompletionError::ServerError(format!("HTTP {}: {}", status, first_line(body)))
        }
        400..=499 => {
            if is_context_length_message(body) {
                CompletionError::ContextLengthExceeded
            } else {
                CompletionError::Validation(format!("HTTP {}: {}", status, first_line(body)))
            }
        }
        _ => CompletionError::Unknown(format!("HTTP {}: {}", status, first_line(body))),
    }
}

/// Classify a transport-level failure. Uses reqwest's structured error
/// predicates first, falling back to message matching.
pub fn classify_transport(err: &reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        return CompletionError::Timeout(err.to_string());
    }
    if err.is_connect() {
        return CompletionError::Connection(err.to_string());
    }
    classify_text(&err.to_string())
}

/// Best-effort fallback: classify from raw error text alone. Network
/// libraries disagree on error types, so this is substring matching,
/// only ever used when no structured signal was available.
pub fn classify_text(message: &str) -> CompletionError {
    let lower = message.to_lowercase();

    if is_context_length_message(&lower) {
        return CompletionError::ContextLengthExceeded;
    }
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return CompletionError::RateLimited(message.to_string());
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return CompletionError::Timeout(message.to_string());
    }
    if lower.contains("connection reset")
        || lower.contains("connection closed")
        || lower.contains("connection refused")
        || lower.contains("broken pipe")
        || lower.contains("dns error")
    {
        return CompletionError::Connection(message.to_string());
    }
    if lower.contains("502 bad gateway")
        || lower.contains("503 service unavailable")
        || lower.contains("504 gateway timeout")
        || lower.contains("internal server error")
        || lower.contains("overloaded")
    {
        return CompletionError::ServerError(message.to_string());
    }
    if lower.contains("error decoding")
        || lower.contains("error reading")
        || lower.contains("unexpected eof")
        || lower.contains("incomplete message")
    {
        return CompletionError::Streaming(message.to_string());
    }
    if lower.contains("interrupted") {
        return CompletionError::UserInterrupted;
    }

    CompletionError::Unknown(message.to_string())
}

fn is_context_length_message(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("maximum context length")
        || lower.contains("context_length_exceeded")
        || lower.contains("context window")
        || lower.contains("prompt is too long")
}

fn first_line(body: &str) -> &str {
    logging_preview(body.lines().next().unwrap_or(""))
}

fn logging_preview(s: &str) -> &str {
    crate::logging::truncate(s, 200)
}
