//! Unified error types for parley.
//!
//! This module provides the error hierarchy covering:
//! - Server-side rejections that travel over the session channel ([`Rejection`])
//! - Completion backend failures ([`BackendError`])
//! - Channel, configuration and I/O failures
//!
//! Malformed model output is deliberately absent: the extractor degrades to a
//! raw-text record instead of raising, and a missing stop marker only means the
//! stream has not finished yet.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::turn::TurnId;

/// Result type alias for parley operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for parley.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The server refused a request.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// Completion backend error.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The session channel closed before the operation finished.
    #[error("Session channel connection lost")]
    ConnectionLost,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error.
    #[cfg(feature = "openai")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a configuration error with a message.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns the rejection if the server refused the request.
    #[must_use]
    pub const fn as_rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// Returns `true` if this error is a closed-gate rejection.
    #[must_use]
    pub const fn is_gate_closed(&self) -> bool {
        matches!(self, Self::Rejected(Rejection::GateClosed))
    }

    /// Returns `true` if this error is a follow-up position conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Rejected(Rejection::OutOfOrderFollowUp { .. }))
    }
}

/// A refusal issued by the session server.
///
/// Rejections are serializable because they travel back to the client inside
/// `error` events and out-of-band replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Rejection {
    /// A follow-up slot was requested with a stale position token.
    #[error(
        "follow-up for thread {root_id} expected at position {expected}, but the thread has {actual} follow-ups"
    )]
    OutOfOrderFollowUp {
        /// Root of the thread.
        root_id: TurnId,
        /// Position the client presented.
        expected: usize,
        /// Actual follow-up count on the server.
        actual: usize,
    },

    /// A new root turn was requested while the previous turn awaits feedback.
    #[error("the previous answer must be completed and rated before asking a new question")]
    GateClosed,

    /// No turn with this id exists.
    #[error("unknown turn {0}")]
    UnknownTurn(TurnId),

    /// No thread is rooted at this id.
    #[error("unknown thread {0}")]
    UnknownThread(TurnId),

    /// A turn with this id was already started.
    #[error("turn {0} already exists")]
    DuplicateTurn(TurnId),

    /// Feedback was submitted for a turn that has not completed.
    #[error("turn {0} has not completed yet")]
    NotCompleted(TurnId),

    /// The task input is missing a required field.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Rejection {
    /// Create an invalid input rejection.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Error type for completion backend operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BackendError {
    /// The error kind.
    pub kind: BackendErrorKind,
    /// The backend name (e.g., "openai", "scripted").
    pub backend: Option<String>,
    /// Additional error message.
    pub message: String,
    /// Optional status code reported by the backend.
    pub code: Option<String>,
}

/// Categories of backend errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendErrorKind {
    /// Authentication or authorization failure.
    Auth,
    /// Rate limit exceeded.
    RateLimited,
    /// Network or connection error.
    Network,
    /// Error while reading the token stream.
    Stream,
    /// Non-success HTTP status.
    HttpStatus,
    /// Response body did not have the expected shape.
    ResponseFormat,
    /// Backend-specific error.
    Provider,
}

impl BackendError {
    const fn with_kind(kind: BackendErrorKind, message: String) -> Self {
        Self {
            kind,
            backend: None,
            message,
            code: None,
        }
    }

    /// Create an authentication error.
    #[must_use]
    pub fn auth(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: Some(backend.into()),
            ..Self::with_kind(BackendErrorKind::Auth, message.into())
        }
    }

    /// Create a rate limit error.
    #[must_use]
    pub fn rate_limited(backend: impl Into<String>) -> Self {
        Self {
            backend: Some(backend.into()),
            ..Self::with_kind(
                BackendErrorKind::RateLimited,
                "Rate limit exceeded. Please retry after some time.".into(),
            )
        }
    }

    /// Create a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::with_kind(BackendErrorKind::Network, message.into())
    }

    /// Create a streaming error.
    #[must_use]
    pub fn stream(message: impl Into<String>) -> Self {
        Self::with_kind(BackendErrorKind::Stream, message.into())
    }

    /// Create an HTTP status error.
    #[must_use]
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            code: Some(status.to_string()),
            ..Self::with_kind(
                BackendErrorKind::HttpStatus,
                format!("HTTP {status}: {}", body.into()),
            )
        }
    }

    /// Create a response format error.
    #[must_use]
    pub fn response_format(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::with_kind(
            BackendErrorKind::ResponseFormat,
            format!("Expected {}, got {}", expected.into(), got.into()),
        )
    }

    /// Create a backend-specific error.
    #[must_use]
    pub fn provider(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: Some(backend.into()),
            ..Self::with_kind(BackendErrorKind::Provider, message.into())
        }
    }

    /// Check if this is a retryable error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::RateLimited | BackendErrorKind::Network
        )
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(backend) = &self.backend {
            write!(f, "[{backend}] ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for BackendError {}

#[cfg(feature = "openai")]
impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out")
        } else if err.is_connect() {
            Self::network(format!("Connection failed: {err}"))
        } else {
            Self::network(err.to_string())
        }
    }
}
