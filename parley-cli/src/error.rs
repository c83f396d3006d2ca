//! Errors of the command line front end.

use parley::Rejection;

use crate::config::ConfigError;

/// Result type alias for CLI commands.
pub type Result<T> = std::result::Result<T, CliError>;

/// The CLI error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CliError {
    /// Loading or saving the configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The session failed.
    #[error(transparent)]
    Session(#[from] parley::Error),

    /// A request was refused before it reached a backend.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad command line usage.
    #[error("{0}")]
    Usage(String),
}

impl CliError {
    /// Create a usage error with a message.
    #[must_use]
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }
}
