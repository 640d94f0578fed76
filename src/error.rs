// src/error.rs

use thiserror::Error;

/// A query string that does not follow the filter grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ill-formed query at offset {offset}: {message}")]
pub struct CompileError {
    /// Byte offset into the trimmed query where parsing stopped.
    pub offset: usize,
    pub message: String,
}

impl CompileError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Failures surfaced by the connector core.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Missing offer or credential. A normal outcome, reported rather than raised.
    #[error("not found: {0}")]
    NotFound(String),

    /// The dataspace API returned a failure status, timed out or was unreachable.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Writing the workspace failed; nothing half-written was left behind.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The offer is missing something a transfer needs.
    #[error("Invalid KIT format: {0}")]
    InvalidKit(String),

    /// A well-formed offer this connector cannot transfer (unknown kit or asset type).
    #[error("{0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    InvalidQuery(#[from] CompileError),
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ConnectorError::Upstream(format!("request timed out: {}", e))
        } else {
            ConnectorError::Upstream(format!("HTTP request failed: {}", e))
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(e: std::io::Error) -> Self {
        ConnectorError::Persistence(e.to_string())
    }
}
