//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the plugin session core.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid plugin configuration. Never retried.
    #[error("config error: {0}")]
    Config(String),

    /// Establishing a transport session failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport dropped mid-call (transient).
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The remote plugin reported a failure for a tool call.
    #[error("tool '{tool}' on plugin '{plugin}' failed: {message}")]
    Tool {
        plugin: String,
        tool: String,
        message: String,
    },

    /// A tool call exceeded its deadline. Never retried.
    #[error("tool '{tool}' on plugin '{plugin}' timed out after {timeout_ms}ms")]
    Timeout {
        plugin: String,
        tool: String,
        timeout_ms: u64,
    },

    /// No usable session exists for the key.
    #[error("no session available for {key}")]
    SessionUnavailable { key: String },

    /// Every retry attempt failed; carries the last underlying cause.
    #[error("failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// Optional transport capability not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors (config file loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification reported in per-call outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connection,
    Tool,
    Timeout,
    SessionUnavailable,
    RetriesExhausted,
    Unsupported,
    Internal,
}

impl Error {
    /// Classification used by API layers to report per-call status.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Connection(_) | Error::ConnectionClosed(_) => ErrorKind::Connection,
            Error::Tool { .. } => ErrorKind::Tool,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::SessionUnavailable { .. } => ErrorKind::SessionUnavailable,
            Error::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::NotFound(_) | Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Transport-level "connection closed" class, eligible for in-transport reconnects.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_))
    }

    /// Whether the invocation service may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::ConnectionClosed(_)
                | Error::Tool { .. }
                | Error::SessionUnavailable { .. }
        )
    }
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    pub fn tool(plugin: impl Into<String>, tool: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Tool {
            plugin: plugin.into(),
            tool: tool.into(),
            message: msg.into(),
        }
    }

    pub fn timeout(plugin: impl Into<String>, tool: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            plugin: plugin.into(),
            tool: tool.into(),
            timeout_ms,
        }
    }

    pub fn session_unavailable(key: impl std::fmt::Display) -> Self {
        Self::SessionUnavailable {
            key: key.to_string(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_not_retryable() {
        let err = Error::timeout("github", "search", 500);
        assert!(err.is_timeout());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            err.to_string(),
            "tool 'search' on plugin 'github' timed out after 500ms"
        );
    }

    #[test]
    fn test_config_is_not_retryable() {
        assert!(!Error::config("missing endpoint").is_retryable());
        assert!(Error::tool("github", "search", "boom").is_retryable());
        assert!(Error::connection_closed("eof").is_connection_closed());
    }

    #[test]
    fn test_retries_exhausted_names_last_cause() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            last: Box::new(Error::tool("github", "search", "rate limited")),
        };
        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert!(err.to_string().contains("rate limited"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
