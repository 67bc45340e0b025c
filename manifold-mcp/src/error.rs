//! Transport- and protocol-level error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for MCP client operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors raised by transport adapters and protocol handling.
#[derive(Error, Debug)]
pub enum McpError {
    /// Transport-level failure (pipe closed, stream ended, write failed).
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Could not establish the connection in the first place.
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// The peer answered with something that is not valid MCP.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Request did not complete within the deadline.
    #[error("Timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The peer returned a JSON-RPC error object.
    #[error("Upstream error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// The adapter was configured with unusable parameters.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The transport has been closed and cannot serve requests.
    #[error("Transport closed")]
    Closed,
}

impl McpError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether the supervisor should count this failure toward degradation
    /// and retry with backoff.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            McpError::Transport { .. }
                | McpError::ConnectionFailed { .. }
                | McpError::Timeout { .. }
                | McpError::Closed
        )
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => McpError::ConnectionFailed {
                message: err.to_string(),
            },
            _ => McpError::Transport {
                message: err.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            McpError::Timeout {
                timeout: Duration::from_secs(30),
            }
        } else if err.is_connect() {
            McpError::ConnectionFailed {
                message: err.to_string(),
            }
        } else {
            McpError::Transport {
                message: err.to_string(),
            }
        }
    }
}
