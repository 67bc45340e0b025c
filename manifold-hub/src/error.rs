//! Hub-level error taxonomy and its JSON-RPC wire mapping.

use std::time::Duration;

use manifold_mcp::protocol::JsonRpcError;
use manifold_mcp::McpError;
use thiserror::Error;

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Failures the hub reports to downstream clients and operators.
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// Settings were rejected; never reaches downstream clients.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The requested upstream is not in the ready state.
    #[error("Upstream '{upstream}' is unavailable")]
    UpstreamUnavailable { upstream: String },

    /// The per-call deadline elapsed.
    #[error("Upstream '{upstream}' timed out after {timeout:?}")]
    UpstreamTimeout { upstream: String, timeout: Duration },

    /// The upstream answered with malformed MCP.
    #[error("Upstream '{upstream}' protocol error: {message}")]
    UpstreamProtocol { upstream: String, message: String },

    /// The upstream returned a JSON-RPC error; passed through verbatim.
    #[error("Upstream error {code}: {message}")]
    UpstreamError { code: i32, message: String },

    /// The client asked for an MCP method the hub does not implement.
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    /// The effective name does not map in the current session view.
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    /// The tool exists but is filtered out by scope or principal.
    #[error("Tool not allowed: {name}")]
    ToolNotAllowed { name: String },

    /// The requested group or upstream does not exist or is invisible.
    #[error("Scope not found: {scope}")]
    ScopeNotFound { scope: String },

    /// Stale or unknown session id.
    #[error("Session not found: {session}")]
    SessionNotFound { session: String },

    /// The principal lacks permission for the scope.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Smart search failed because the embedder is down.
    #[error("Embedder unavailable: {message}")]
    EmbedderUnavailable { message: String },

    /// Request or response failed to (de)serialize.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Anything that should not happen.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HubError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn upstream_unavailable(upstream: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            upstream: upstream.into(),
        }
    }

    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound { name: name.into() }
    }

    pub fn tool_not_allowed(name: impl Into<String>) -> Self {
        Self::ToolNotAllowed { name: name.into() }
    }

    pub fn scope_not_found(scope: impl Into<String>) -> Self {
        Self::ScopeNotFound {
            scope: scope.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable kind string carried in `error.data.kind` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Configuration { .. } => "configuration_error",
            HubError::UpstreamUnavailable { .. } => "upstream_unavailable",
            HubError::UpstreamTimeout { .. } => "upstream_timeout",
            HubError::UpstreamProtocol { .. } => "upstream_protocol_error",
            HubError::UpstreamError { .. } => "upstream_error",
            HubError::MethodNotFound { .. } => "method_not_found",
            HubError::ToolNotFound { .. } => "tool_not_found",
            HubError::ToolNotAllowed { .. } => "tool_not_allowed",
            HubError::ScopeNotFound { .. } => "scope_not_found",
            HubError::SessionNotFound { .. } => "session_not_found",
            HubError::Unauthorized { .. } => "unauthorized",
            HubError::EmbedderUnavailable { .. } => "embedder_unavailable",
            HubError::Serialization { .. } => "serialization_error",
            HubError::Internal { .. } => "internal_error",
        }
    }

    /// Wire representation: a JSON-RPC error with the kind in `data`.
    pub fn jsonrpc_error(&self) -> JsonRpcError {
        let code = match self {
            HubError::UpstreamError { code, .. } => *code,
            HubError::MethodNotFound { .. } | HubError::ToolNotFound { .. } => -32601,
            HubError::Serialization { .. } => -32602,
            _ => -32000,
        };
        JsonRpcError::new(
            code,
            self.to_string(),
            Some(serde_json::json!({ "kind": self.kind() })),
        )
    }

    /// Attribute a transport-layer failure to a named upstream.
    pub fn from_upstream(upstream: &str, err: McpError) -> Self {
        match err {
            McpError::Timeout { timeout } => HubError::UpstreamTimeout {
                upstream: upstream.to_string(),
                timeout,
            },
            McpError::Rpc { code, message } => HubError::UpstreamError { code, message },
            McpError::Protocol { message } | McpError::Serialization { message } => {
                HubError::UpstreamProtocol {
                    upstream: upstream.to_string(),
                    message,
                }
            }
            McpError::Transport { .. }
            | McpError::ConnectionFailed { .. }
            | McpError::Closed => HubError::UpstreamUnavailable {
                upstream: upstream.to_string(),
            },
            McpError::Configuration { message } => HubError::Configuration { message },
        }
    }
}
