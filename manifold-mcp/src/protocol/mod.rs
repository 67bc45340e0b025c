//! MCP protocol types: JSON-RPC 2.0 framing plus the message family the hub
//! exchanges with upstreams and downstreams.

pub mod jsonrpc;
pub mod messages;

pub use jsonrpc::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
pub use messages::{
    ClientCapabilities, ClientInfo, EmbeddedResource, InitializeParams, InitializeResult,
    ServerCapabilities, ServerInfo, ToolCallResult, ToolContent, ToolDescriptor, ToolsCallParams,
    ToolsCapability, ToolsListResult, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, NOTIFICATION_TOOLS_LIST_CHANGED,
};

/// Protocol revision the hub speaks natively.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// Protocol revisions the hub accepts from clients and upstreams.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05", "2024-10-07"];

/// Pick the protocol version to answer an `initialize` with.
///
/// A version we support is echoed back; anything else gets our latest.
pub fn negotiate_protocol_version(requested: &str) -> String {
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
        requested.to_string()
    } else {
        LATEST_PROTOCOL_VERSION.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_echoes_supported_versions() {
        assert_eq!(negotiate_protocol_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_protocol_version("2025-03-26"), "2025-03-26");
    }

    #[test]
    fn negotiate_falls_back_to_latest() {
        assert_eq!(negotiate_protocol_version("1999-01-01"), LATEST_PROTOCOL_VERSION);
    }
}
