//! MCP wire protocol and upstream transport adapters.
//!
//! This crate carries the pieces of the Model Context Protocol the hub
//! actually speaks: JSON-RPC 2.0 framing, the `initialize`/`tools/*` message
//! family, and four upstream transport adapters (child-process stdio, SSE,
//! streamable HTTP, and OpenAPI-synthesized) unified behind the
//! [`UpstreamClient`] contract.

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{McpError, McpResult};
pub use protocol::{
    ClientInfo, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ServerInfo,
    ToolCallResult, ToolContent, ToolDescriptor,
};
pub use transport::{TransportEvent, TransportKind, UpstreamClient, connect_upstream};
