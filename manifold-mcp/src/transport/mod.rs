//! Upstream transport adapters.
//!
//! Four transport families reach upstream MCP servers: child-process stdio,
//! Server-Sent Events, streamable HTTP, and an adapter that synthesizes MCP
//! tools from an OpenAPI document. All four satisfy the [`UpstreamClient`]
//! contract so the supervisor never cares which wire it is holding.

pub mod http_stream;
pub mod openapi;
pub mod sse;
pub mod stdio;

pub use http_stream::HttpStreamClient;
pub use openapi::OpenApiClient;
pub use sse::SseClient;
pub use stdio::StdioClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{McpError, McpResult};
use crate::protocol::{ClientInfo, InitializeResult, ToolCallResult, ToolDescriptor};

/// Connection parameters for one upstream, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportKind {
    /// Local child process speaking newline-delimited JSON-RPC on stdio.
    #[serde(rename = "stdio")]
    Stdio {
        command: String,

        #[serde(default)]
        args: Vec<String>,

        #[serde(default)]
        env: HashMap<String, String>,

        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },

    /// SSE event stream plus a sibling message-POST endpoint.
    #[serde(rename = "sse")]
    Sse {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Request/response JSON-RPC over HTTP, one POST per request.
    #[serde(rename = "http-stream")]
    HttpStream {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Tools synthesized from an OpenAPI v3 document.
    #[serde(rename = "openapi")]
    OpenApi {
        #[serde(rename = "specUrl")]
        spec_url: String,

        /// Overrides the document's own `servers` entry when set.
        #[serde(rename = "baseUrl", skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,

        #[serde(skip_serializing_if = "Option::is_none")]
        security: Option<OpenApiSecurity>,

        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportKind {
    /// Reject configurations that can never connect.
    pub fn validate(&self) -> McpResult<()> {
        match self {
            TransportKind::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::configuration("stdio transport requires a command"));
                }
            }
            TransportKind::Sse { url, .. }
            | TransportKind::HttpStream { url, .. }
            | TransportKind::OpenApi { spec_url: url, .. } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| McpError::configuration(format!("invalid URL '{}': {}", url, e)))?;
                match parsed.scheme() {
                    "http" | "https" => {}
                    scheme => {
                        return Err(McpError::configuration(format!(
                            "unsupported URL scheme '{}', only http and https are allowed",
                            scheme
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TransportKind::Stdio { .. } => "stdio",
            TransportKind::Sse { .. } => "sse",
            TransportKind::HttpStream { .. } => "http-stream",
            TransportKind::OpenApi { .. } => "openapi",
        }
    }

    /// Whether this transport holds a persistent channel worth pinging.
    pub fn has_persistent_channel(&self) -> bool {
        matches!(self, TransportKind::Stdio { .. } | TransportKind::Sse { .. })
    }
}

/// Authentication applied by the OpenAPI adapter to synthesized calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OpenApiSecurity {
    #[serde(rename = "apiKey")]
    ApiKey {
        name: String,
        #[serde(rename = "in")]
        location: ApiKeyLocation,
        key: String,
    },

    #[serde(rename = "bearer")]
    Bearer { token: String },

    #[serde(rename = "basic")]
    Basic { username: String, password: String },
}

/// Where an API key goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    Header,
    Query,
}

/// Out-of-band events a transport surfaces to its supervisor.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The upstream announced its tool list changed.
    ListChanged,

    /// The persistent channel is gone; the client is unusable.
    Broken { reason: String },
}

/// Uniform contract every transport adapter satisfies.
///
/// Construction (via [`connect_upstream`]) establishes the underlying
/// channel; a broken client is discarded and rebuilt by the supervisor, so
/// the methods here take `&self` and adapters keep interior state.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Perform the MCP `initialize` handshake.
    async fn initialize(&self, client_info: ClientInfo) -> McpResult<InitializeResult>;

    /// Fetch the upstream's tool catalog.
    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>>;

    /// Invoke one tool; the result is passed through verbatim.
    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult>;

    /// Liveness probe.
    async fn ping(&self) -> McpResult<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> McpResult<()>;

    /// Subscribe to out-of-band transport events.
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Transport family name, for logging.
    fn kind(&self) -> &'static str;
}

/// Build and connect the adapter matching `kind`.
///
/// `upstream_name` tags log output (notably stdio stderr forwarding).
pub async fn connect_upstream(
    upstream_name: &str,
    kind: &TransportKind,
) -> McpResult<Arc<dyn UpstreamClient>> {
    kind.validate()?;
    match kind {
        TransportKind::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            let client =
                StdioClient::spawn(upstream_name, command, args.clone(), env.clone(), cwd.clone())
                    .await?;
            Ok(Arc::new(client))
        }
        TransportKind::Sse { url, headers } => {
            let client = SseClient::connect(upstream_name, url, headers.clone()).await?;
            Ok(Arc::new(client))
        }
        TransportKind::HttpStream { url, headers } => {
            let client = HttpStreamClient::new(url, headers.clone())?;
            Ok(Arc::new(client))
        }
        TransportKind::OpenApi {
            spec_url,
            base_url,
            security,
            headers,
        } => {
            let client = OpenApiClient::fetch(
                upstream_name,
                spec_url,
                base_url.clone(),
                security.clone(),
                headers.clone(),
            )
            .await?;
            Ok(Arc::new(client))
        }
    }
}
