//! Streamable-HTTP transport: one JSON-RPC POST per request.
//!
//! There is no persistent channel; "reconnection" is per-request. The server
//! may hand back an `Mcp-Session-Id` header on `initialize`, which is echoed
//! on every later request and released with a DELETE on close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use super::{TransportEvent, UpstreamClient};
use crate::error::{McpError, McpResult};
use crate::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ToolCallResult, ToolDescriptor, ToolsCallParams, ToolsListResult,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST,
};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Upstream client over request/response HTTP.
pub struct HttpStreamClient {
    url: String,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    session_id: StdMutex<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    // Kept so subscribe_events can hand out receivers; never fires.
    events: broadcast::Sender<TransportEvent>,
}

impl HttpStreamClient {
    pub fn new(url: &str, headers: HashMap<String, String>) -> McpResult<Self> {
        url::Url::parse(url)
            .map_err(|e| McpError::configuration(format!("invalid URL '{}': {}", url, e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::configuration(format!("failed to build HTTP client: {}", e)))?;

        let (events, _) = broadcast::channel(1);
        Ok(Self {
            url: url.to_string(),
            headers,
            http,
            session_id: StdMutex::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            events,
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session id lock poisoned").clone()
    }

    async fn post(&self, message: &JsonRpcRequest) -> McpResult<Option<JsonRpcResponse>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }

        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(message);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await?;
        let status = response.status();

        // The server assigns a session on initialize; remember it.
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().expect("session id lock poisoned") = Some(session.to_string());
        }

        if !status.is_success() {
            return Err(McpError::transport(format!(
                "request to '{}' returned {}",
                self.url, status
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await?;

        if message.is_notification() || body.trim().is_empty() {
            return Ok(None);
        }

        // Servers may answer a single POST with an event-stream body; the
        // response is the first data frame.
        let payload = if content_type.starts_with("text/event-stream") {
            extract_first_data_frame(&body).ok_or_else(|| {
                McpError::protocol("event-stream response carried no data frame".to_string())
            })?
        } else {
            body
        };

        let response: JsonRpcResponse = serde_json::from_str(&payload)
            .map_err(|e| McpError::protocol(format!("invalid response body: {}", e)))?;
        Ok(Some(response))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::numbered(method, params, id);
        let expected_key = request.id_key().expect("numbered request has an id");

        let response = self
            .post(&request)
            .await?
            .ok_or_else(|| McpError::protocol("server returned no response body"))?;

        // A stateless server still has to echo the id it was given.
        if response.id_key().as_deref() != Some(expected_key.as_str()) {
            return Err(McpError::protocol(format!(
                "response id mismatch (expected {})",
                expected_key
            )));
        }

        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

/// Pull the first `data:` payload out of an SSE-formatted body.
fn extract_first_data_frame(body: &str) -> Option<String> {
    let mut data = String::new();
    for line in body.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim_start());
        } else if line.trim().is_empty() && !data.is_empty() {
            break;
        }
    }
    (!data.is_empty()).then_some(data)
}

#[async_trait::async_trait]
impl UpstreamClient for HttpStreamClient {
    async fn initialize(&self, client_info: ClientInfo) -> McpResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Some(client_info),
        };
        let result = self
            .request(METHOD_INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("invalid initialize result: {}", e)))?;

        let _ = self
            .post(&JsonRpcRequest::notification(METHOD_INITIALIZED, None))
            .await?;
        Ok(init)
    }

    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = self.request(METHOD_TOOLS_LIST, params).await?;
            let page: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| McpError::protocol(format!("invalid tools/list result: {}", e)))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let result = self
            .request(METHOD_TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("invalid tools/call result: {}", e)))
    }

    async fn ping(&self) -> McpResult<()> {
        self.request(METHOD_PING, None).await.map(|_| ())
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Release the server-side session if one was assigned.
        if let Some(session) = self.session_id() {
            let mut request = self.http.delete(&self.url).header(SESSION_HEADER, session);
            for (key, value) in &self.headers {
                request = request.header(key, value);
            }
            if let Err(e) = request.send().await {
                tracing::debug!("session DELETE failed: {}", e);
            }
        }
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn kind(&self) -> &'static str {
        "http-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_data_frame_extraction() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"result\":{},\"id\":1}\n\n";
        let frame = extract_first_data_frame(body).unwrap();
        assert!(frame.starts_with("{\"jsonrpc\""));

        assert_eq!(extract_first_data_frame("event: ping\n\n"), None);
    }

    #[test]
    fn multiline_data_frames_are_joined() {
        let body = "data: {\"a\":\ndata: 1}\n\ndata: ignored\n\n";
        assert_eq!(extract_first_data_frame(body).unwrap(), "{\"a\":\n1}");
    }

    #[test]
    fn new_rejects_invalid_url() {
        assert!(HttpStreamClient::new("not a url", HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn closed_client_refuses_requests() {
        let client = HttpStreamClient::new("https://example.invalid/mcp", HashMap::new()).unwrap();
        client.close().await.unwrap();
        assert!(matches!(client.ping().await, Err(McpError::Closed)));
    }
}
