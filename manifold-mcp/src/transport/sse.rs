//! SSE transport: an event stream for server messages plus a sibling POST
//! endpoint for client messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{TransportEvent, UpstreamClient};
use crate::error::{McpError, McpResult};
use crate::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ToolCallResult, ToolDescriptor, ToolsCallParams, ToolsListResult,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST, NOTIFICATION_TOOLS_LIST_CHANGED,
};

const ENDPOINT_WAIT: Duration = Duration::from_secs(15);

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// One parsed SSE event.
#[derive(Debug)]
struct SseEvent {
    name: String,
    data: String,
}

/// Upstream client over Server-Sent Events.
///
/// The server's first `endpoint` event names the URL client messages are
/// POSTed to; every later `message` event is a JSON-RPC frame correlated back
/// to its caller by id. Stream end surfaces as [`TransportEvent::Broken`].
pub struct SseClient {
    name: String,
    http: reqwest::Client,
    headers: HashMap<String, String>,
    message_url: String,
    pending: PendingMap,
    events: broadcast::Sender<TransportEvent>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseClient {
    /// Open the event stream and wait for the `endpoint` handshake.
    pub async fn connect(name: &str, url: &str, headers: HashMap<String, String>) -> McpResult<Self> {
        let base = url::Url::parse(url)
            .map_err(|e| McpError::configuration(format!("invalid SSE URL '{}': {}", url, e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::configuration(format!("failed to build HTTP client: {}", e)))?;

        let mut request = http
            .get(base.clone())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        for (key, value) in &headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            McpError::connection_failed(format!("SSE connect to '{}' failed: {}", url, e))
        })?;
        if !response.status().is_success() {
            return Err(McpError::connection_failed(format!(
                "SSE connect to '{}' returned {}",
                url,
                response.status()
            )));
        }

        let (event_tx, mut event_rx) = mpsc::channel::<SseEvent>(64);
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(16);

        let parser = tokio::spawn(parse_sse_stream(Box::pin(response.bytes_stream()), event_tx));

        // The endpoint event must arrive before anything can be sent.
        let endpoint = tokio::time::timeout(ENDPOINT_WAIT, async {
            while let Some(event) = event_rx.recv().await {
                if event.name == "endpoint" {
                    return Some(event.data);
                }
            }
            None
        })
        .await
        .map_err(|_| McpError::connection_failed("timed out waiting for SSE endpoint event"))?
        .ok_or_else(|| McpError::connection_failed("SSE stream ended before endpoint event"))?;

        let message_url = base
            .join(endpoint.trim())
            .map_err(|e| McpError::protocol(format!("invalid endpoint event '{}': {}", endpoint, e)))?
            .to_string();

        let reader = tokio::spawn(route_events(
            name.to_string(),
            event_rx,
            parser,
            Arc::clone(&pending),
            events.clone(),
        ));

        Ok(Self {
            name: name.to_string(),
            http,
            headers,
            message_url,
            pending,
            events,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn post_message(&self, message: &JsonRpcRequest) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }

        let mut request = self
            .http
            .post(&self.message_url)
            .header("Content-Type", "application/json")
            .json(message);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(McpError::transport(format!(
                "message POST returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::numbered(method, params, id);
        let key = request.id_key().expect("numbered request has an id");

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(key.clone(), tx);

        if let Err(e) = self.post_message(&request).await {
            self.pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&key);
            return Err(e);
        }

        let response = rx.await.map_err(|_| {
            McpError::transport(format!("SSE stream for '{}' ended before response", self.name))
        })?;

        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

/// Split the raw byte stream into SSE events (blank-line separated blocks of
/// `event:`/`data:` lines) and feed them to the router.
async fn parse_sse_stream(
    mut stream: impl futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
    events: mpsc::Sender<SseEvent>,
) {
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        buffer.push_str(text);

        while let Some(end) = buffer.find("\n\n") {
            let block = buffer[..end].to_string();
            buffer.drain(..end + 2);

            let mut name = String::from("message");
            let mut data = String::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    name = value.trim().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(value.trim_start());
                }
            }

            if data.is_empty() || data == "keep-alive" {
                continue;
            }
            if events.send(SseEvent { name, data }).await.is_err() {
                return;
            }
        }
    }
}

/// Route parsed events: responses to their pending callers, list-changed
/// notifications to subscribers. Ends when the stream does.
async fn route_events(
    name: String,
    mut event_rx: mpsc::Receiver<SseEvent>,
    parser: JoinHandle<()>,
    pending: PendingMap,
    events: broadcast::Sender<TransportEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        if event.name != "message" {
            tracing::debug!(upstream = %name, event = %event.name, "ignoring SSE event");
            continue;
        }

        let value: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(upstream = %name, "discarding unparseable SSE frame: {}", e);
                continue;
            }
        };

        if value.get("method").is_some() {
            if let Ok(request) = serde_json::from_value::<JsonRpcRequest>(value) {
                if request.method == NOTIFICATION_TOOLS_LIST_CHANGED {
                    let _ = events.send(TransportEvent::ListChanged);
                }
            }
            continue;
        }

        if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) {
            let Some(key) = response.id_key() else { continue };
            if let Some(tx) = pending.lock().expect("pending map lock poisoned").remove(&key) {
                let _ = tx.send(response);
            }
        }
    }

    parser.abort();
    pending.lock().expect("pending map lock poisoned").clear();
    let _ = events.send(TransportEvent::Broken {
        reason: "SSE stream ended".to_string(),
    });
}

#[async_trait::async_trait]
impl UpstreamClient for SseClient {
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

        self.post_message(&JsonRpcRequest::notification(METHOD_INITIALIZED, None))
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
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.pending.lock().expect("pending map lock poisoned").clear();
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn kind(&self) -> &'static str {
        "sse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn byte_chunks(parts: &[&str]) -> impl futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin {
        let owned: Vec<Result<bytes::Bytes, reqwest::Error>> = parts
            .iter()
            .map(|p| Ok(bytes::Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn parser_assembles_events_across_chunk_boundaries() {
        let (tx, mut rx) = mpsc::channel(8);
        let stream = byte_chunks(&[
            "event: endpoint\ndata: /messages?sessionId=abc\n",
            "\nevent: message\ndata: {\"jsonrpc\":\"2.0\",",
            "\"result\":{},\"id\":1}\n\n",
        ]);
        parse_sse_stream(stream, tx).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "endpoint");
        assert_eq!(first.data, "/messages?sessionId=abc");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.name, "message");
        assert!(second.data.contains("\"id\":1"));
    }

    #[tokio::test]
    async fn parser_skips_keepalive_data() {
        let (tx, mut rx) = mpsc::channel(8);
        let stream = byte_chunks(&["data: keep-alive\n\nevent: message\ndata: {}\n\n"]);
        parse_sse_stream(stream, tx).await;

        let only = rx.recv().await.unwrap();
        assert_eq!(only.name, "message");
        assert_eq!(only.data, "{}");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_rejects_bad_url() {
        let result = SseClient::connect("bad", "not a url", HashMap::new()).await;
        assert!(matches!(result, Err(McpError::Configuration { .. })));
    }
}
