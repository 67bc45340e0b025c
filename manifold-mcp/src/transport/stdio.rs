//! Child-process transport speaking newline-delimited JSON-RPC on stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{TransportEvent, UpstreamClient};
use crate::error::{McpError, McpResult};
use crate::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ToolCallResult, ToolDescriptor, ToolsCallParams, ToolsListResult,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST, NOTIFICATION_TOOLS_LIST_CHANGED,
};

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// Upstream client over a spawned child process.
///
/// A reader task owns the child's stdout and correlates responses to callers
/// by request id; stderr lines are forwarded to the log tagged with the
/// upstream name. Child exit fails every pending call and emits
/// [`TransportEvent::Broken`].
pub struct StdioClient {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    pending: PendingMap,
    events: broadcast::Sender<TransportEvent>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioClient {
    /// Spawn the configured command and wire up its stdio.
    pub async fn spawn(
        name: &str,
        command: &str,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    ) -> McpResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(&args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection_failed(format!("failed to spawn '{}': {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::transport("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::transport("child stderr unavailable"))?;

        let (events, _) = broadcast::channel(16);
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));

        // Forward child stderr into the log, tagged with the upstream name.
        let stderr_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(upstream = %stderr_name, "{}", line);
            }
        });

        let reader = tokio::spawn(read_loop(
            name.to_string(),
            BufReader::new(stdout),
            Arc::clone(&pending),
            events.clone(),
        ));

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(BufWriter::new(stdin))),
            pending,
            events,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn write_message(&self, message: &JsonRpcRequest) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }

        let line = serde_json::to_string(message)?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpError::Closed)?;

        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
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

        if let Err(e) = self.write_message(&request).await {
            self.pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&key);
            return Err(e);
        }

        let response = rx.await.map_err(|_| {
            McpError::transport(format!("upstream '{}' closed before responding", self.name))
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

/// Read stdout lines, routing responses to pending callers and notifications
/// to the event channel. Runs until the child closes stdout.
async fn read_loop(
    name: String,
    mut stdout: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    events: broadcast::Sender<TransportEvent>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match stdout.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(upstream = %name, "stdout read failed: {}", e);
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(upstream = %name, "discarding unparseable frame: {}", e);
                continue;
            }
        };

        if value.get("method").is_some() {
            if let Ok(request) = serde_json::from_value::<JsonRpcRequest>(value) {
                if request.method == NOTIFICATION_TOOLS_LIST_CHANGED {
                    let _ = events.send(TransportEvent::ListChanged);
                } else {
                    tracing::debug!(upstream = %name, method = %request.method,
                        "ignoring server-initiated message");
                }
            }
            continue;
        }

        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => {
                let Some(key) = response.id_key() else {
                    continue;
                };
                let sender = pending.lock().expect("pending map lock poisoned").remove(&key);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(upstream = %name, id = %key, "dropping uncorrelated response");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(upstream = %name, "discarding malformed response: {}", e);
            }
        }
    }

    // Dropping the senders fails every waiter with a transport error.
    pending.lock().expect("pending map lock poisoned").clear();
    let _ = events.send(TransportEvent::Broken {
        reason: "child process closed stdout".to_string(),
    });
}

#[async_trait::async_trait]
impl UpstreamClient for StdioClient {
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

        self.write_message(&JsonRpcRequest::notification(METHOD_INITIALIZED, None))
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

        // Closing stdin asks the child to exit on its own.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(upstream = %self.name, "failed to kill child: {}", e);
                    }
                    let _ = child.wait().await;
                }
                Err(e) => {
                    tracing::warn!(upstream = %self.name, "child status check failed: {}", e);
                }
            }
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
        "stdio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_rejects_missing_binary() {
        let result = StdioClient::spawn(
            "ghost",
            "/nonexistent/definitely-not-a-binary",
            vec![],
            HashMap::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(McpError::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn child_exit_fails_pending_calls() {
        // `true` exits immediately without ever answering.
        let client = StdioClient::spawn("flaky", "true", vec![], HashMap::new(), None)
            .await
            .expect("spawn should succeed");

        let mut events = client.subscribe_events();
        let result = client.ping().await;
        assert!(result.is_err());

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("event should arrive")
            .expect("channel open");
        assert!(matches!(event, TransportEvent::Broken { .. }));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = StdioClient::spawn("cat", "cat", vec![], HashMap::new(), None)
            .await
            .expect("spawn should succeed");
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(client.ping().await, Err(McpError::Closed)));
    }
}
