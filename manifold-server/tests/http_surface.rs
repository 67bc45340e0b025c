//! In-process exercises of the HTTP surface: streamable-HTTP session
//! handshakes, stateless requests, scope errors, and health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use manifold_config::{ManifoldConfig, Settings, UpstreamSpec};
use manifold_hub::ClientFactory;
use manifold_mcp::protocol::{
    InitializeResult, JsonRpcResponse, ServerCapabilities, ServerInfo, ToolDescriptor,
    LATEST_PROTOCOL_VERSION,
};
use manifold_mcp::transport::{TransportEvent, TransportKind, UpstreamClient};
use manifold_mcp::{McpError, McpResult, ToolCallResult};
use manifold_server::Hub;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower::ServiceExt;

struct StaticClient {
    tools: Vec<ToolDescriptor>,
    events: broadcast::Sender<TransportEvent>,
}

#[async_trait::async_trait]
impl UpstreamClient for StaticClient {
    async fn initialize(&self, _info: manifold_mcp::ClientInfo) -> McpResult<InitializeResult> {
        Ok(InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::tools_only(),
            server_info: ServerInfo {
                name: "static".into(),
                version: "1.0".into(),
            },
        })
    }

    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> McpResult<ToolCallResult> {
        Ok(ToolCallResult::text(format!("called {}", name)))
    }

    async fn ping(&self) -> McpResult<()> {
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}

#[derive(Default)]
struct StaticFactory {
    tools: Mutex<HashMap<String, Vec<ToolDescriptor>>>,
}

#[async_trait::async_trait]
impl ClientFactory for StaticFactory {
    async fn connect(&self, spec: &UpstreamSpec) -> McpResult<Arc<dyn UpstreamClient>> {
        let tools = self
            .tools
            .lock()
            .unwrap()
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| McpError::connection_failed("unknown upstream"))?;
        let (events, _) = broadcast::channel(4);
        Ok(Arc::new(StaticClient { tools, events }))
    }
}

async fn start_hub() -> Hub {
    let factory = StaticFactory::default();
    factory.tools.lock().unwrap().insert(
        "echo".to_string(),
        vec![ToolDescriptor::new(
            "echo",
            "echoes input",
            json!({"type": "object"}),
        )],
    );

    let mut config = ManifoldConfig::default();
    config.settings = Settings {
        upstreams: vec![UpstreamSpec::new(
            "echo",
            TransportKind::Stdio {
                command: "/bin/cat".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
        )],
        ..Default::default()
    };

    let hub = Hub::start_with(config, Arc::new(factory), None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.state.catalog.version() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("catalog should populate");
    hub
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: http::Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn initialize_body() -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "0.0.1" }
        },
        "id": 1
    })
}

#[tokio::test]
async fn initialize_assigns_a_session_and_lists_tools() {
    let hub = start_hub().await;
    let app = hub.router();

    let response = app
        .clone()
        .oneshot(post_json("/mcp", initialize_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("Mcp-Session-Id")
        .expect("session header")
        .to_str()
        .unwrap()
        .to_string();

    let body = body_json(response).await;
    assert_eq!(body["result"]["serverInfo"]["name"], "manifold");
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(body["result"]["capabilities"]["tools"]["listChanged"], true);

    let mut list = post_json("/mcp", json!({"jsonrpc": "2.0", "method": "tools/list", "id": 2}));
    list.headers_mut()
        .insert("Mcp-Session-Id", session_id.parse().unwrap());
    let response = app.clone().oneshot(list).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"]["tools"][0]["name"], "echo");

    // DELETE closes the session; reuse then fails.
    let mut del = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .body(Body::empty())
        .unwrap();
    del.headers_mut()
        .insert("Mcp-Session-Id", session_id.parse().unwrap());
    let response = app.clone().oneshot(del).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut reuse = post_json("/mcp", json!({"jsonrpc": "2.0", "method": "ping", "id": 3}));
    reuse
        .headers_mut()
        .insert("Mcp-Session-Id", session_id.parse().unwrap());
    let response = app.oneshot(reuse).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["data"]["kind"], "session_not_found");

    hub.shutdown().await;
}

#[tokio::test]
async fn stateless_requests_work_without_a_session() {
    let hub = start_hub().await;
    let app = hub.router();

    let response = app
        .clone()
        .oneshot(post_json(
            "/mcp/echo",
            json!({"jsonrpc": "2.0", "method": "tools/list", "id": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"]["tools"][0]["name"], "echo");

    let response = app
        .oneshot(post_json(
            "/mcp/echo",
            json!({
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": { "name": "echo", "arguments": {} },
                "id": 2
            }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let result: ToolCallResult = serde_json::from_value(body["result"].clone()).unwrap();
    assert!(!result.is_error);

    hub.shutdown().await;
}

#[tokio::test]
async fn unknown_scope_is_a_404() {
    let hub = start_hub().await;
    let app = hub.router();

    let response = app
        .oneshot(post_json("/mcp/ghost", initialize_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    let parsed: JsonRpcResponse = serde_json::from_value(body).unwrap();
    assert_eq!(
        parsed.error.unwrap().data.unwrap()["kind"],
        "scope_not_found"
    );

    hub.shutdown().await;
}

#[tokio::test]
async fn get_mcp_reports_scope_info() {
    let hub = start_hub().await;
    let app = hub.router();

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/mcp/echo")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["serverInfo"]["name"], "manifold");
    assert_eq!(body["scope"], "upstream:echo");
    assert_eq!(body["toolCount"], 1);

    hub.shutdown().await;
}

#[tokio::test]
async fn health_reports_upstream_states() {
    let hub = start_hub().await;
    let app = hub.router();

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["upstreams"][0]["name"], "echo");
    assert_eq!(body["upstreams"][0]["state"], "ready");

    hub.shutdown().await;
}
