//! The downstream request router: MCP methods, tool namespacing, and the
//! smart-group meta-tools.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use manifold_hub::catalog::EffectiveTool;
use manifold_hub::resolver::{self, RouteScope};
use manifold_hub::{HubError, HubResult, Principal};
use manifold_mcp::protocol::{
    negotiate_protocol_version, InitializeParams, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ServerCapabilities, ToolDescriptor, ToolsCallParams,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    NOTIFICATION_TOOLS_LIST_CHANGED,
};
use manifold_mcp::{ToolCallResult, ToolContent};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app::HubState;
use crate::session::{Session, SessionView};

/// Smart-scope synthetic tool names.
pub const SEARCH_TOOLS: &str = "search_tools";
pub const CALL_TOOL: &str = "call_tool";

const DEFAULT_SEARCH_K: usize = 10;
const DEFAULT_SEARCH_THRESHOLD: f64 = 0.7;
const NOTIFY_COALESCE: Duration = Duration::from_millis(100);

/// Who is asking, and through what binding.
pub struct RequestContext {
    pub session: Option<Arc<Session>>,
    pub scope: RouteScope,
    pub principal: Principal,
}

impl RequestContext {
    pub fn for_session(session: Arc<Session>) -> Self {
        Self {
            scope: session.scope.clone(),
            principal: session.principal.clone(),
            session: Some(session),
        }
    }

    pub fn stateless(scope: RouteScope, principal: Principal) -> Self {
        Self {
            session: None,
            scope,
            principal,
        }
    }
}

/// Handle one downstream JSON-RPC message.
///
/// `None` means no response goes back: the message was a notification, or
/// the call was cancelled by session close (the client must never see a
/// response for that id).
pub async fn handle_request(
    state: &HubState,
    ctx: &RequestContext,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    if let Some(session) = &ctx.session {
        session.touch();
    }

    if request.is_notification() {
        if request.method != METHOD_INITIALIZED {
            tracing::debug!(method = %request.method, "ignoring notification");
        }
        return None;
    }

    let id = request.id.clone();
    match process(state, ctx, request).await {
        Ok(Some(value)) => Some(JsonRpcResponse::success(value, id)),
        Ok(None) => None,
        Err(e) => Some(JsonRpcResponse::failure(e.jsonrpc_error(), id)),
    }
}

async fn process(
    state: &HubState,
    ctx: &RequestContext,
    request: JsonRpcRequest,
) -> HubResult<Option<Value>> {
    match request.method.as_str() {
        METHOD_INITIALIZE => {
            let requested = request
                .params
                .as_ref()
                .and_then(|p| serde_json::from_value::<InitializeParams>(p.clone()).ok())
                .map(|p| p.protocol_version)
                .unwrap_or_default();
            let result = InitializeResult {
                protocol_version: negotiate_protocol_version(&requested),
                capabilities: ServerCapabilities::tools_only(),
                server_info: state.server_info.clone(),
            };
            Ok(Some(serde_json::to_value(result).map_err(to_serialization)?))
        }

        METHOD_PING => Ok(Some(json!({}))),

        METHOD_TOOLS_LIST => {
            let view = render_view(state, &ctx.scope, &ctx.principal, true)?;
            let tools = view.tools.clone();
            if let Some(session) = &ctx.session {
                session.set_view(view);
            }
            Ok(Some(json!({ "tools": tools })))
        }

        METHOD_TOOLS_CALL => {
            let params: ToolsCallParams = request
                .params
                .map(serde_json::from_value)
                .transpose()
                .map_err(to_serialization)?
                .ok_or_else(|| HubError::Serialization {
                    message: "tools/call requires params".to_string(),
                })?;
            let arguments = params.arguments.unwrap_or_else(|| json!({}));

            let result = if ctx.scope == RouteScope::Smart {
                smart_call(state, ctx, &params.name, arguments).await?
            } else {
                plain_call(state, ctx, &params.name, arguments).await?
            };
            match result {
                Some(result) => Ok(Some(serde_json::to_value(result).map_err(to_serialization)?)),
                None => Ok(None),
            }
        }

        other => Err(HubError::MethodNotFound {
            method: other.to_string(),
        }),
    }
}

fn to_serialization(e: serde_json::Error) -> HubError {
    HubError::Serialization {
        message: e.to_string(),
    }
}

/// `tools/call` under a non-smart scope.
async fn plain_call(
    state: &HubState,
    ctx: &RequestContext,
    effective_name: &str,
    arguments: Value,
) -> HubResult<Option<ToolCallResult>> {
    let current_version = state.catalog.version();

    // Reuse the session's recorded map while it matches the live catalog;
    // anything else (stateless requests included) re-renders.
    let view = match ctx
        .session
        .as_ref()
        .and_then(|s| s.view())
        .filter(|v| v.catalog_version == current_version)
    {
        Some(view) => view,
        None => {
            let view = render_view(state, &ctx.scope, &ctx.principal, true)?;
            if let Some(session) = &ctx.session {
                session.set_view(view.clone());
            }
            view
        }
    };

    let Some((upstream, tool)) = view.name_map.get(effective_name).cloned() else {
        // Distinguish "filtered out" from "does not exist": redo the render
        // without the allowlist.
        let unfiltered = render_view(state, &ctx.scope, &ctx.principal, false)?;
        return if unfiltered.name_map.contains_key(effective_name) {
            Err(HubError::tool_not_allowed(effective_name))
        } else {
            Err(HubError::tool_not_found(effective_name))
        };
    };

    dispatch(state, ctx, &upstream, &tool, arguments).await
}

/// `tools/call` under the smart scope: only the two meta-tools exist.
async fn smart_call(
    state: &HubState,
    ctx: &RequestContext,
    name: &str,
    arguments: Value,
) -> HubResult<Option<ToolCallResult>> {
    match name {
        SEARCH_TOOLS => {
            let index = state.vector.as_ref().ok_or_else(|| HubError::EmbedderUnavailable {
                message: "smart routing is not enabled".to_string(),
            })?;

            let query = arguments
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| HubError::Serialization {
                    message: "search_tools requires a 'query' string".to_string(),
                })?
                .to_string();
            let k = arguments
                .get("k")
                .and_then(Value::as_u64)
                .map(|k| k as usize)
                .unwrap_or(DEFAULT_SEARCH_K);
            let threshold = arguments
                .get("threshold")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_SEARCH_THRESHOLD);

            let settings = state.settings.snapshot();
            let resolved = resolver::resolve(&RouteScope::Smart, &ctx.principal, &settings)?;
            let catalog = state.catalog.snapshot();

            let hits = index.search(&query, k, threshold).await?;
            let results: Vec<Value> = hits
                .iter()
                .filter(|hit| resolved.admits(&hit.upstream, &hit.tool))
                .map(|hit| {
                    json!({
                        "upstreamName": hit.upstream,
                        "toolName": hit.tool,
                        "description": catalog
                            .get(&hit.upstream, &hit.tool)
                            .map(|t| t.description.clone())
                            .unwrap_or_default(),
                        "confidence": hit.similarity,
                    })
                })
                .collect();

            let text = serde_json::to_string_pretty(&results).map_err(to_serialization)?;
            Ok(Some(ToolCallResult {
                content: vec![ToolContent::Text { text }],
                is_error: false,
            }))
        }

        CALL_TOOL => {
            let upstream = arguments
                .get("upstreamName")
                .and_then(Value::as_str)
                .ok_or_else(|| HubError::Serialization {
                    message: "call_tool requires 'upstreamName'".to_string(),
                })?
                .to_string();
            let tool = arguments
                .get("toolName")
                .and_then(Value::as_str)
                .ok_or_else(|| HubError::Serialization {
                    message: "call_tool requires 'toolName'".to_string(),
                })?
                .to_string();
            let tool_args = arguments.get("arguments").cloned().unwrap_or_else(|| json!({}));

            let settings = state.settings.snapshot();
            let resolved = resolver::resolve(&RouteScope::Smart, &ctx.principal, &settings)?;
            let catalog = state.catalog.snapshot();
            if !catalog.contains_enabled(&upstream, &tool) || !resolved.admits(&upstream, &tool) {
                return Err(HubError::tool_not_allowed(format!("{}/{}", upstream, tool)));
            }

            dispatch(state, ctx, &upstream, &tool, tool_args).await
        }

        other => Err(HubError::tool_not_found(other)),
    }
}

/// Forward one call to an upstream with the per-call deadline and session
/// cancellation applied. `Ok(None)` means the session closed mid-call.
async fn dispatch(
    state: &HubState,
    ctx: &RequestContext,
    upstream: &str,
    tool: &str,
    arguments: Value,
) -> HubResult<Option<ToolCallResult>> {
    let call_timeout = state.settings.snapshot().flags.call_timeout;
    let upstream_name = upstream.to_string();

    let call = async {
        let inner = state.upstreams.call_tool(&upstream_name, tool, arguments);
        if call_timeout.is_zero() {
            // A zero timeout disables the deadline.
            inner.await
        } else {
            match tokio::time::timeout(call_timeout, inner).await {
                Ok(result) => result,
                Err(_) => Err(HubError::UpstreamTimeout {
                    upstream: upstream_name.clone(),
                    timeout: call_timeout,
                }),
            }
        }
    };

    match ctx.session.as_ref().map(|s| s.cancelled()) {
        Some(mut cancelled) => {
            tokio::select! {
                result = call => result.map(Some),
                _ = wait_cancelled(&mut cancelled) => Ok(None),
            }
        }
        None => call.await.map(Some),
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// The two synthetic tools exposed under the smart scope.
pub fn smart_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            SEARCH_TOOLS,
            "Find tools matching a natural-language task description, ranked by similarity.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What you are trying to do"
                    },
                    "k": {
                        "type": "integer",
                        "description": "Maximum number of results",
                        "default": DEFAULT_SEARCH_K
                    },
                    "threshold": {
                        "type": "number",
                        "minimum": 0.0,
                        "maximum": 1.0,
                        "description": "Minimum similarity to include",
                        "default": DEFAULT_SEARCH_THRESHOLD
                    }
                },
                "required": ["query"]
            }),
        ),
        ToolDescriptor::new(
            CALL_TOOL,
            "Invoke a tool found via search_tools on its upstream server.",
            json!({
                "type": "object",
                "properties": {
                    "upstreamName": { "type": "string" },
                    "toolName": { "type": "string" },
                    "arguments": { "type": "object" }
                },
                "required": ["upstreamName", "toolName"]
            }),
        ),
    ]
}

/// Assemble the tool view for a scope: filter, namespace collisions, sort.
///
/// Collision prefixes depend only on the *set* of duplicated names, so
/// permuting the upstreams never changes an effective name.
pub fn render_view(
    state: &HubState,
    scope: &RouteScope,
    principal: &Principal,
    apply_allowlist: bool,
) -> HubResult<SessionView> {
    let settings = state.settings.snapshot();
    let resolved = resolver::resolve(scope, principal, &settings)?;
    let catalog = state.catalog.snapshot();

    if resolved.is_smart {
        return Ok(SessionView {
            catalog_version: catalog.version,
            tools: smart_tools(),
            name_map: HashMap::new(),
        });
    }

    let hide_degraded = settings.flags.hide_degraded_upstreams_from_list;
    let mut selected: Vec<&EffectiveTool> = Vec::new();
    for entry in &resolved.entries {
        if hide_degraded {
            let ready = state
                .upstreams
                .status(&entry.upstream)
                .map(|s| s.state.is_ready())
                .unwrap_or(false);
            if !ready {
                continue;
            }
        }
        for tool in catalog.by_upstream(&entry.upstream) {
            if !tool.enabled {
                continue;
            }
            if apply_allowlist && !entry.allowed.allows(&tool.name) {
                continue;
            }
            selected.push(tool);
        }
    }

    let mut owners: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for tool in &selected {
        owners
            .entry(tool.name.as_str())
            .or_default()
            .insert(tool.upstream.as_str());
    }

    let mut tools = Vec::with_capacity(selected.len());
    let mut name_map = HashMap::with_capacity(selected.len());
    for tool in &selected {
        let collides = owners
            .get(tool.name.as_str())
            .map(|set| set.len() > 1)
            .unwrap_or(false);
        let effective = if collides {
            format!("{}__{}", tool.upstream, tool.name)
        } else {
            tool.name.clone()
        };
        let mut descriptor = tool.descriptor();
        descriptor.name = effective.clone();
        tools.push(descriptor);
        name_map.insert(effective, (tool.upstream.clone(), tool.name.clone()));
    }
    tools.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(SessionView {
        catalog_version: catalog.version,
        tools,
        name_map,
    })
}

/// Watch catalog and settings changes and notify sessions whose filtered
/// view actually changed. Bursts within a short window coalesce into one
/// notification.
pub fn spawn_change_notifier(state: HubState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut catalog_rx = state.catalog.subscribe();
        let mut settings_rx = state.settings.subscribe();
        loop {
            tokio::select! {
                _ = catalog_rx.recv() => {}
                _ = settings_rx.recv() => {}
            }
            tokio::time::sleep(NOTIFY_COALESCE).await;
            while catalog_rx.try_recv().is_ok() {}
            while settings_rx.try_recv().is_ok() {}

            notify_sessions(&state);
        }
    })
}

fn notify_sessions(state: &HubState) {
    for session in state.sessions.snapshot() {
        // A session that never listed has been shown nothing; there is
        // nothing to invalidate.
        let Some(previous) = session.view() else {
            continue;
        };

        let fresh = match render_view(state, &session.scope, &session.principal, true) {
            Ok(view) => view,
            // A scope that no longer resolves renders empty.
            Err(_) => SessionView {
                catalog_version: state.catalog.version(),
                tools: Vec::new(),
                name_map: HashMap::new(),
            },
        };

        if fresh.tools == previous.tools {
            if fresh.catalog_version != previous.catalog_version {
                session.set_view(fresh);
            }
            continue;
        }

        session.set_view(fresh);
        if session.has_outbound() {
            let frame = serde_json::to_value(JsonRpcRequest::notification(
                NOTIFICATION_TOOLS_LIST_CHANGED,
                None,
            ))
            .unwrap_or(Value::Null);
            if !session.send(frame) {
                tracing::debug!(session = %session.id, "list_changed dropped, client gone");
            }
        }
    }
}
