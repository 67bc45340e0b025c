//! Axum handlers for the downstream HTTP surface.
//!
//! Two MCP transports are served: SSE (`GET /sse` + `POST /messages`) and
//! streamable HTTP (`POST/GET/DELETE /mcp`). Every route also exists under a
//! leading `/{principal}` segment that sets the effective user, and takes an
//! optional trailing scope segment (an upstream name, a group id or name, or
//! the literal `$smart`).

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use manifold_hub::resolver::RouteScope;
use manifold_hub::HubError;
use manifold_mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use manifold_mcp::transport::http_stream::SESSION_HEADER;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::app::HubState;
use crate::auth::principal_from_segment;
use crate::router::{handle_request, render_view, RequestContext};
use crate::session::SessionManager;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Assemble the full route table.
pub fn build_router(state: HubState) -> Router {
    let base_path = state.base_path.clone();
    let routes = Router::new()
        .route("/health", get(health))
        .route("/sse", get(sse_root))
        .route("/sse/{scope}", get(sse_scope))
        .route("/messages", post(messages))
        .route("/mcp", post(mcp_post_root).get(mcp_get_root).delete(mcp_delete))
        .route("/mcp/{scope}", post(mcp_post_scope).get(mcp_get_scope).delete(mcp_delete))
        .route("/{principal}/sse", get(user_sse_root))
        .route("/{principal}/sse/{scope}", get(user_sse_scope))
        .route("/{principal}/messages", post(messages))
        .route("/{principal}/mcp", post(user_mcp_post_root).get(user_mcp_get_root).delete(mcp_delete))
        .route("/{principal}/mcp/{scope}", post(user_mcp_post_scope).get(user_mcp_get_scope).delete(mcp_delete))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    if base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&base_path, routes)
    }
}

fn error_status(error: &HubError) -> StatusCode {
    match error {
        HubError::ScopeNotFound { .. }
        | HubError::SessionNotFound { .. }
        | HubError::ToolNotFound { .. } => StatusCode::NOT_FOUND,
        HubError::Unauthorized { .. } | HubError::ToolNotAllowed { .. } => StatusCode::FORBIDDEN,
        HubError::Configuration { .. } | HubError::Serialization { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &HubError, id: Option<serde_json::Value>) -> Response {
    (
        error_status(error),
        Json(JsonRpcResponse::failure(error.jsonrpc_error(), id)),
    )
        .into_response()
}

fn parse_scope(state: &HubState, segment: Option<&str>) -> Result<RouteScope, HubError> {
    RouteScope::parse(segment, &state.settings.snapshot())
}

// === SSE transport ===

async fn sse_root(State(state): State<HubState>) -> Response {
    open_sse(state, None, None).await
}

async fn sse_scope(State(state): State<HubState>, Path(scope): Path<String>) -> Response {
    open_sse(state, None, Some(scope)).await
}

async fn user_sse_root(State(state): State<HubState>, Path(principal): Path<String>) -> Response {
    open_sse(state, Some(principal), None).await
}

async fn user_sse_scope(
    State(state): State<HubState>,
    Path((principal, scope)): Path<(String, String)>,
) -> Response {
    open_sse(state, Some(principal), Some(scope)).await
}

/// Open the event stream. The first event names the paired message POST
/// endpoint; everything after is JSON-RPC frames for this session.
async fn open_sse(state: HubState, principal_seg: Option<String>, scope_seg: Option<String>) -> Response {
    let principal = principal_from_segment(principal_seg.as_deref());
    let scope = match parse_scope(&state, scope_seg.as_deref()) {
        Ok(scope) => scope,
        Err(e) => return error_response(&e, None),
    };

    let (session, mut outbound) = match state.sessions.create_sse(scope, principal) {
        Ok(created) => created,
        Err(e) => return error_response(&e, None),
    };

    let endpoint = match &principal_seg {
        Some(user) => format!("{}/{}/messages?sessionId={}", state.base_path, user, session.id),
        None => format!("{}/messages?sessionId={}", state.base_path, session.id),
    };

    let guard = SessionGuard {
        sessions: Arc::clone(&state.sessions),
        id: session.id.clone(),
    };

    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(async_stream::stream! {
            // Moved into the stream so client disconnect tears the session down.
            let _guard = guard;
            yield Ok(Event::default().event("endpoint").data(endpoint));
            while let Some(frame) = outbound.recv().await {
                match serde_json::to_string(&frame) {
                    Ok(data) => yield Ok(Event::default().event("message").data(data)),
                    Err(e) => tracing::warn!("unserializable outbound frame: {}", e),
                }
            }
        });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keep-alive"))
        .into_response()
}

/// Removes the session when the SSE stream is dropped.
struct SessionGuard {
    sessions: Arc<SessionManager>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Client → server half of the SSE transport. Responses travel back over
/// the event stream, so this endpoint only acknowledges receipt.
async fn messages(
    State(state): State<HubState>,
    Query(query): Query<MessagesQuery>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let Some(session_id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "sessionId query parameter required").into_response();
    };
    let Some(session) = state.sessions.get(&session_id) else {
        let error = HubError::SessionNotFound {
            session: session_id,
        };
        return error_response(&error, request.id.clone());
    };

    let ctx = RequestContext::for_session(Arc::clone(&session));
    tokio::spawn(async move {
        if let Some(response) = handle_request(&state, &ctx, request).await {
            match serde_json::to_value(&response) {
                Ok(frame) => {
                    if !session.send(frame) {
                        tracing::debug!(session = %session.id, "response dropped, client gone");
                    }
                }
                Err(e) => tracing::warn!("unserializable response: {}", e),
            }
        }
    });

    (StatusCode::ACCEPTED, "Accepted").into_response()
}

// === Streamable HTTP transport ===

async fn mcp_post_root(
    State(state): State<HubState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    mcp_post(state, None, None, headers, request).await
}

async fn mcp_post_scope(
    State(state): State<HubState>,
    Path(scope): Path<String>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    mcp_post(state, None, Some(scope), headers, request).await
}

async fn user_mcp_post_root(
    State(state): State<HubState>,
    Path(principal): Path<String>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    mcp_post(state, Some(principal), None, headers, request).await
}

async fn user_mcp_post_scope(
    State(state): State<HubState>,
    Path((principal, scope)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    mcp_post(state, Some(principal), Some(scope), headers, request).await
}

/// One streamable-HTTP exchange.
///
/// `initialize` without a session header opens a session and hands the id
/// back in `Mcp-Session-Id`; other requests run against the named session,
/// or statelessly when the header is absent.
async fn mcp_post(
    state: HubState,
    principal_seg: Option<String>,
    scope_seg: Option<String>,
    headers: HeaderMap,
    request: JsonRpcRequest,
) -> Response {
    let request_id = request.id.clone();
    let header_session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(session_id) = header_session {
        let Some(session) = state.sessions.get(&session_id) else {
            let error = HubError::SessionNotFound {
                session: session_id,
            };
            return error_response(&error, request_id);
        };
        let ctx = RequestContext::for_session(session);
        return match handle_request(&state, &ctx, request).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    let principal = principal_from_segment(principal_seg.as_deref());
    let scope = match parse_scope(&state, scope_seg.as_deref()) {
        Ok(scope) => scope,
        Err(e) => return error_response(&e, request_id),
    };

    if request.method == manifold_mcp::protocol::METHOD_INITIALIZE {
        let session = match state.sessions.create_http(scope, principal) {
            Ok(session) => session,
            Err(e) => return error_response(&e, request_id),
        };
        let session_id = session.id.clone();
        let ctx = RequestContext::for_session(session);
        return match handle_request(&state, &ctx, request).await {
            Some(response) => {
                ([(SESSION_HEADER, session_id)], Json(response)).into_response()
            }
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    // Stateless one-shot request.
    let ctx = RequestContext::stateless(scope, principal);
    match handle_request(&state, &ctx, request).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn mcp_get_root(State(state): State<HubState>) -> Response {
    mcp_get(state, None, None).await
}

async fn mcp_get_scope(State(state): State<HubState>, Path(scope): Path<String>) -> Response {
    mcp_get(state, None, Some(scope)).await
}

async fn user_mcp_get_root(State(state): State<HubState>, Path(principal): Path<String>) -> Response {
    mcp_get(state, Some(principal), None).await
}

async fn user_mcp_get_scope(
    State(state): State<HubState>,
    Path((principal, scope)): Path<(String, String)>,
) -> Response {
    mcp_get(state, Some(principal), Some(scope)).await
}

/// Server info for a scope, without opening a session.
async fn mcp_get(state: HubState, principal_seg: Option<String>, scope_seg: Option<String>) -> Response {
    let principal = principal_from_segment(principal_seg.as_deref());
    let scope = match parse_scope(&state, scope_seg.as_deref()) {
        Ok(scope) => scope,
        Err(e) => return error_response(&e, None),
    };

    match render_view(&state, &scope, &principal, true) {
        Ok(view) => Json(json!({
            "serverInfo": state.server_info,
            "capabilities": { "tools": { "listChanged": true } },
            "scope": scope.label(),
            "toolCount": view.tools.len(),
        }))
        .into_response(),
        Err(e) => error_response(&e, None),
    }
}

/// Close a streamable-HTTP session.
async fn mcp_delete(State(state): State<HubState>, headers: HeaderMap) -> Response {
    let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "Mcp-Session-Id header required").into_response();
    };
    if state.sessions.remove(session_id) {
        (StatusCode::OK, "Session closed").into_response()
    } else {
        let error = HubError::SessionNotFound {
            session: session_id.to_string(),
        };
        error_response(&error, None)
    }
}

// === Observability ===

async fn health(State(state): State<HubState>) -> Response {
    Json(json!({
        "status": "ok",
        "catalogVersion": state.catalog.version(),
        "sessions": state.sessions.len(),
        "upstreams": state.upstreams.statuses(),
    }))
    .into_response()
}
