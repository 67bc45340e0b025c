//! OpenAPI adapter: synthesizes one MCP tool per documented operation.
//!
//! The document is fetched when the client is built (and again whenever the
//! supervisor rebuilds the client). `tools/call` turns tool arguments back
//! into an HTTP request; HTTP-level failures surface as tool results with
//! `isError`, never as transport errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use super::{ApiKeyLocation, OpenApiSecurity, TransportEvent, UpstreamClient};
use crate::error::{McpError, McpResult};
use crate::protocol::{
    ClientInfo, EmbeddedResource, InitializeResult, ServerCapabilities, ServerInfo,
    ToolCallResult, ToolContent, ToolDescriptor, LATEST_PROTOCOL_VERSION,
};

const HTTP_METHODS: &[&str] = &["get", "put", "post", "delete", "patch"];

/// Where a synthesized parameter is placed on the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamLocation {
    Path,
    Query,
    Header,
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    location: ParamLocation,
    required: bool,
    schema: Value,
    description: String,
}

/// One OpenAPI operation, ready to execute.
#[derive(Debug, Clone)]
struct Operation {
    method: String,
    path: String,
    description: String,
    params: Vec<ParamSpec>,
    /// JSON request-body schema; object-shaped bodies are flattened into the
    /// tool's input schema, anything else rides under a `body` property.
    body_schema: Option<Value>,
    body_required: bool,
    flatten_body: bool,
    response_media: Option<String>,
}

/// Upstream client synthesized from an OpenAPI v3 document.
pub struct OpenApiClient {
    http: reqwest::Client,
    spec_url: String,
    base_url: url::Url,
    security: Option<OpenApiSecurity>,
    headers: HashMap<String, String>,
    operations: BTreeMap<String, Operation>,
    server_info: ServerInfo,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl OpenApiClient {
    /// Fetch and parse the document, synthesizing the tool set.
    pub async fn fetch(
        name: &str,
        spec_url: &str,
        base_url: Option<String>,
        security: Option<OpenApiSecurity>,
        headers: HashMap<String, String>,
    ) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| McpError::configuration(format!("failed to build HTTP client: {}", e)))?;

        let mut request = http.get(spec_url);
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        let response = request.send().await.map_err(|e| {
            McpError::connection_failed(format!("failed to fetch OpenAPI document: {}", e))
        })?;
        if !response.status().is_success() {
            return Err(McpError::connection_failed(format!(
                "OpenAPI document fetch returned {}",
                response.status()
            )));
        }
        let text = response.text().await?;

        let document: Value = serde_json::from_str(&text).or_else(|_| {
            serde_yaml::from_str(&text)
                .map_err(|e| McpError::protocol(format!("OpenAPI document is neither JSON nor YAML: {}", e)))
        })?;

        let server_info = ServerInfo {
            name: document
                .pointer("/info/title")
                .and_then(Value::as_str)
                .unwrap_or(name)
                .to_string(),
            version: document
                .pointer("/info/version")
                .and_then(Value::as_str)
                .unwrap_or("0.0.0")
                .to_string(),
        };

        let base = match base_url {
            Some(explicit) => explicit,
            None => document
                .pointer("/servers/0/url")
                .and_then(Value::as_str)
                .unwrap_or("/")
                .to_string(),
        };
        let spec = url::Url::parse(spec_url)
            .map_err(|e| McpError::configuration(format!("invalid spec URL: {}", e)))?;
        let mut base_url = spec
            .join(&base)
            .map_err(|e| McpError::protocol(format!("unusable server URL '{}': {}", base, e)))?;
        // Joining operation paths needs a directory-style base.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let operations = synthesize_operations(&document)?;
        if operations.is_empty() {
            tracing::warn!(upstream = %name, "OpenAPI document declares no operations");
        }

        let (events, _) = broadcast::channel(1);
        Ok(Self {
            http,
            spec_url: spec_url.to_string(),
            base_url,
            security,
            headers,
            operations,
            server_info,
            closed: AtomicBool::new(false),
            events,
        })
    }

    fn input_schema(op: &Operation) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &op.params {
            let mut schema = param.schema.clone();
            if !param.description.is_empty() {
                if let Value::Object(map) = &mut schema {
                    map.entry("description")
                        .or_insert_with(|| Value::String(param.description.clone()));
                }
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        if let Some(body) = &op.body_schema {
            if op.flatten_body {
                if let Some(props) = body.get("properties").and_then(Value::as_object) {
                    for (key, schema) in props {
                        properties.entry(key.clone()).or_insert_with(|| schema.clone());
                    }
                }
                if let Some(body_required) = body.get("required").and_then(Value::as_array) {
                    for key in body_required {
                        if !required.contains(key) {
                            required.push(key.clone());
                        }
                    }
                }
            } else {
                properties.insert("body".to_string(), body.clone());
                if op.body_required {
                    required.push(Value::String("body".to_string()));
                }
            }
        }

        let mut schema = json!({ "type": "object", "properties": properties });
        if !required.is_empty() {
            schema["required"] = Value::Array(required);
        }
        schema
    }

    fn apply_security(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.security {
            Some(OpenApiSecurity::ApiKey {
                name,
                location: ApiKeyLocation::Header,
                key,
            }) => request = request.header(name, key),
            Some(OpenApiSecurity::ApiKey {
                name,
                location: ApiKeyLocation::Query,
                key,
            }) => request = request.query(&[(name.as_str(), key.as_str())]),
            Some(OpenApiSecurity::Bearer { token }) => request = request.bearer_auth(token),
            Some(OpenApiSecurity::Basic { username, password }) => {
                request = request.basic_auth(username, Some(password));
            }
            None => {}
        }
        request
    }

    async fn execute(&self, op: &Operation, arguments: Value) -> McpResult<ToolCallResult> {
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Ok(ToolCallResult::error_text(format!(
                    "tool arguments must be an object, got {}",
                    value_kind(&other)
                )));
            }
        };

        // Substitute path parameters and collect the rest by location.
        let mut path = op.path.clone();
        let mut query: Vec<(String, String)> = Vec::new();
        let mut header_params: Vec<(String, String)> = Vec::new();
        let mut consumed: Vec<&str> = Vec::new();

        for param in &op.params {
            let value = args.get(&param.name);
            match value {
                None if param.required => {
                    return Ok(ToolCallResult::error_text(format!(
                        "missing required parameter '{}'",
                        param.name
                    )));
                }
                None => continue,
                Some(value) => {
                    let rendered = render_param(value);
                    match param.location {
                        ParamLocation::Path => {
                            path = path.replace(&format!("{{{}}}", param.name), &rendered);
                        }
                        ParamLocation::Query => query.push((param.name.clone(), rendered)),
                        ParamLocation::Header => header_params.push((param.name.clone(), rendered)),
                    }
                    consumed.push(param.name.as_str());
                }
            }
        }

        let body = if op.body_schema.is_some() {
            if op.flatten_body {
                let remaining: Map<String, Value> = args
                    .iter()
                    .filter(|(k, _)| !consumed.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (!remaining.is_empty()).then_some(Value::Object(remaining))
            } else {
                args.get("body").cloned()
            }
        } else {
            None
        };

        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| McpError::protocol(format!("unusable operation path '{}': {}", path, e)))?;

        let method = reqwest::Method::from_bytes(op.method.to_uppercase().as_bytes())
            .map_err(|e| McpError::protocol(format!("bad HTTP method '{}': {}", op.method, e)))?;

        let mut request = self.http.request(method, url.clone());
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        for (key, value) in header_params {
            request = request.header(key, value);
        }
        if !query.is_empty() {
            request = request.query(&query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        request = self.apply_security(request);

        // From here on failures belong to the tool, not the transport.
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(ToolCallResult::error_text(format!("request failed: {}", e))),
        };

        let status = response.status();
        let media_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .or_else(|| op.response_media.clone());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(ToolCallResult::error_text(format!("HTTP {}: {}", status, body)));
        }

        if media_type.as_deref().map(is_textual_media).unwrap_or(true) {
            let body = response.text().await.unwrap_or_default();
            Ok(ToolCallResult::text(body))
        } else {
            let bytes = response.bytes().await.unwrap_or_default();
            Ok(ToolCallResult {
                content: vec![ToolContent::Resource {
                    resource: EmbeddedResource {
                        uri: url.to_string(),
                        mime_type: media_type,
                        text: None,
                        blob: Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                    },
                }],
                is_error: false,
            })
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Stringify a parameter value the way it appears in a URL.
fn render_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_textual_media(media: &str) -> bool {
    media.starts_with("text/")
        || media == "application/json"
        || media.ends_with("+json")
        || media == "application/xml"
        || media.ends_with("+xml")
        || media == "application/x-www-form-urlencoded"
}

/// Derive a tool name for an operation without an `operationId`.
fn operation_slug(method: &str, path: &str) -> String {
    let mut slug = String::from(method);
    for segment in path.split('/') {
        let cleaned: String = segment
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if !cleaned.is_empty() {
            slug.push('_');
            slug.push_str(&cleaned);
        }
    }
    slug
}

fn parse_param(raw: &Value) -> Option<ParamSpec> {
    let name = raw.get("name")?.as_str()?.to_string();
    let location = match raw.get("in")?.as_str()? {
        "path" => ParamLocation::Path,
        "query" => ParamLocation::Query,
        "header" => ParamLocation::Header,
        // Cookie parameters are not worth synthesizing.
        _ => return None,
    };
    Some(ParamSpec {
        name,
        required: raw.get("required").and_then(Value::as_bool).unwrap_or(location == ParamLocation::Path),
        schema: raw.get("schema").cloned().unwrap_or_else(|| json!({ "type": "string" })),
        description: raw
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        location,
    })
}

/// Walk `paths` and build one [`Operation`] per method entry.
fn synthesize_operations(document: &Value) -> McpResult<BTreeMap<String, Operation>> {
    let mut operations = BTreeMap::new();
    let Some(paths) = document.get("paths").and_then(Value::as_object) else {
        return Ok(operations);
    };

    for (path, item) in paths {
        let Some(item) = item.as_object() else { continue };

        let shared_params: Vec<ParamSpec> = item
            .get("parameters")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(parse_param).collect())
            .unwrap_or_default();

        for method in HTTP_METHODS {
            let Some(op) = item.get(*method) else { continue };

            let name = op
                .get("operationId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| operation_slug(method, path));

            let description = op
                .get("summary")
                .or_else(|| op.get("description"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            let mut params = shared_params.clone();
            if let Some(own) = op.get("parameters").and_then(Value::as_array) {
                params.extend(own.iter().filter_map(parse_param));
            }

            let body_schema = op
                .pointer("/requestBody/content/application~1json/schema")
                .cloned();
            let body_required = op
                .pointer("/requestBody/required")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let flatten_body = body_schema
                .as_ref()
                .map(|s| s.get("type").and_then(Value::as_str) == Some("object") && s.get("properties").is_some())
                .unwrap_or(false);

            let response_media = op
                .get("responses")
                .and_then(Value::as_object)
                .and_then(|responses| {
                    responses
                        .iter()
                        .find(|(code, _)| code.starts_with('2'))
                        .or_else(|| responses.iter().find(|(code, _)| *code == "default"))
                        .and_then(|(_, r)| r.get("content"))
                        .and_then(Value::as_object)
                        .and_then(|content| content.keys().next().cloned())
                });

            if operations.contains_key(&name) {
                return Err(McpError::protocol(format!(
                    "OpenAPI document synthesizes duplicate tool name '{}'",
                    name
                )));
            }
            operations.insert(
                name,
                Operation {
                    method: method.to_string(),
                    path: path.clone(),
                    description,
                    params,
                    body_schema,
                    body_required,
                    flatten_body,
                    response_media,
                },
            );
        }
    }
    Ok(operations)
}

#[async_trait::async_trait]
impl UpstreamClient for OpenApiClient {
    async fn initialize(&self, _client_info: ClientInfo) -> McpResult<InitializeResult> {
        // There is no MCP peer; the handshake is synthesized from the document.
        Ok(InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::tools_only(),
            server_info: self.server_info.clone(),
        })
    }

    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        Ok(self
            .operations
            .iter()
            .map(|(name, op)| ToolDescriptor::new(name.clone(), op.description.clone(), Self::input_schema(op)))
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        let op = self.operations.get(name).ok_or_else(|| McpError::Rpc {
            code: crate::protocol::JsonRpcErrorCode::MethodNotFound as i32,
            message: format!("unknown operation '{}'", name),
        })?;
        self.execute(op, arguments).await
    }

    async fn ping(&self) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        // Any HTTP answer means the service is reachable.
        let mut request = self.http.head(&self.spec_url);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        request.send().await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn kind(&self) -> &'static str {
        "openapi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn petstore_fragment() -> Value {
        json!({
            "openapi": "3.0.0",
            "info": { "title": "Petstore", "version": "1.0.0" },
            "servers": [{ "url": "https://api.example.com/v1" }],
            "paths": {
                "/pets/{petId}": {
                    "parameters": [
                        { "name": "petId", "in": "path", "required": true,
                          "schema": { "type": "string" } }
                    ],
                    "get": {
                        "operationId": "getPet",
                        "summary": "Fetch one pet",
                        "parameters": [
                            { "name": "verbose", "in": "query",
                              "schema": { "type": "boolean" } }
                        ],
                        "responses": {
                            "200": { "content": { "application/json": {} } }
                        }
                    }
                },
                "/pets": {
                    "post": {
                        "summary": "Create a pet",
                        "requestBody": {
                            "required": true,
                            "content": {
                                "application/json": {
                                    "schema": {
                                        "type": "object",
                                        "properties": {
                                            "name": { "type": "string" },
                                            "tag": { "type": "string" }
                                        },
                                        "required": ["name"]
                                    }
                                }
                            }
                        },
                        "responses": {}
                    }
                }
            }
        })
    }

    #[test]
    fn operations_synthesize_with_ids_and_slugs() {
        let ops = synthesize_operations(&petstore_fragment()).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.contains_key("getPet"));
        assert!(ops.contains_key("post_pets"));
    }

    #[test]
    fn path_and_query_parameters_land_in_the_schema() {
        let ops = synthesize_operations(&petstore_fragment()).unwrap();
        let op = &ops["getPet"];
        let schema = OpenApiClient::input_schema(op);
        assert_eq!(schema["properties"]["petId"]["type"], "string");
        assert_eq!(schema["properties"]["verbose"]["type"], "boolean");
        assert_eq!(schema["required"], json!(["petId"]));
    }

    #[test]
    fn object_bodies_are_flattened() {
        let ops = synthesize_operations(&petstore_fragment()).unwrap();
        let op = &ops["post_pets"];
        assert!(op.flatten_body);
        let schema = OpenApiClient::input_schema(op);
        assert_eq!(schema["properties"]["name"]["type"], "string");
        assert_eq!(schema["required"], json!(["name"]));
    }

    #[test]
    fn slug_strips_template_braces() {
        assert_eq!(operation_slug("get", "/pets/{petId}/photos"), "get_pets_petId_photos");
        assert_eq!(operation_slug("delete", "/"), "delete");
    }

    #[test]
    fn textual_media_detection() {
        assert!(is_textual_media("application/json"));
        assert!(is_textual_media("text/plain"));
        assert!(is_textual_media("application/problem+json"));
        assert!(!is_textual_media("image/png"));
        assert!(!is_textual_media("application/octet-stream"));
    }
}
