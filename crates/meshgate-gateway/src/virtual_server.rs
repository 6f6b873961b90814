//! Virtual servers: adapters that present non-MCP upstreams as backends.
//!
//! A virtual server is a registered backend whose implementation maps MCP
//! tool, resource, and prompt calls onto another protocol instead of a
//! socket or subprocess. The proxy treats it like any backend; dispatch
//! lands here and upstream failures come back as MCP application errors
//! in the `-32000..=-32099` range.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshgate_protocol::jsonrpc::ERROR_UPSTREAM_PARTIAL;
use meshgate_protocol::types::methods;
use meshgate_protocol::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse, PromptDescriptor,
    ResourceDescriptor, ToolDescriptor,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// Error from a virtual upstream, already shaped for the MCP wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({code})")]
pub struct AdapterError {
    /// Application error code in `-32000..=-32099`
    pub code: i32,
    /// Failure detail
    pub message: String,
    /// Structured detail, e.g. a partial upstream payload
    pub data: Option<Value>,
}

impl AdapterError {
    /// Build an adapter error; the code is clamped into the application
    /// range by the conversion to [`JsonRpcError`].
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Upstream answered for part of the request; carry what arrived.
    pub fn partial(message: impl Into<String>, partial: Value) -> Self {
        Self {
            code: ERROR_UPSTREAM_PARTIAL,
            message: message.into(),
            data: Some(partial),
        }
    }
}

impl From<AdapterError> for JsonRpcError {
    fn from(err: AdapterError) -> Self {
        let mut mapped = JsonRpcError::application(err.code, err.message);
        mapped.data = err.data;
        mapped
    }
}

/// Result type for adapter calls
pub type AdapterResult<T> = Result<T, AdapterError>;

/// The adapter contract: the six MCP surfaces a virtual server must map.
#[async_trait]
pub trait VirtualServerAdapter: Send + Sync {
    /// Enumerate tools.
    async fn list_tools(&self) -> AdapterResult<Vec<ToolDescriptor>>;

    /// Invoke a tool.
    async fn call_tool(&self, name: &str, args: Value) -> AdapterResult<Value>;

    /// Enumerate resources.
    async fn list_resources(&self) -> AdapterResult<Vec<ResourceDescriptor>>;

    /// Read one resource.
    async fn read_resource(&self, uri: &str) -> AdapterResult<Value>;

    /// Enumerate prompts.
    async fn list_prompts(&self) -> AdapterResult<Vec<PromptDescriptor>>;

    /// Fetch one prompt.
    async fn get_prompt(&self, name: &str, args: Value) -> AdapterResult<Value>;
}

/// Registry binding backend ids to their adapters.
#[derive(Default)]
pub struct VirtualServerRegistry {
    adapters: DashMap<Uuid, Arc<dyn VirtualServerAdapter>>,
}

impl std::fmt::Debug for VirtualServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualServerRegistry")
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl VirtualServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an adapter to a backend id.
    pub fn attach(&self, backend_id: Uuid, adapter: Arc<dyn VirtualServerAdapter>) {
        self.adapters.insert(backend_id, adapter);
    }

    /// Adapter for a backend, when it is virtual.
    pub fn adapter(&self, backend_id: Uuid) -> Option<Arc<dyn VirtualServerAdapter>> {
        self.adapters.get(&backend_id).map(|a| Arc::clone(&a))
    }

    /// Detach an adapter.
    pub fn detach(&self, backend_id: Uuid) {
        self.adapters.remove(&backend_id);
    }
}

/// Route one MCP request through an adapter and shape the paired response.
pub async fn dispatch(
    adapter: &dyn VirtualServerAdapter,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let id = request.id.clone();
    let params = request.params.unwrap_or(Value::Null);

    let outcome: AdapterResult<Value> = match request.method.as_str() {
        methods::PING => Ok(json!({})),
        methods::TOOLS_LIST => adapter
            .list_tools()
            .await
            .and_then(|tools| {
                serde_json::to_value(tools)
                    .map_err(|e| AdapterError::new(-32098, e.to_string()))
            })
            .map(|tools| json!({ "tools": tools })),
        methods::TOOLS_CALL => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                return JsonRpcResponse::error(
                    JsonRpcError::new(JsonRpcErrorCode::InvalidParams, "missing tool name"),
                    id,
                );
            }
            let args = params.get("arguments").cloned().unwrap_or(json!({}));
            adapter.call_tool(&name, args).await
        }
        methods::RESOURCES_LIST => adapter
            .list_resources()
            .await
            .and_then(|resources| {
                serde_json::to_value(resources)
                    .map_err(|e| AdapterError::new(-32098, e.to_string()))
            })
            .map(|resources| json!({ "resources": resources })),
        methods::RESOURCES_READ => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            if uri.is_empty() {
                return JsonRpcResponse::error(
                    JsonRpcError::new(JsonRpcErrorCode::InvalidParams, "missing resource uri"),
                    id,
                );
            }
            adapter.read_resource(uri).await
        }
        methods::PROMPTS_LIST => adapter
            .list_prompts()
            .await
            .and_then(|prompts| {
                serde_json::to_value(prompts)
                    .map_err(|e| AdapterError::new(-32098, e.to_string()))
            })
            .map(|prompts| json!({ "prompts": prompts })),
        methods::PROMPTS_GET => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                return JsonRpcResponse::error(
                    JsonRpcError::new(JsonRpcErrorCode::InvalidParams, "missing prompt name"),
                    id,
                );
            }
            let args = params.get("arguments").cloned().unwrap_or(json!({}));
            adapter.get_prompt(&name, args).await
        }
        other => {
            return JsonRpcResponse::error(
                JsonRpcError::new(
                    JsonRpcErrorCode::MethodNotFound,
                    format!("method '{other}' not supported by virtual server"),
                ),
                id,
            );
        }
    };

    match outcome {
        Ok(result) => JsonRpcResponse::success(result, id),
        Err(err) => JsonRpcResponse::error(err.into(), id),
    }
}

/// Declarative tool mapping for the REST adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct RestToolMapping {
    /// Tool name exposed over MCP
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// HTTP method for the upstream call
    #[serde(default = "default_method")]
    pub method: String,
    /// Path appended to the adapter base URL
    pub path: String,
    /// JSON schema for the tool arguments
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_schema() -> Value {
    json!({ "type": "object" })
}

/// Adapter translating MCP calls into plain REST requests.
#[derive(Debug)]
pub struct RestAdapter {
    client: reqwest::Client,
    base_url: Url,
    tools: Vec<RestToolMapping>,
}

impl RestAdapter {
    /// Build an adapter for one REST upstream.
    pub fn new(client: reqwest::Client, base_url: Url, tools: Vec<RestToolMapping>) -> Self {
        Self {
            client,
            base_url,
            tools,
        }
    }

    fn mapping(&self, name: &str) -> Option<&RestToolMapping> {
        self.tools.iter().find(|t| t.name == name)
    }

    fn upstream_url(&self, path: &str) -> AdapterResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| AdapterError::new(-32097, format!("bad upstream path: {e}")))
    }
}

#[async_trait]
impl VirtualServerAdapter for RestAdapter {
    async fn list_tools(&self) -> AdapterResult<Vec<ToolDescriptor>> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> AdapterResult<Value> {
        let mapping = self
            .mapping(name)
            .ok_or_else(|| AdapterError::new(-32001, format!("unknown tool '{name}'")))?;
        let url = self.upstream_url(&mapping.path)?;
        debug!(tool = name, %url, "virtual tool call");

        let request = match mapping.method.to_ascii_uppercase().as_str() {
            "GET" => self.client.get(url),
            "PUT" => self.client.put(url).json(&args),
            "DELETE" => self.client.delete(url),
            _ => self.client.post(url).json(&args),
        };
        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::new(-32050, format!("upstream unreachable: {e}")))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            Ok(json!({
                "content": [{ "type": "text", "text": body.to_string() }],
                "isError": false
            }))
        } else if status.as_u16() == 207 || status.is_redirection() {
            Err(AdapterError::partial(
                format!("upstream returned {status}"),
                body,
            ))
        } else {
            Err(AdapterError::new(
                -32051,
                format!("upstream returned {status}"),
            ))
        }
    }

    async fn list_resources(&self) -> AdapterResult<Vec<ResourceDescriptor>> {
        // REST upstreams expose tools; resources and prompts are empty
        // rather than an error so listings aggregate cleanly.
        Ok(Vec::new())
    }

    async fn read_resource(&self, uri: &str) -> AdapterResult<Value> {
        Err(AdapterError::new(
            -32002,
            format!("no resource '{uri}' on this virtual server"),
        ))
    }

    async fn list_prompts(&self) -> AdapterResult<Vec<PromptDescriptor>> {
        Ok(Vec::new())
    }

    async fn get_prompt(&self, name: &str, _args: Value) -> AdapterResult<Value> {
        Err(AdapterError::new(
            -32002,
            format!("no prompt '{name}' on this virtual server"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_protocol::RequestId;

    struct FakeAdapter;

    #[async_trait]
    impl VirtualServerAdapter for FakeAdapter {
        async fn list_tools(&self) -> AdapterResult<Vec<ToolDescriptor>> {
            Ok(vec![ToolDescriptor {
                name: "echo".into(),
                description: None,
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, name: &str, args: Value) -> AdapterResult<Value> {
            match name {
                "echo" => Ok(json!({ "echoed": args })),
                "flaky" => Err(AdapterError::partial("half done", json!({"done": 1}))),
                _ => Err(AdapterError::new(-32001, "unknown tool")),
            }
        }

        async fn list_resources(&self) -> AdapterResult<Vec<ResourceDescriptor>> {
            Ok(Vec::new())
        }

        async fn read_resource(&self, _uri: &str) -> AdapterResult<Value> {
            Err(AdapterError::new(-32002, "none"))
        }

        async fn list_prompts(&self) -> AdapterResult<Vec<PromptDescriptor>> {
            Ok(Vec::new())
        }

        async fn get_prompt(&self, _name: &str, _args: Value) -> AdapterResult<Value> {
            Err(AdapterError::new(-32002, "none"))
        }
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(method, Some(params), RequestId::from("v-1"))
    }

    #[tokio::test]
    async fn tools_list_is_wrapped() {
        let response = dispatch(&FakeAdapter, request(methods::TOOLS_LIST, json!({}))).await;
        let tools = &response.result().unwrap()["tools"];
        assert_eq!(tools[0]["name"], json!("echo"));
    }

    #[tokio::test]
    async fn tool_call_round_trips_arguments() {
        let response = dispatch(
            &FakeAdapter,
            request(
                methods::TOOLS_CALL,
                json!({"name": "echo", "arguments": {"x": 1}}),
            ),
        )
        .await;
        assert_eq!(response.result().unwrap()["echoed"]["x"], json!(1));
    }

    #[tokio::test]
    async fn partial_success_surfaces_code_and_payload() {
        let response = dispatch(
            &FakeAdapter,
            request(methods::TOOLS_CALL, json!({"name": "flaky"})),
        )
        .await;
        let error = response.error_object().unwrap();
        assert_eq!(error.code, ERROR_UPSTREAM_PARTIAL);
        assert_eq!(error.data.as_ref().unwrap()["done"], json!(1));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let response = dispatch(&FakeAdapter, request("sampling/createMessage", json!({}))).await;
        assert_eq!(response.error_object().unwrap().code, -32601);
    }

    #[tokio::test]
    async fn missing_tool_name_is_invalid_params() {
        let response = dispatch(&FakeAdapter, request(methods::TOOLS_CALL, json!({}))).await;
        assert_eq!(response.error_object().unwrap().code, -32602);
    }

    #[test]
    fn adapter_error_codes_stay_in_the_application_range() {
        let err: JsonRpcError = AdapterError::new(-1, "way out of range").into();
        assert!((-32099..=-32000).contains(&err.code));
    }
}
