//! MCP message vocabulary.
//!
//! The gateway does not interpret most MCP payloads; it needs the method
//! names for routing and probing, the initialize exchange it answers on
//! behalf of a session, and the descriptor shapes virtual servers produce.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision the gateway negotiates.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Hard cap on a single framed message, shared by all transports.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// MCP method names.
pub mod methods {
    /// Session initialization handshake
    pub const INITIALIZE: &str = "initialize";
    /// Liveness check
    pub const PING: &str = "ping";
    /// Enumerate tools
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invoke a tool
    pub const TOOLS_CALL: &str = "tools/call";
    /// Enumerate resources
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Read one resource
    pub const RESOURCES_READ: &str = "resources/read";
    /// Enumerate prompts
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Fetch one prompt
    pub const PROMPTS_GET: &str = "prompts/get";

    /// Methods the gateway advertises through introspection.
    pub const ADVERTISED: &[&str] = &[
        INITIALIZE,
        PING,
        TOOLS_LIST,
        TOOLS_CALL,
        RESOURCES_LIST,
        RESOURCES_READ,
        PROMPTS_LIST,
        PROMPTS_GET,
    ];
}

/// Name/version pair identifying a client or server implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name
    pub name: String,
    /// Implementation version
    pub version: String,
}

/// Capabilities a client declares during initialize. The gateway forwards
/// these opaquely; only presence matters for negotiation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Experimental capability map
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub experimental: HashMap<String, Value>,
    /// Sampling support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    /// Roots support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
}

/// Capabilities the gateway (or a backend) advertises.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    /// Resource support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    /// Prompt support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    /// Logging support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    /// Experimental capability map
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub experimental: HashMap<String, Value>,
}

impl ServerCapabilities {
    /// Capabilities the gateway reports for itself: it brokers tools,
    /// resources, and prompts for whatever backend a session binds to.
    pub fn gateway() -> Self {
        Self {
            tools: Some(Value::Object(serde_json::Map::new())),
            resources: Some(Value::Object(serde_json::Map::new())),
            prompts: Some(Value::Object(serde_json::Map::new())),
            logging: None,
            experimental: HashMap::new(),
        }
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol revision the client speaks
    pub protocol_version: String,
    /// Client capability declaration
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    /// Client identity
    pub client_info: Implementation,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol revision the server speaks
    pub protocol_version: String,
    /// Server capability declaration
    pub capabilities: ServerCapabilities,
    /// Server identity
    pub server_info: Implementation,
    /// Optional usage instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// The result the gateway answers with when it terminates the
    /// initialize exchange itself.
    pub fn gateway(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::gateway(),
            server_info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            instructions: None,
        }
    }
}

/// Tool descriptor, as produced by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool name, unique within a server
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the tool arguments
    pub input_schema: Value,
}

/// Resource descriptor, as produced by `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Resource URI
    pub uri: String,
    /// Display name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Prompt descriptor, as produced by `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    /// Prompt name, unique within a server
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// One declared prompt argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied
    #[serde(default)]
    pub required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn initialize_params_wire_shape() {
        let raw = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "t", "version": "1"}
        });
        let params: InitializeParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.protocol_version, PROTOCOL_VERSION);
        assert_eq!(params.client_info.name, "t");
    }

    #[test]
    fn initialize_result_camel_case() {
        let result = InitializeResult::gateway("meshgate", "0.3.0");
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(wire["serverInfo"]["name"], json!("meshgate"));
        assert!(wire["capabilities"]["tools"].is_object());
    }

    #[test]
    fn advertised_methods_include_core_set() {
        assert!(methods::ADVERTISED.contains(&methods::TOOLS_CALL));
        assert!(methods::ADVERTISED.contains(&methods::PING));
        assert_eq!(methods::ADVERTISED.len(), 8);
    }
}
