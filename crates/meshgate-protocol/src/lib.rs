//! # meshgate-protocol
//!
//! Wire types shared by every meshgate transport: JSON-RPC 2.0 framing with
//! batch support, and the MCP message vocabulary (initialize exchange,
//! tools/resources/prompts listings) the gateway forwards between clients
//! and backends.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod jsonrpc;
pub mod types;

pub use jsonrpc::{
    JsonRpcBatch, JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, JsonRpcVersion, RequestId, ResponseId, JSONRPC_VERSION,
};
pub use types::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, PromptDescriptor,
    ResourceDescriptor, ServerCapabilities, ToolDescriptor, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
