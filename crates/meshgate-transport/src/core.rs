//! Core transport contract: types, errors, and the uniform traits every
//! transport implements.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use meshgate_protocol::JsonRpcMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by transport operations
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The requested transport is not configured or cannot accept sessions
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// A bounded wait elapsed
    #[error("operation timed out")]
    Timeout,

    /// Framing or protocol violation; `code` is a JSON-RPC error code
    #[error("protocol error {code}: {message}")]
    Protocol {
        /// JSON-RPC error code describing the violation
        code: i32,
        /// Violation detail
        message: String,
    },

    /// The peer (client, socket, or child process) is gone
    #[error("peer closed")]
    PeerClosed,

    /// The operation was canceled by shutdown or session close
    #[error("canceled")]
    Canceled,

    /// Establishing the connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Delivery toward the peer failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A bounded per-session queue is full
    #[error("outbound queue full")]
    QueueFull,

    /// Payload could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Protocol error with a code from the JSON-RPC application range.
    pub fn protocol(code: i32, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// The five transports the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Single-shot JSON-RPC over HTTP
    Http,
    /// Server-Sent Events stream with POST back-channel
    Sse,
    /// Full-duplex WebSocket
    WebSocket,
    /// MCP streamable-HTTP wire protocol
    Streamable,
    /// STDIO bridge to a spawned subprocess
    Stdio,
}

impl TransportType {
    /// All transport kinds, in registration order.
    pub const ALL: [TransportType; 5] = [
        TransportType::Http,
        TransportType::Sse,
        TransportType::WebSocket,
        TransportType::Streamable,
        TransportType::Stdio,
    ];

    /// Static capability descriptor for this kind.
    pub fn capabilities(&self) -> TransportCapabilities {
        match self {
            Self::Http => TransportCapabilities {
                supports_streaming: false,
                supports_batching: true,
                supports_binary: false,
                stateful: false,
            },
            Self::Sse => TransportCapabilities {
                supports_streaming: true,
                supports_batching: false,
                supports_binary: false,
                stateful: true,
            },
            Self::WebSocket => TransportCapabilities {
                supports_streaming: true,
                supports_batching: false,
                supports_binary: true,
                stateful: true,
            },
            Self::Streamable => TransportCapabilities {
                supports_streaming: true,
                supports_batching: true,
                supports_binary: false,
                stateful: true,
            },
            Self::Stdio => TransportCapabilities {
                supports_streaming: true,
                supports_batching: false,
                supports_binary: false,
                stateful: true,
            },
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Sse => write!(f, "sse"),
            Self::WebSocket => write!(f, "websocket"),
            Self::Streamable => write!(f, "streamable"),
            Self::Stdio => write!(f, "stdio"),
        }
    }
}

impl std::str::FromStr for TransportType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "streamable" | "mcp" => Ok(Self::Streamable),
            "stdio" => Ok(Self::Stdio),
            other => Err(TransportError::Unavailable(format!(
                "unknown transport kind '{other}'"
            ))),
        }
    }
}

/// Static transport capability descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Whether the transport carries an open-ended event stream
    pub supports_streaming: bool,
    /// Whether the transport accepts JSON-RPC batches
    pub supports_batching: bool,
    /// Whether binary frames are allowed
    pub supports_binary: bool,
    /// Whether a session outlives a single exchange
    pub stateful: bool,
}

/// Scope predicate for broadcast fan-out on the streaming transports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "scope", content = "value")]
pub enum BroadcastScope {
    /// Every live session on the transport
    #[default]
    All,
    /// Sessions owned by one tenant
    Tenant(String),
    /// Sessions of one user
    User(String),
    /// An explicit session set
    Sessions(Vec<Uuid>),
}

impl BroadcastScope {
    /// Whether a session with the given coordinates is in scope.
    pub fn matches(&self, session_id: Uuid, tenant: &str, user: &str) -> bool {
        match self {
            Self::All => true,
            Self::Tenant(t) => t == tenant,
            Self::User(u) => u == user,
            Self::Sessions(ids) => ids.contains(&session_id),
        }
    }
}

/// Subprocess launch description for STDIO sessions.
///
/// `env` entries are applied over the inherited environment, overrides
/// winning. Secret references must be resolved by the caller before the
/// spec reaches the bridge; values here are passed to the child verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Executable to run
    pub command: String,
    /// Arguments, in order
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    /// Working directory; inherited when unset
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Everything a transport needs to know to open a session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Pre-allocated session identifier (the session store owns the record)
    pub session_id: Uuid,
    /// Owning tenant
    pub tenant: String,
    /// Authenticated user
    pub user: String,
    /// Bound backend, when the session targets a specific server
    pub backend_id: Option<Uuid>,
    /// Subprocess to spawn; required by the STDIO bridge, ignored elsewhere
    pub launch: Option<LaunchSpec>,
}

impl SessionContext {
    /// Context for a session with no subprocess.
    pub fn new(session_id: Uuid, tenant: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            session_id,
            tenant: tenant.into(),
            user: user.into(),
            backend_id: None,
            launch: None,
        }
    }
}

/// A transport: a factory for per-session connections of one kind.
///
/// One instance per kind lives for the gateway's lifetime; it may keep
/// shared state (event rings, process tables) keyed by session id.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The kind of transport this is.
    fn transport_type(&self) -> TransportType;

    /// Static capability descriptor.
    fn capabilities(&self) -> TransportCapabilities {
        self.transport_type().capabilities()
    }

    /// Open a connection for the given session. The returned handle is the
    /// transport-private side of the session; the session store keeps only
    /// the record.
    async fn create_session(
        &self,
        ctx: SessionContext,
    ) -> TransportResult<Arc<dyn TransportConnection>>;
}

/// The per-session half of a transport.
///
/// Connections are owned by the transport manager's registry; `close` is
/// idempotent and is the single point that releases the private handle.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// The session this connection belongs to.
    fn session_id(&self) -> Uuid;

    /// Kind of the owning transport.
    fn transport_type(&self) -> TransportType;

    /// Deliver one message toward the peer.
    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()>;

    /// Next message from the peer. Suspends until one arrives; `Ok(None)`
    /// is end-of-stream.
    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>>;

    /// Graceful close; safe to call more than once.
    async fn close(&self) -> TransportResult<()>;

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_match_kind() {
        assert!(!TransportType::Http.capabilities().stateful);
        assert!(TransportType::Http.capabilities().supports_batching);
        assert!(TransportType::Sse.capabilities().supports_streaming);
        assert!(TransportType::WebSocket.capabilities().supports_binary);
        assert!(TransportType::Stdio.capabilities().stateful);
    }

    #[test]
    fn kind_parse_and_display() {
        for kind in TransportType::ALL {
            let parsed: TransportType = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!("ws".parse::<TransportType>().unwrap(), TransportType::WebSocket);
        assert!("carrier-pigeon".parse::<TransportType>().is_err());
    }

    #[test]
    fn io_error_conversion() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
