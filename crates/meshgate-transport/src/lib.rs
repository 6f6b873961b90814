//! # meshgate-transport
//!
//! The transport layer of the meshgate gateway: five concrete transports
//! (single-shot JSON-RPC over HTTP, Server-Sent Events, WebSocket, the MCP
//! streamable-HTTP wire protocol, and a STDIO bridge that spawns subprocess
//! MCP servers) behind one uniform contract, the session store that owns
//! every live session, and the transport manager that multiplexes sessions
//! across transports.
//!
//! Direction convention: [`TransportConnection::send`] moves a message
//! toward the peer (the connected client, or the child process for STDIO);
//! [`TransportConnection::receive`] yields the next message the peer sent.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod http;
pub mod manager;
pub mod session;
pub mod sse;
pub mod stdio;
pub mod streamable;
pub mod websocket;

pub use crate::core::{
    BroadcastScope, LaunchSpec, SessionContext, Transport, TransportCapabilities,
    TransportConnection, TransportError, TransportResult, TransportType,
};
pub use manager::{CreateConnection, ManagerConfig, ManagerError, ManagerStats, TransportManager};
pub use session::{
    NewSession, Session, SessionError, SessionFilter, SessionLimits, SessionSnapshot, SessionState,
    SessionStore,
};
