//! # meshgate-gateway
//!
//! A multi-protocol gateway in front of a fleet of MCP servers. Clients
//! speak JSON-RPC over HTTP, Server-Sent Events, WebSocket, the MCP
//! streamable-HTTP wire protocol, or a STDIO bridge; the gateway admits
//! them through a sliding-window rate limiter, resolves a backend through
//! the registry and load balancer, and shuttles MCP messages while the
//! health prober keeps the candidate set honest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app;
pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod virtual_server;

pub use app::Gateway;
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
