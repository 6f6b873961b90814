//! Streamable-HTTP transport: the official MCP wire protocol.
//!
//! One endpoint accepts GET and POST; each exchange answers with either a
//! single JSON object or an SSE stream, negotiated from the `Accept`
//! header and a `stream_mode` hint. Session affinity rides an opaque token
//! in the `Mcp-Session-Id` header; a request without one gets a session on
//! demand. Responses destined for a JSON-mode exchange are correlated by
//! request id; everything else lands in the session's replay ring.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshgate_protocol::{JsonRpcMessage, JsonRpcResponse, RequestId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::{
    SessionContext, Transport, TransportConnection, TransportError, TransportResult, TransportType,
};
use crate::sse::{EventRing, SseEvent, DEFAULT_RING_CAPACITY};

/// Header carrying the opaque session token.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// How a single exchange wants its answer delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// One JSON object in the response body
    #[default]
    Json,
    /// An SSE stream carrying the response and subsequent events
    Sse,
}

/// The streamable-HTTP transport: sessions with a replay ring and JSON-mode
/// response correlation.
#[derive(Debug)]
pub struct StreamableTransport {
    connections: DashMap<Uuid, Arc<StreamableConnection>>,
    ring_capacity: usize,
}

impl StreamableTransport {
    /// Create the transport with the given per-session ring capacity.
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            ring_capacity,
        }
    }

    /// Look up a live connection by its session token.
    pub fn connection(&self, session_id: Uuid) -> Option<Arc<StreamableConnection>> {
        self.connections.get(&session_id).map(|c| Arc::clone(&c))
    }

    /// Drop a connection from the registry.
    pub fn remove(&self, session_id: Uuid) {
        self.connections.remove(&session_id);
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for StreamableTransport {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[async_trait]
impl Transport for StreamableTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Streamable
    }

    async fn create_session(
        &self,
        ctx: SessionContext,
    ) -> TransportResult<Arc<dyn TransportConnection>> {
        let conn = Arc::new(StreamableConnection::new(ctx, self.ring_capacity));
        self.connections.insert(conn.session_id, Arc::clone(&conn));
        debug!(session_id = %conn.session_id, "streamable session registered");
        Ok(conn)
    }
}

fn correlation_key(id: &RequestId) -> String {
    match id {
        RequestId::String(s) => format!("s:{s}"),
        RequestId::Number(n) => format!("n:{n}"),
    }
}

/// Per-session streamable state.
#[derive(Debug)]
pub struct StreamableConnection {
    /// Owning session; its string form is the wire token
    pub session_id: Uuid,
    /// Owning tenant
    pub tenant: String,
    /// Authenticated user
    pub user: String,
    /// Replay ring for stream-mode exchanges
    pub events: EventRing,
    pending: DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    inbound_tx: mpsc::Sender<JsonRpcMessage>,
    inbound_rx: TokioMutex<mpsc::Receiver<JsonRpcMessage>>,
}

impl StreamableConnection {
    const INBOUND_DEPTH: usize = 64;

    fn new(ctx: SessionContext, capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(Self::INBOUND_DEPTH);
        Self {
            session_id: ctx.session_id,
            tenant: ctx.tenant,
            user: ctx.user,
            events: EventRing::new(capacity),
            pending: DashMap::new(),
            inbound_tx,
            inbound_rx: TokioMutex::new(inbound_rx),
        }
    }

    /// Register interest in the response to `id` before injecting the
    /// request. JSON-mode exchanges await the returned receiver.
    pub fn expect_response(&self, id: &RequestId) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_key(id), tx);
        rx
    }

    /// Drop a registered expectation (timed-out exchange).
    pub fn abandon_response(&self, id: &RequestId) {
        self.pending.remove(&correlation_key(id));
    }

    /// Queue a client message for the gateway side to `receive`.
    pub async fn inject(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::PeerClosed);
        }
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| TransportError::PeerClosed)
    }

    /// Replay every buffered event with `id > after`.
    pub fn events_after(&self, after: u64) -> Vec<SseEvent> {
        self.events.events_after(after)
    }

    /// Await the next event past the cursor.
    pub async fn next_event(&self, cursor: &mut u64) -> Option<SseEvent> {
        self.events.next_event(cursor).await
    }
}

#[async_trait]
impl TransportConnection for StreamableConnection {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Streamable
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::PeerClosed);
        }
        // A response some JSON-mode exchange is waiting on goes straight to
        // it; everything else is streamed.
        if let JsonRpcMessage::Response(response) = &message {
            if let Some(id) = response.request_id() {
                if let Some((_, waiter)) = self.pending.remove(&correlation_key(id)) {
                    trace!(session_id = %self.session_id, id = %id, "response correlated");
                    let _ = waiter.send(response.clone());
                    return Ok(());
                }
            }
        }
        let data = serde_json::to_value(&message)?;
        self.events.publish("message", data);
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        if !self.is_open() {
            return Ok(None);
        }
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn close(&self) -> TransportResult<()> {
        self.events.close();
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.events.is_open()
    }
}
