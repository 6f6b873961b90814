//! Server-Sent Events transport.
//!
//! Outbound traffic rides a long-lived event stream; client messages arrive
//! as separate POSTs. Each session keeps a bounded ring of recent events
//! tagged with a monotonically increasing id; a reconnecting client that
//! presents `Last-Event-ID` gets everything newer than its mark, in order,
//! before any fresh event. When the ring overflows, the oldest event is
//! dropped and counted; the producer never blocks on a slow consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meshgate_protocol::JsonRpcMessage;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{
    BroadcastScope, SessionContext, Transport, TransportConnection, TransportError,
    TransportResult, TransportType,
};

/// Default ring capacity per session.
pub const DEFAULT_RING_CAPACITY: usize = 256;

/// One buffered event.
#[derive(Debug, Clone, Serialize)]
pub struct SseEvent {
    /// Monotone per-session sequence number, starting at 1
    pub id: u64,
    /// Event name
    pub event: String,
    /// Event payload
    pub data: Value,
    /// Publication time
    pub timestamp: DateTime<Utc>,
}

/// Bounded, overwriting buffer of recent events with monotone ids.
///
/// Shared by the SSE transport and the streamable-HTTP transport, which
/// needs the same replay discipline for its stream mode.
#[derive(Debug)]
pub struct EventRing {
    capacity: usize,
    ring: Mutex<VecDeque<SseEvent>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    notify: Notify,
    open: AtomicBool,
}

impl EventRing {
    /// Create a ring holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            open: AtomicBool::new(true),
        }
    }

    /// Append an event, evicting the oldest on overflow, and wake any
    /// stream pulling from the ring. Returns the assigned id.
    pub fn publish(&self, event: &str, data: Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = SseEvent {
            id,
            event: event.to_string(),
            data,
            timestamp: Utc::now(),
        };
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped_total = total, "event ring full, oldest dropped");
            }
            ring.push_back(entry);
        }
        self.notify.notify_waiters();
        id
    }

    /// Every buffered event with `id > after`, in increasing id order.
    pub fn events_after(&self, after: u64) -> Vec<SseEvent> {
        self.ring
            .lock()
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }

    /// Await the next event with `id > *cursor`, advancing the cursor.
    /// Returns `None` once the ring is closed and drained.
    pub async fn next_event(&self, cursor: &mut u64) -> Option<SseEvent> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            if let Some(event) = self.ring.lock().iter().find(|e| e.id > *cursor).cloned() {
                *cursor = event.id;
                return Some(event);
            }
            if !self.is_open() {
                return None;
            }
            notified.as_mut().await;
        }
    }

    /// Stop the ring: parked streams drain what is buffered and end.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the ring still accepts events.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Events dropped to overflow so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Highest id assigned so far (0 when nothing was published).
    pub fn last_event_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

/// The SSE transport: a registry of per-session event rings.
#[derive(Debug)]
pub struct SseTransport {
    connections: DashMap<Uuid, Arc<SseConnection>>,
    ring_capacity: usize,
}

impl SseTransport {
    /// Create the transport with the given per-session ring capacity.
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            ring_capacity,
        }
    }

    /// Look up a live connection.
    pub fn connection(&self, session_id: Uuid) -> Option<Arc<SseConnection>> {
        self.connections.get(&session_id).map(|c| Arc::clone(&c))
    }

    /// Drop a connection from the registry. Called by the manager after
    /// close; the ring dies with the entry.
    pub fn remove(&self, session_id: Uuid) {
        self.connections.remove(&session_id);
    }

    /// Publish an event to every session in scope. Returns the number of
    /// sessions reached.
    pub fn broadcast(&self, event: &str, data: &Value, scope: &BroadcastScope) -> usize {
        let mut reached = 0;
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.is_open() && scope.matches(conn.session_id, &conn.tenant, &conn.user) {
                conn.publish(event, data.clone());
                reached += 1;
            }
        }
        reached
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Sse
    }

    async fn create_session(
        &self,
        ctx: SessionContext,
    ) -> TransportResult<Arc<dyn TransportConnection>> {
        let conn = Arc::new(SseConnection::new(ctx, self.ring_capacity));
        self.connections.insert(conn.session_id, Arc::clone(&conn));
        debug!(session_id = %conn.session_id, "sse session registered");
        Ok(conn)
    }
}

/// Per-session SSE state: the event ring plus the POST back-channel.
#[derive(Debug)]
pub struct SseConnection {
    /// Owning session
    pub session_id: Uuid,
    /// Owning tenant
    pub tenant: String,
    /// Authenticated user
    pub user: String,
    /// Buffered outbound events
    pub events: EventRing,
    inbound_tx: mpsc::Sender<JsonRpcMessage>,
    inbound_rx: TokioMutex<mpsc::Receiver<JsonRpcMessage>>,
}

impl SseConnection {
    const INBOUND_DEPTH: usize = 64;

    fn new(ctx: SessionContext, capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(Self::INBOUND_DEPTH);
        Self {
            session_id: ctx.session_id,
            tenant: ctx.tenant,
            user: ctx.user,
            events: EventRing::new(capacity),
            inbound_tx,
            inbound_rx: TokioMutex::new(inbound_rx),
        }
    }

    /// Append an event to the ring. Returns the assigned id.
    pub fn publish(&self, event: &str, data: Value) -> u64 {
        self.events.publish(event, data)
    }

    /// Every buffered event with `id > after`.
    pub fn events_after(&self, after: u64) -> Vec<SseEvent> {
        self.events.events_after(after)
    }

    /// The full buffered ring, oldest first.
    pub fn replay_all(&self) -> Vec<SseEvent> {
        self.events.events_after(0)
    }

    /// Await the next event past the cursor; see [`EventRing::next_event`].
    pub async fn next_event(&self, cursor: &mut u64) -> Option<SseEvent> {
        self.events.next_event(cursor).await
    }

    /// Queue a client POST for the gateway side to `receive`.
    pub async fn inject(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::PeerClosed);
        }
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| TransportError::PeerClosed)
    }

    /// Events dropped to overflow so far.
    pub fn dropped_count(&self) -> u64 {
        self.events.dropped_count()
    }

    /// Highest id assigned so far.
    pub fn last_event_id(&self) -> u64 {
        self.events.last_event_id()
    }
}

#[async_trait]
impl TransportConnection for SseConnection {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Sse
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::PeerClosed);
        }
        let data = serde_json::to_value(&message)?;
        self.publish("message", data);
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
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.events.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> SessionContext {
        SessionContext::new(Uuid::new_v4(), "acme", "u1")
    }

    #[tokio::test]
    async fn ids_are_monotone_from_one() {
        let conn = SseConnection::new(ctx(), 8);
        assert_eq!(conn.publish("a", json!(1)), 1);
        assert_eq!(conn.publish("b", json!(2)), 2);
        assert_eq!(conn.last_event_id(), 2);
    }

    #[tokio::test]
    async fn replay_after_mark_is_ordered_and_gapless() {
        let conn = SseConnection::new(ctx(), 16);
        for i in 1..=5 {
            conn.publish("n", json!(i));
        }
        let replay = conn.events_after(3);
        let ids: Vec<_> = replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let conn = SseConnection::new(ctx(), 3);
        for i in 1..=5 {
            conn.publish("n", json!(i));
        }
        let ids: Vec<_> = conn.replay_all().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(conn.dropped_count(), 2);
    }

    #[tokio::test]
    async fn next_event_streams_in_order_then_ends_on_close() {
        let conn = Arc::new(SseConnection::new(ctx(), 8));
        conn.publish("n", json!(1));
        conn.publish("n", json!(2));

        let mut cursor = 0;
        assert_eq!(conn.next_event(&mut cursor).await.unwrap().id, 1);
        assert_eq!(conn.next_event(&mut cursor).await.unwrap().id, 2);

        // Publish from another task while the stream is parked.
        let publisher = Arc::clone(&conn);
        let waiter = tokio::spawn(async move {
            let mut cursor = 2;
            publisher.next_event(&mut cursor).await.map(|e| e.id)
        });
        tokio::task::yield_now().await;
        conn.publish("n", json!(3));
        assert_eq!(waiter.await.unwrap(), Some(3));

        conn.close().await.unwrap();
        let mut cursor = 3;
        assert!(conn.next_event(&mut cursor).await.is_none());
    }

    #[tokio::test]
    async fn closed_ring_still_drains_buffered_events() {
        let conn = SseConnection::new(ctx(), 8);
        conn.publish("n", json!(1));
        conn.close().await.unwrap();

        let mut cursor = 0;
        assert_eq!(conn.next_event(&mut cursor).await.unwrap().id, 1);
        assert!(conn.next_event(&mut cursor).await.is_none());
    }

    #[tokio::test]
    async fn broadcast_respects_scope() {
        let transport = SseTransport::new(8);
        let mut a_ctx = ctx();
        a_ctx.tenant = "acme".into();
        let a = transport.create_session(a_ctx).await.unwrap();
        let mut b_ctx = ctx();
        b_ctx.tenant = "other".into();
        b_ctx.user = "u2".into();
        let _b = transport.create_session(b_ctx).await.unwrap();

        let reached = transport.broadcast(
            "notice",
            &json!({"x": 1}),
            &BroadcastScope::Tenant("acme".into()),
        );
        assert_eq!(reached, 1);

        let conn = transport.connection(a.session_id()).unwrap();
        assert_eq!(conn.replay_all().len(), 1);
        assert_eq!(transport.broadcast("notice", &json!(2), &BroadcastScope::All), 2);
    }

    #[tokio::test]
    async fn send_wraps_message_as_event() {
        let conn = SseConnection::new(ctx(), 8);
        conn.send(JsonRpcMessage::Notification(
            meshgate_protocol::JsonRpcNotification::new("x", None),
        ))
        .await
        .unwrap();
        let events = conn.replay_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data["method"], json!("x"));
    }
}
