//! WebSocket transport.
//!
//! Full-duplex JSON-RPC text frames over an upgraded socket. The gateway
//! pings on an interval and expects each pong within half that interval;
//! two consecutive missed deadlines end the session with an error.
//! Outbound traffic goes through a bounded queue —
//! a slow consumer that fills it gets the session closed with a
//! server-overloaded protocol error instead of stalling the gateway.
//! Frames within a session stay strictly ordered in both directions.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use meshgate_protocol::jsonrpc::ERROR_SERVER_OVERLOADED;
use meshgate_protocol::JsonRpcMessage;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::core::{
    BroadcastScope, SessionContext, Transport, TransportConnection, TransportError,
    TransportResult, TransportType,
};

/// WebSocket transport tunables.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Interval between server pings; each pong is due within half of it
    pub ping_interval: Duration,
    /// Bounded outbound queue depth per connection
    pub send_queue_depth: usize,
    /// Consecutive missed pong deadlines tolerated before the session
    /// errors
    pub max_missed_pongs: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            send_queue_depth: 64,
            max_missed_pongs: 2,
        }
    }
}

/// How a socket pump ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsExit {
    /// Peer closed or the gateway closed gracefully
    Closed,
    /// Heartbeat or protocol failure
    Errored(String),
}

#[derive(Debug)]
enum OutboundFrame {
    Text(String),
    Ping,
    Close,
}

/// The WebSocket transport: registry of live duplex connections.
#[derive(Debug)]
pub struct WsTransport {
    connections: DashMap<Uuid, Arc<WsConnection>>,
    config: WsConfig,
}

impl WsTransport {
    /// Create the transport.
    pub fn new(config: WsConfig) -> Self {
        Self {
            connections: DashMap::new(),
            config,
        }
    }

    /// Look up a live connection.
    pub fn connection(&self, session_id: Uuid) -> Option<Arc<WsConnection>> {
        self.connections.get(&session_id).map(|c| Arc::clone(&c))
    }

    /// Drop a connection from the registry.
    pub fn remove(&self, session_id: Uuid) {
        self.connections.remove(&session_id);
    }

    /// Fan a message out to every session in scope. Sessions whose queue is
    /// full are closed rather than skipped silently. Returns sessions
    /// reached.
    pub async fn broadcast(&self, message: &Value, scope: &BroadcastScope) -> usize {
        let targets: Vec<Arc<WsConnection>> = self
            .connections
            .iter()
            .filter(|e| {
                let c = e.value();
                c.is_open() && scope.matches(c.session_id, &c.tenant, &c.user)
            })
            .map(|e| Arc::clone(e.value()))
            .collect();

        let text = message.to_string();
        let mut reached = 0;
        for conn in targets {
            match conn.send_text(text.clone()) {
                Ok(()) => reached += 1,
                Err(TransportError::Protocol { .. }) => {
                    warn!(session_id = %conn.session_id, "broadcast overflow, session closed");
                }
                Err(_) => {}
            }
        }
        reached
    }

    /// Queue a ping toward one session.
    pub fn ping(&self, session_id: Uuid) -> TransportResult<()> {
        let conn = self
            .connection(session_id)
            .ok_or(TransportError::PeerClosed)?;
        conn.enqueue(OutboundFrame::Ping)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(WsConfig::default())
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    async fn create_session(
        &self,
        ctx: SessionContext,
    ) -> TransportResult<Arc<dyn TransportConnection>> {
        let conn = Arc::new(WsConnection::new(ctx, &self.config));
        self.connections.insert(conn.session_id, Arc::clone(&conn));
        debug!(session_id = %conn.session_id, "websocket session registered");
        Ok(conn)
    }
}

/// One duplex WebSocket session.
#[derive(Debug)]
pub struct WsConnection {
    /// Owning session
    pub session_id: Uuid,
    /// Owning tenant
    pub tenant: String,
    /// Authenticated user
    pub user: String,
    config: WsConfig,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    outbound_rx: TokioMutex<Option<mpsc::Receiver<OutboundFrame>>>,
    inbound_tx: mpsc::Sender<JsonRpcMessage>,
    inbound_rx: TokioMutex<mpsc::Receiver<JsonRpcMessage>>,
    open: AtomicBool,
    pong_seen: AtomicBool,
    missed_pongs: AtomicU32,
    closed: Notify,
}

impl WsConnection {
    const INBOUND_DEPTH: usize = 64;

    fn new(ctx: SessionContext, config: &WsConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(Self::INBOUND_DEPTH);
        Self {
            session_id: ctx.session_id,
            tenant: ctx.tenant,
            user: ctx.user,
            config: config.clone(),
            outbound_tx,
            outbound_rx: TokioMutex::new(Some(outbound_rx)),
            inbound_tx,
            inbound_rx: TokioMutex::new(inbound_rx),
            open: AtomicBool::new(true),
            pong_seen: AtomicBool::new(false),
            missed_pongs: AtomicU32::new(0),
            closed: Notify::new(),
        }
    }

    fn enqueue(&self, frame: OutboundFrame) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::PeerClosed);
        }
        match self.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A consumer that cannot drain its queue forfeits the
                // session; stalling the gateway is not an option.
                self.open.store(false, Ordering::Release);
                Err(TransportError::protocol(
                    ERROR_SERVER_OVERLOADED,
                    "outbound queue full, session closed",
                ))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::PeerClosed),
        }
    }

    /// Queue a text frame toward the client.
    pub fn send_text(&self, text: String) -> TransportResult<()> {
        self.enqueue(OutboundFrame::Text(text))
    }

    /// Unanswered pings so far.
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    /// Drive the socket until the session ends. Owns the upgrade: one
    /// writer loop (outbound frames + heartbeat) and one reader loop,
    /// joined at exit. Ordering within each direction is the channel order.
    pub async fn attach(self: &Arc<Self>, socket: WebSocket) -> WsExit {
        let (sink, stream) = socket.split();
        self.run_pumps(sink, stream).await
    }

    /// The pump bodies, generic over the socket halves so the heartbeat
    /// machinery is drivable without an upgraded socket.
    async fn run_pumps<S, R>(self: &Arc<Self>, sink: S, stream: R) -> WsExit
    where
        S: Sink<WsMessage> + Unpin + Send + 'static,
        R: Stream<Item = Result<WsMessage, axum::Error>> + Unpin + Send + 'static,
    {
        let Some(mut outbound_rx) = self.outbound_rx.lock().await.take() else {
            return WsExit::Errored("socket already attached".to_string());
        };
        let mut sink = sink;
        let mut stream = stream;

        let writer = {
            let conn = Arc::clone(self);
            tokio::spawn(async move {
                // Pings go out every `ping_interval`, starting at connect.
                // Each ping arms its own half-interval pong deadline; an
                // unanswered deadline is one miss, and a timely pong
                // clears the streak.
                let pong_wait = conn.config.ping_interval / 2;
                let mut ticker = tokio::time::interval(conn.config.ping_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let pong_deadline = tokio::time::sleep(pong_wait);
                tokio::pin!(pong_deadline);
                let mut awaiting_pong = false;
                loop {
                    tokio::select! {
                        // Close must win even when the queue is full.
                        _ = conn.closed.notified() => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return WsExit::Closed;
                        }
                        frame = outbound_rx.recv() => match frame {
                            Some(OutboundFrame::Text(text)) => {
                                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                                    return WsExit::Closed;
                                }
                            }
                            Some(OutboundFrame::Ping) => {
                                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                                    return WsExit::Closed;
                                }
                            }
                            Some(OutboundFrame::Close) | None => {
                                let _ = sink.send(WsMessage::Close(None)).await;
                                return WsExit::Closed;
                            }
                        },
                        _ = ticker.tick() => {
                            // A pong from before this ping does not count
                            // toward the new deadline.
                            conn.pong_seen.store(false, Ordering::Release);
                            if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                                return WsExit::Closed;
                            }
                            awaiting_pong = true;
                            pong_deadline
                                .as_mut()
                                .reset(tokio::time::Instant::now() + pong_wait);
                        }
                        _ = &mut pong_deadline, if awaiting_pong => {
                            awaiting_pong = false;
                            if conn.pong_seen.swap(false, Ordering::AcqRel) {
                                conn.missed_pongs.store(0, Ordering::Relaxed);
                            } else {
                                let missed = conn.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1;
                                if missed >= conn.config.max_missed_pongs {
                                    warn!(session_id = %conn.session_id, missed, "heartbeat lost");
                                    return WsExit::Errored("heartbeat lost".to_string());
                                }
                            }
                        }
                    }
                }
            })
        };

        let reader = {
            let conn = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            match serde_json::from_str::<JsonRpcMessage>(&text) {
                                Ok(message) => {
                                    if conn.inbound_tx.send(message).await.is_err() {
                                        return WsExit::Closed;
                                    }
                                }
                                Err(e) => {
                                    trace!(session_id = %conn.session_id, "bad frame: {e}");
                                    return WsExit::Errored(format!("unparseable frame: {e}"));
                                }
                            }
                        }
                        Ok(WsMessage::Pong(_)) => {
                            conn.pong_seen.store(true, Ordering::Release);
                        }
                        Ok(WsMessage::Ping(_)) => {
                            // axum answers pings at the protocol layer.
                        }
                        Ok(WsMessage::Close(_)) => return WsExit::Closed,
                        Ok(WsMessage::Binary(_)) => {
                            trace!(session_id = %conn.session_id, "binary frame ignored");
                        }
                        Err(e) => return WsExit::Errored(e.to_string()),
                    }
                }
                WsExit::Closed
            })
        };

        let mut writer = writer;
        let mut reader = reader;
        let exit = tokio::select! {
            w = &mut writer => w.unwrap_or(WsExit::Closed),
            r = &mut reader => r.unwrap_or(WsExit::Closed),
        };
        writer.abort();
        reader.abort();
        self.open.store(false, Ordering::Release);
        exit
    }
}

#[async_trait]
impl TransportConnection for WsConnection {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        let text = serde_json::to_string(&message)?;
        self.send_text(text)
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        if !self.is_open() {
            return Ok(None);
        }
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound_tx.try_send(OutboundFrame::Close);
            self.closed.notify_waiters();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_protocol::{JsonRpcRequest, RequestId};
    use serde_json::json;

    fn ctx() -> SessionContext {
        SessionContext {
            session_id: Uuid::new_v4(),
            tenant: "acme".into(),
            user: "u1".into(),
            backend_id: None,
            launch: None,
        }
    }

    #[tokio::test]
    async fn queue_overflow_closes_session_with_overload() {
        let config = WsConfig {
            send_queue_depth: 2,
            ..Default::default()
        };
        let conn = WsConnection::new(ctx(), &config);
        conn.send_text("a".into()).unwrap();
        conn.send_text("b".into()).unwrap();
        let err = conn.send_text("c".into()).unwrap_err();
        assert!(
            matches!(err, TransportError::Protocol { code, .. } if code == ERROR_SERVER_OVERLOADED)
        );
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let conn = WsConnection::new(ctx(), &WsConfig::default());
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(JsonRpcMessage::Request(JsonRpcRequest::new(
                "ping",
                None,
                RequestId::from(1)
            )))
            .await,
            Err(TransportError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn broadcast_scopes_by_tenant() {
        let transport = WsTransport::default();
        let a = transport.create_session(ctx()).await.unwrap();
        let mut other = ctx();
        other.tenant = "other".into();
        let _b = transport.create_session(other).await.unwrap();

        let reached = transport
            .broadcast(&json!({"jsonrpc":"2.0","method":"note"}), &BroadcastScope::Tenant("acme".into()))
            .await;
        assert_eq!(reached, 1);
        assert!(transport.connection(a.session_id()).is_some());
    }

    #[tokio::test]
    async fn ping_to_unknown_session_fails() {
        let transport = WsTransport::default();
        assert!(matches!(
            transport.ping(Uuid::new_v4()),
            Err(TransportError::PeerClosed)
        ));
    }

    mod heartbeat {
        use super::*;
        use futures::channel::mpsc as futures_mpsc;
        use tokio::task::JoinHandle;

        const PING_INTERVAL: Duration = Duration::from_secs(10);

        type SinkRx = futures_mpsc::UnboundedReceiver<WsMessage>;
        type StreamTx = futures_mpsc::UnboundedSender<Result<WsMessage, axum::Error>>;

        fn pump(conn: &Arc<WsConnection>) -> (JoinHandle<WsExit>, SinkRx, StreamTx) {
            let (sink_tx, sink_rx) = futures_mpsc::unbounded::<WsMessage>();
            let (stream_tx, stream_rx) =
                futures_mpsc::unbounded::<Result<WsMessage, axum::Error>>();
            let handle = {
                let conn = Arc::clone(conn);
                tokio::spawn(async move { conn.run_pumps(sink_tx, stream_rx).await })
            };
            (handle, sink_rx, stream_tx)
        }

        async fn next_ping(sink_rx: &mut SinkRx) {
            loop {
                match sink_rx.next().await {
                    Some(WsMessage::Ping(_)) => return,
                    Some(_) => {}
                    None => panic!("pump ended before a ping went out"),
                }
            }
        }

        #[tokio::test(start_paused = true)]
        async fn unanswered_deadlines_error_the_session_after_two_misses() {
            let config = WsConfig {
                ping_interval: PING_INTERVAL,
                ..Default::default()
            };
            let conn = Arc::new(WsConnection::new(ctx(), &config));
            // Keep the stream sender alive so the peer never hangs up; it
            // just never answers a ping.
            let (handle, mut sink_rx, _stream_tx) = pump(&conn);

            let started = tokio::time::Instant::now();
            let exit = handle.await.unwrap();
            assert_eq!(exit, WsExit::Errored("heartbeat lost".to_string()));
            assert_eq!(conn.missed_pongs(), 2);
            // Pings at 0 and P, deadlines at P/2 and 3P/2: the second miss
            // lands at one and a half intervals, not two.
            assert!(started.elapsed() < 2 * PING_INTERVAL);

            let mut pings = 0;
            while let Ok(Some(frame)) = sink_rx.try_next() {
                if matches!(frame, WsMessage::Ping(_)) {
                    pings += 1;
                }
            }
            assert_eq!(pings, 2);
        }

        #[tokio::test(start_paused = true)]
        async fn timely_pong_resets_the_miss_streak() {
            let config = WsConfig {
                ping_interval: PING_INTERVAL,
                ..Default::default()
            };
            let conn = Arc::new(WsConnection::new(ctx(), &config));
            let (handle, mut sink_rx, stream_tx) = pump(&conn);

            // Leave the first ping unanswered: one miss on the books.
            next_ping(&mut sink_rx).await;
            next_ping(&mut sink_rx).await;
            assert_eq!(conn.missed_pongs(), 1);

            // Answer the second ping inside its half-interval deadline.
            stream_tx
                .unbounded_send(Ok(WsMessage::Pong(Vec::new().into())))
                .unwrap();
            for _ in 0..8 {
                if conn.missed_pongs() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            assert_eq!(conn.missed_pongs(), 0);

            // Hanging up cleanly ends the session as closed, not errored.
            drop(stream_tx);
            assert_eq!(handle.await.unwrap(), WsExit::Closed);
        }
    }
}
