//! Transport manager: one facade over the five transports.
//!
//! The manager owns the session store, a connection registry keyed by
//! session id, and the janitor that retires idle sessions. Callers create
//! connections by transport kind and afterwards address everything by
//! session id; the manager routes internally and enforces the global and
//! per-tenant session caps through the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meshgate_protocol::JsonRpcMessage;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{
    LaunchSpec, SessionContext, Transport, TransportConnection, TransportError, TransportResult,
    TransportType,
};
use crate::http::HttpTransport;
use crate::session::{
    NewSession, SessionError, SessionFilter, SessionLimits, SessionSnapshot, SessionState,
    SessionStore,
};
use crate::sse::SseTransport;
use crate::stdio::{StdioConfig, StdioTransport};
use crate::streamable::StreamableTransport;
use crate::websocket::{WsConfig, WsTransport};

/// Manager tunables.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Session capacity limits
    pub limits: SessionLimits,
    /// Idle ttl per transport kind; kinds without an entry are never
    /// collected by the janitor
    pub idle_ttls: HashMap<TransportType, Duration>,
    /// Janitor scan cadence
    pub janitor_interval: Duration,
    /// How long terminal records linger for status queries
    pub terminal_retention: Duration,
    /// SSE / streamable replay ring capacity
    pub ring_capacity: usize,
    /// WebSocket tunables
    pub websocket: WsConfig,
    /// STDIO bridge tunables
    pub stdio: StdioConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let mut idle_ttls = HashMap::new();
        idle_ttls.insert(TransportType::Http, Duration::from_secs(60));
        idle_ttls.insert(TransportType::Sse, Duration::from_secs(300));
        idle_ttls.insert(TransportType::WebSocket, Duration::from_secs(300));
        idle_ttls.insert(TransportType::Streamable, Duration::from_secs(300));
        idle_ttls.insert(TransportType::Stdio, Duration::from_secs(600));
        Self {
            limits: SessionLimits::default(),
            idle_ttls,
            janitor_interval: Duration::from_secs(30),
            terminal_retention: Duration::from_secs(300),
            ring_capacity: crate::sse::DEFAULT_RING_CAPACITY,
            websocket: WsConfig::default(),
            stdio: StdioConfig::default(),
        }
    }
}

/// Parameters for opening a connection.
#[derive(Debug, Clone)]
pub struct CreateConnection {
    /// Transport kind to open
    pub transport: TransportType,
    /// Owning tenant
    pub tenant: String,
    /// Authenticated user
    pub user: String,
    /// Bound backend, when routed to a specific server
    pub backend_id: Option<Uuid>,
    /// Namespace the request was addressed through
    pub namespace: Option<String>,
    /// Client-reported identifier
    pub client_id: Option<String>,
    /// Subprocess to spawn (STDIO only)
    pub launch: Option<LaunchSpec>,
}

/// Aggregate counters for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Non-terminal sessions
    pub live_sessions: usize,
    /// Non-terminal sessions by transport kind
    pub by_transport: HashMap<TransportType, usize>,
    /// Registered connection handles
    pub connections: usize,
}

/// The transport manager.
pub struct TransportManager {
    store: Arc<SessionStore>,
    connections: DashMap<Uuid, Arc<dyn TransportConnection>>,
    http: Arc<HttpTransport>,
    sse: Arc<SseTransport>,
    websocket: Arc<WsTransport>,
    streamable: Arc<StreamableTransport>,
    stdio: Arc<StdioTransport>,
    config: ManagerConfig,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("live_sessions", &self.store.live_count())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl TransportManager {
    /// Build the manager and its transports.
    pub fn new(config: ManagerConfig) -> Self {
        let store = Arc::new(SessionStore::new(config.limits.clone()));
        Self {
            http: Arc::new(HttpTransport::new()),
            sse: Arc::new(SseTransport::new(config.ring_capacity)),
            websocket: Arc::new(WsTransport::new(config.websocket.clone())),
            streamable: Arc::new(StreamableTransport::new(config.ring_capacity)),
            stdio: Arc::new(StdioTransport::new(
                config.stdio.clone(),
                Arc::clone(&store),
            )),
            store,
            connections: DashMap::new(),
            config,
        }
    }

    /// The shared session store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The SSE transport, for ring access and broadcast.
    pub fn sse(&self) -> &Arc<SseTransport> {
        &self.sse
    }

    /// The WebSocket transport, for broadcast and admin helpers.
    pub fn websocket(&self) -> &Arc<WsTransport> {
        &self.websocket
    }

    /// The streamable transport, for token-affine lookups.
    pub fn streamable(&self) -> &Arc<StreamableTransport> {
        &self.streamable
    }

    /// The STDIO bridge, for process status queries.
    pub fn stdio(&self) -> &Arc<StdioTransport> {
        &self.stdio
    }

    fn transport(&self, kind: TransportType) -> Arc<dyn Transport> {
        match kind {
            TransportType::Http => Arc::clone(&self.http) as Arc<dyn Transport>,
            TransportType::Sse => Arc::clone(&self.sse) as Arc<dyn Transport>,
            TransportType::WebSocket => Arc::clone(&self.websocket) as Arc<dyn Transport>,
            TransportType::Streamable => Arc::clone(&self.streamable) as Arc<dyn Transport>,
            TransportType::Stdio => Arc::clone(&self.stdio) as Arc<dyn Transport>,
        }
    }

    /// Open a connection: create the session record, open the transport
    /// side, and register the handle.
    pub async fn create_connection(
        &self,
        params: CreateConnection,
    ) -> Result<(Arc<dyn TransportConnection>, SessionSnapshot), ManagerError> {
        let session = self.store.create(NewSession {
            tenant: params.tenant.clone(),
            user: params.user.clone(),
            backend_id: params.backend_id,
            namespace: params.namespace,
            transport: params.transport,
            client_id: params.client_id,
        })?;

        let ctx = SessionContext {
            session_id: session.id,
            tenant: params.tenant,
            user: params.user,
            backend_id: params.backend_id,
            launch: params.launch,
        };

        let conn = match self.transport(params.transport).create_session(ctx).await {
            Ok(conn) => conn,
            Err(e) => {
                self.store.close(session.id, SessionState::Error);
                return Err(ManagerError::Transport(e));
            }
        };

        self.store
            .activate(session.id, Some(params.transport.to_string()))?;
        self.connections.insert(session.id, Arc::clone(&conn));
        let snapshot = self.store.get(session.id)?;
        debug!(session_id = %session.id, transport = %params.transport, "connection created");
        Ok((conn, snapshot))
    }

    /// Connection handle for a live session.
    pub fn connection(&self, session_id: Uuid) -> Option<Arc<dyn TransportConnection>> {
        self.connections.get(&session_id).map(|c| Arc::clone(&c))
    }

    /// Deliver one message toward the peer of a session.
    pub async fn send(&self, session_id: Uuid, message: JsonRpcMessage) -> TransportResult<()> {
        let conn = self
            .connection(session_id)
            .ok_or_else(|| TransportError::Unavailable(format!("no session {session_id}")))?;
        let _ = self.store.touch(session_id);
        conn.send(message).await
    }

    /// Next message from the peer of a session.
    pub async fn receive(&self, session_id: Uuid) -> TransportResult<Option<JsonRpcMessage>> {
        let conn = self
            .connection(session_id)
            .ok_or_else(|| TransportError::Unavailable(format!("no session {session_id}")))?;
        let message = conn.receive().await?;
        if message.is_some() {
            let _ = self.store.touch(session_id);
        }
        Ok(message)
    }

    /// Close a session with the given outcome. Idempotent; the connection
    /// handle is released exactly once.
    pub async fn close_with(&self, session_id: Uuid, outcome: SessionState) -> bool {
        // Remove-first makes concurrent closers race on the registry entry,
        // so only one of them tears the handle down.
        let conn = self.connections.remove(&session_id).map(|(_, c)| c);
        let transitioned = self.store.close(session_id, outcome);
        if let Some(conn) = conn {
            let kind = conn.transport_type();
            if let Err(e) = conn.close().await {
                warn!(session_id = %session_id, "close failed: {e}");
            }
            match kind {
                TransportType::Sse => self.sse.remove(session_id),
                TransportType::WebSocket => self.websocket.remove(session_id),
                TransportType::Streamable => self.streamable.remove(session_id),
                TransportType::Stdio => self.stdio.remove(session_id),
                TransportType::Http => {}
            }
        }
        transitioned
    }

    /// Close a session cleanly.
    pub async fn close(&self, session_id: Uuid) -> bool {
        self.close_with(session_id, SessionState::Closed).await
    }

    /// Snapshot every session matching the filter.
    pub fn list(&self, filter: &SessionFilter) -> Vec<SessionSnapshot> {
        self.store.list(filter)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> ManagerStats {
        let mut by_transport: HashMap<TransportType, usize> = HashMap::new();
        for snapshot in self.store.list(&SessionFilter::default()) {
            if !snapshot.state.is_terminal() {
                *by_transport.entry(snapshot.transport).or_default() += 1;
            }
        }
        ManagerStats {
            live_sessions: self.store.live_count(),
            by_transport,
            connections: self.connections.len(),
        }
    }

    /// Close every live session; used on shutdown. Children are reaped
    /// within the STDIO kill grace because close bounds each teardown.
    pub async fn shutdown(&self) {
        let ids = self.store.live_ids();
        info!(sessions = ids.len(), "closing all sessions");
        let closes = ids.into_iter().map(|id| self.close(id));
        futures::future::join_all(closes).await;
    }

    /// Run the janitor until `shutdown` flips. Idle sessions are closed;
    /// terminal records past retention are evicted.
    pub async fn run_janitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.janitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ttls: HashMap<TransportType, chrono::Duration> = self
            .config
            .idle_ttls
            .iter()
            .filter_map(|(k, v)| chrono::Duration::from_std(*v).ok().map(|d| (*k, d)))
            .collect();
        let retention = chrono::Duration::from_std(self.config.terminal_retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("janitor stopping");
                        return;
                    }
                }
            }
            let now = chrono::Utc::now();
            for id in self.store.idle_sessions(&ttls, now) {
                info!(session_id = %id, "closing idle session");
                self.close(id).await;
            }
            for id in self.store.terminal_before(now - retention) {
                self.store.evict(id);
            }
        }
    }
}

/// Errors from manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Session store refused the operation
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_protocol::{JsonRpcRequest, RequestId};

    fn manager() -> Arc<TransportManager> {
        Arc::new(TransportManager::new(ManagerConfig::default()))
    }

    fn params(transport: TransportType) -> CreateConnection {
        CreateConnection {
            transport,
            tenant: "acme".into(),
            user: "u1".into(),
            backend_id: None,
            namespace: None,
            client_id: None,
            launch: None,
        }
    }

    #[tokio::test]
    async fn create_registers_exactly_one_record_and_handle() {
        let manager = manager();
        let (conn, snapshot) = manager
            .create_connection(params(TransportType::Sse))
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(manager.stats().live_sessions, 1);
        assert_eq!(manager.stats().connections, 1);
        assert!(manager.connection(conn.session_id()).is_some());
    }

    #[tokio::test]
    async fn close_releases_handle_exactly_once() {
        let manager = manager();
        let (conn, _) = manager
            .create_connection(params(TransportType::Sse))
            .await
            .unwrap();
        let id = conn.session_id();

        assert!(manager.close(id).await);
        assert!(!manager.close(id).await);
        assert!(manager.connection(id).is_none());
        assert!(manager.sse().connection(id).is_none());
        assert_eq!(
            manager.store().get(id).unwrap().state,
            SessionState::Closed
        );
    }

    #[tokio::test]
    async fn concurrent_closes_tear_down_once() {
        let manager = manager();
        let (conn, _) = manager
            .create_connection(params(TransportType::WebSocket))
            .await
            .unwrap();
        let id = conn.session_id();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&manager);
                tokio::spawn(async move { m.close(id).await })
            })
            .collect();
        let mut transitions = 0;
        for task in tasks {
            if task.await.unwrap() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    async fn send_receive_route_by_session() {
        let manager = manager();
        let (_, snapshot) = manager
            .create_connection(params(TransportType::Sse))
            .await
            .unwrap();
        let id = snapshot.id;

        manager
            .send(
                id,
                JsonRpcMessage::Request(JsonRpcRequest::new("note", None, RequestId::from(1))),
            )
            .await
            .unwrap();
        let sse = manager.sse().connection(id).unwrap();
        assert_eq!(sse.replay_all().len(), 1);

        assert!(matches!(
            manager.send(Uuid::new_v4(), JsonRpcMessage::Request(JsonRpcRequest::new(
                "note", None, RequestId::from(2)
            ))).await,
            Err(TransportError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn session_cap_surfaces_exhausted() {
        let mut config = ManagerConfig::default();
        config.limits = SessionLimits {
            max_sessions: 1,
            max_sessions_per_tenant: 10,
        };
        let manager = Arc::new(TransportManager::new(config));
        manager
            .create_connection(params(TransportType::Http))
            .await
            .unwrap();
        let result = manager
            .create_connection(params(TransportType::Http))
            .await;
        let err = match result {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            ManagerError::Session(SessionError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let manager = manager();
        for _ in 0..5 {
            manager
                .create_connection(params(TransportType::Sse))
                .await
                .unwrap();
        }
        assert_eq!(manager.stats().live_sessions, 5);
        manager.shutdown().await;
        assert_eq!(manager.stats().live_sessions, 0);
        assert_eq!(manager.stats().connections, 0);
    }

    #[tokio::test]
    async fn janitor_closes_idle_sessions() {
        let mut config = ManagerConfig::default();
        config.janitor_interval = Duration::from_millis(20);
        config.idle_ttls = HashMap::from([(TransportType::Sse, Duration::from_millis(1))]);
        let manager = Arc::new(TransportManager::new(config));
        let (_, snapshot) = manager
            .create_connection(params(TransportType::Sse))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let janitor = tokio::spawn(Arc::clone(&manager).run_janitor(rx));

        for _ in 0..100 {
            if manager.store().get(snapshot.id).unwrap().state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.store().get(snapshot.id).unwrap().state.is_terminal());

        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), janitor).await;
    }
}
