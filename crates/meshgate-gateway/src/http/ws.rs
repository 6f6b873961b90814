//! WebSocket handlers: `/ws` plus the administrative helpers.

use axum::extract::ws::WebSocket;
use axum::extract::{Extension, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use meshgate_protocol::JsonRpcMessage;
use meshgate_transport::websocket::WsExit;
use meshgate_transport::{
    BroadcastScope, CreateConnection, SessionState, TransportConnection, TransportType,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::proxy::RouteTarget;

use super::middleware::RequestContext;
use super::state::AppState;

/// `GET /ws` — upgrade to a duplex JSON-RPC session.
pub async fn get_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
) -> Response {
    upgrade_ws(ws, state, context, None).await
}

pub(crate) async fn upgrade_ws(
    ws: WebSocketUpgrade,
    state: AppState,
    context: RequestContext,
    backend_id: Option<Uuid>,
) -> Response {
    let created = state
        .manager
        .create_connection(CreateConnection {
            transport: TransportType::WebSocket,
            tenant: context.tenant.clone(),
            user: context.user.clone(),
            backend_id,
            namespace: None,
            client_id: None,
            launch: None,
        })
        .await;
    let (conn, _) = match created {
        Ok(created) => created,
        Err(e) => return GatewayError::from(e).into_response(),
    };
    let session_id = conn.session_id();
    info!(session_id = %session_id, "websocket session accepted");

    ws.on_upgrade(move |socket| serve_ws(state, context, session_id, backend_id, socket))
}

/// Drive one upgraded socket: a router task turns inbound requests into
/// proxied calls while the transport pumps frames; the session ends when
/// either side stops.
async fn serve_ws(
    state: AppState,
    context: RequestContext,
    session_id: Uuid,
    backend_id: Option<Uuid>,
    socket: WebSocket,
) {
    let Some(conn) = state.manager.websocket().connection(session_id) else {
        warn!(session_id = %session_id, "websocket connection vanished before upgrade");
        return;
    };

    let router = {
        let conn = conn.clone();
        let state = state.clone();
        let target = backend_id.map(RouteTarget::server).unwrap_or_default();
        tokio::spawn(async move {
            loop {
                let message = match conn.receive().await {
                    Ok(Some(message)) => message,
                    Ok(None) | Err(_) => break,
                };
                let _ = state.manager.store().touch(session_id);
                match message {
                    JsonRpcMessage::Request(request) => {
                        let id = request.id.clone();
                        let response = match state
                            .proxy
                            .route(
                                &target,
                                request,
                                Some(&context.client_ip),
                                &context.request_id,
                            )
                            .await
                        {
                            Ok(routed) => routed.response,
                            Err(e) => {
                                meshgate_protocol::JsonRpcResponse::error(e.to_jsonrpc(), id)
                            }
                        };
                        if conn
                            .send(JsonRpcMessage::Response(response))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    JsonRpcMessage::Notification(note) => {
                        debug!(method = %note.method, "client notification dropped at gateway");
                    }
                    other => {
                        debug!(?other, "unexpected client frame ignored");
                    }
                }
            }
        })
    };

    let exit = conn.attach(socket).await;
    router.abort();
    let outcome = match exit {
        WsExit::Closed => SessionState::Closed,
        WsExit::Errored(reason) => {
            warn!(session_id = %session_id, reason, "websocket session errored");
            SessionState::Error
        }
    };
    state.manager.close_with(session_id, outcome).await;
    info!(session_id = %session_id, "websocket session ended");
}

/// Body for `POST /ws/send`.
#[derive(Debug, Deserialize)]
pub struct WsSendRequest {
    /// Target session
    pub session_id: Uuid,
    /// JSON-RPC message to deliver
    pub message: JsonRpcMessage,
}

/// `POST /ws/send` — server-originated delivery to one session.
pub async fn post_ws_send(
    State(state): State<AppState>,
    Json(body): Json<WsSendRequest>,
) -> Response {
    match state.manager.send(body.session_id, body.message).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

/// Body for `POST /ws/broadcast`.
#[derive(Debug, Deserialize)]
pub struct WsBroadcastRequest {
    /// JSON payload sent as one text frame to every session in scope
    pub message: Value,
    /// Scope predicate; every session when unset
    #[serde(default)]
    pub filter: Option<BroadcastScope>,
}

/// `POST /ws/broadcast` — fan a frame out to every session in scope.
pub async fn post_ws_broadcast(
    State(state): State<AppState>,
    Json(body): Json<WsBroadcastRequest>,
) -> Response {
    let scope = body.filter.unwrap_or_default();
    let reached = state.manager.websocket().broadcast(&body.message, &scope).await;
    Json(json!({ "delivered": reached })).into_response()
}

/// Body for `POST /ws/ping`.
#[derive(Debug, Deserialize)]
pub struct WsPingRequest {
    /// Target session
    pub session_id: Uuid,
}

/// `POST /ws/ping` — queue a protocol ping toward one session.
pub async fn post_ws_ping(
    State(state): State<AppState>,
    Json(body): Json<WsPingRequest>,
) -> Response {
    match state.manager.websocket().ping(body.session_id) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

/// Query for `DELETE /ws/close`.
#[derive(Debug, Deserialize)]
pub struct WsCloseQuery {
    /// Target session
    pub session_id: Uuid,
}

/// `DELETE /ws/close` — close one session.
pub async fn delete_ws_close(
    State(state): State<AppState>,
    Query(query): Query<WsCloseQuery>,
) -> Response {
    if state.manager.close(query.session_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        GatewayError::NotFound(format!("session {}", query.session_id)).into_response()
    }
}
