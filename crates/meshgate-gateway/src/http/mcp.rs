//! Streamable-HTTP handlers: `/mcp`, `/mcp/capabilities`, `/mcp/status`.
//!
//! One endpoint accepts GET and POST. Session affinity rides the
//! `Mcp-Session-Id` header; requests without a token get a session on
//! demand. A POST answers with one JSON object, or with an SSE stream
//! when the client negotiates `text/event-stream` (or hints
//! `stream_mode: "sse"` in a pass-through body).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use meshgate_protocol::types::methods;
use meshgate_protocol::{InitializeResult, JsonRpcMessage, JsonRpcResponse};
use meshgate_transport::streamable::{StreamMode, StreamableConnection, SESSION_HEADER};
use meshgate_transport::{CreateConnection, TransportConnection, TransportType};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::RouteTarget;

use super::middleware::RequestContext;
use super::state::AppState;

const GATEWAY_NAME: &str = "meshgate";

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|h| h.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

fn session_token(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|raw| raw.parse().ok())
}

/// Resume the session named by the header, or create one on demand.
pub(crate) async fn resolve_session(
    state: &AppState,
    context: &RequestContext,
    headers: &HeaderMap,
    backend_id: Option<Uuid>,
) -> GatewayResult<Arc<StreamableConnection>> {
    if let Some(session_id) = session_token(headers) {
        if let Some(conn) = state.manager.streamable().connection(session_id) {
            if conn.is_open() {
                let _ = state.manager.store().touch(session_id);
                return Ok(conn);
            }
        }
        return Err(GatewayError::NotFound(format!(
            "streamable session {session_id}"
        )));
    }

    let (conn, _) = state
        .manager
        .create_connection(CreateConnection {
            transport: TransportType::Streamable,
            tenant: context.tenant.clone(),
            user: context.user.clone(),
            backend_id,
            namespace: None,
            client_id: None,
            launch: None,
        })
        .await?;
    let session_id = conn.session_id();
    info!(session_id = %session_id, "streamable session created");
    state
        .manager
        .streamable()
        .connection(session_id)
        .ok_or_else(|| GatewayError::Internal("streamable connection missing".to_string()))
}

fn with_session_header(mut response: Response, session_id: Uuid) -> Response {
    if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn event_stream(
    conn: Arc<StreamableConnection>,
    mut cursor: u64,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(event) = conn.next_event(&mut cursor).await {
            yield Ok(Event::default()
                .id(event.id.to_string())
                .event(event.event.clone())
                .data(event.data.to_string()));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /mcp` — open or resume a session. With `Accept:
/// text/event-stream` the response is the session's event stream
/// (honouring `Last-Event-ID`); otherwise a JSON session descriptor.
pub async fn get_mcp(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
) -> Response {
    handle_get(state, context, headers, None).await
}

pub(crate) async fn handle_get(
    state: AppState,
    context: RequestContext,
    headers: HeaderMap,
    backend_id: Option<Uuid>,
) -> Response {
    let conn = match resolve_session(&state, &context, &headers, backend_id).await {
        Ok(conn) => conn,
        Err(e) => return e.into_response(),
    };
    let session_id = conn.session_id;

    if accepts_event_stream(&headers) {
        let cursor = headers
            .get("last-event-id")
            .and_then(|h| h.to_str().ok())
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let response = event_stream(conn, cursor).into_response();
        return with_session_header(response, session_id);
    }

    let response = Json(json!({
        "session_id": session_id,
        "protocol_version": meshgate_protocol::PROTOCOL_VERSION,
        "transport": "streamable",
    }))
    .into_response();
    with_session_header(response, session_id)
}

/// Pass-through body for non-JSON-RPC POSTs: an explicit HTTP exchange to
/// forward to a backend.
#[derive(Debug, Deserialize)]
pub(crate) struct PassThroughBody {
    /// HTTP method for the upstream exchange
    pub method: String,
    /// Upstream path
    #[serde(default)]
    pub path: String,
    /// Extra headers to forward
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Upstream body
    #[serde(default)]
    pub body: Option<Value>,
    /// Whether the exchange should keep session affinity
    #[serde(default)]
    pub stateful: bool,
    /// JSON-or-stream hint
    #[serde(default)]
    pub stream_mode: StreamMode,
}

/// `POST /mcp` — one MCP exchange.
pub async fn post_mcp(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    handle_post(state, context, headers, body, None).await
}

pub(crate) async fn handle_post(
    state: AppState,
    context: RequestContext,
    headers: HeaderMap,
    body: String,
    backend_id: Option<Uuid>,
) -> Response {
    let conn = match resolve_session(&state, &context, &headers, backend_id).await {
        Ok(conn) => conn,
        Err(e) => return e.into_response(),
    };
    let session_id = conn.session_id;
    let target = backend_id
        .map(RouteTarget::server)
        .unwrap_or_else(|| super::rpc::target_from_headers(&headers));

    // The wire carries either a plain JSON-RPC message (the MCP protocol)
    // or an explicit pass-through descriptor.
    if let Ok(message) = serde_json::from_str::<JsonRpcMessage>(&body) {
        let response =
            handle_mcp_message(&state, &context, &conn, &headers, target, message).await;
        return with_session_header(response, session_id);
    }
    match serde_json::from_str::<PassThroughBody>(&body) {
        Ok(pass) => {
            let response = handle_pass_through(&state, &context, &conn, target, pass).await;
            with_session_header(response, session_id)
        }
        Err(e) => GatewayError::Validation(format!("unrecognized body: {e}")).into_response(),
    }
}

async fn handle_mcp_message(
    state: &AppState,
    context: &RequestContext,
    conn: &Arc<StreamableConnection>,
    headers: &HeaderMap,
    target: RouteTarget,
    message: JsonRpcMessage,
) -> Response {
    match message {
        JsonRpcMessage::Request(request) => {
            let id = request.id.clone();
            // The gateway terminates the initialize exchange itself.
            let response = if request.method == methods::INITIALIZE {
                JsonRpcResponse::success(
                    serde_json::to_value(InitializeResult::gateway(
                        GATEWAY_NAME,
                        env!("CARGO_PKG_VERSION"),
                    ))
                    .unwrap_or(Value::Null),
                    id,
                )
            } else {
                match state
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
                    Err(e) => JsonRpcResponse::error(e.to_jsonrpc(), id),
                }
            };

            if accepts_event_stream(headers) {
                // Stream mode: the response rides the event stream.
                let mark = conn.events.last_event_id();
                let _ = conn.send(JsonRpcMessage::Response(response)).await;
                let conn = Arc::clone(conn);
                let stream = async_stream::stream! {
                    let mut cursor = mark;
                    if let Some(event) = conn.next_event(&mut cursor).await {
                        yield Ok::<_, Infallible>(Event::default()
                            .id(event.id.to_string())
                            .event(event.event.clone())
                            .data(event.data.to_string()));
                    }
                };
                Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
            } else {
                Json(response).into_response()
            }
        }
        JsonRpcMessage::Notification(note) => {
            debug!(method = %note.method, "mcp notification accepted");
            StatusCode::ACCEPTED.into_response()
        }
        // Client-originated responses answer server-initiated requests on
        // the stream; queue them for whoever is listening.
        other => match conn.inject(other).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => GatewayError::from(e).into_response(),
        },
    }
}

async fn handle_pass_through(
    state: &AppState,
    context: &RequestContext,
    conn: &Arc<StreamableConnection>,
    target: RouteTarget,
    pass: PassThroughBody,
) -> Response {
    let result = state
        .proxy
        .forward_raw(
            &target,
            &pass.method,
            &pass.path,
            &pass.headers,
            pass.body,
            &context.request_id,
        )
        .await;
    let raw = match result {
        Ok(raw) => raw,
        Err(e) => return e.into_response(),
    };

    match pass.stream_mode {
        StreamMode::Sse => {
            let mark = conn.events.last_event_id();
            conn.events.publish(
                "response",
                json!({ "status": raw.status, "body": raw.body }),
            );
            event_stream(Arc::clone(conn), mark).into_response()
        }
        StreamMode::Json => Json(json!({
            "status": raw.status,
            "body": raw.body,
            "stateful": pass.stateful,
        }))
        .into_response(),
    }
}

/// `GET /mcp/capabilities` — what the gateway itself speaks.
pub async fn get_mcp_capabilities() -> Response {
    Json(InitializeResult::gateway(
        GATEWAY_NAME,
        env!("CARGO_PKG_VERSION"),
    ))
    .into_response()
}

/// `GET /mcp/status` — gateway-wide status: sessions, backends, limiter.
pub async fn get_mcp_status(State(state): State<AppState>) -> Response {
    let stats = state.manager.stats();
    let backends: Vec<Value> = state
        .registry
        .list(&Default::default())
        .into_iter()
        .map(|b| {
            json!({
                "id": b.id,
                "name": b.name,
                "status": b.status,
                "health": b.health,
            })
        })
        .collect();
    Json(json!({
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "sessions": stats,
        "backends": backends,
        "rate_limiter": state.limiter.state(),
    }))
    .into_response()
}
