//! SSE handlers: `/sse`, `/sse/events`, `/sse/broadcast`,
//! `/sse/replay/{session_id}`.

use std::convert::Infallible;

use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use meshgate_transport::sse::SseEvent;
use meshgate_transport::{BroadcastScope, CreateConnection, TransportConnection, TransportType};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

use super::middleware::RequestContext;
use super::state::AppState;

fn wire_event(event: &SseEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.event.clone())
        .data(event.data.to_string())
}

fn last_event_id(headers: &HeaderMap) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|h| h.to_str().ok())
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Open an SSE session and stream its ring from the client's mark.
/// Buffered events newer than `Last-Event-ID` replay in order before any
/// new event reaches the wire.
pub(crate) async fn open_sse(
    state: AppState,
    context: RequestContext,
    backend_id: Option<Uuid>,
    headers: HeaderMap,
) -> GatewayResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (conn, _) = state
        .manager
        .create_connection(CreateConnection {
            transport: TransportType::Sse,
            tenant: context.tenant.clone(),
            user: context.user.clone(),
            backend_id,
            namespace: None,
            client_id: None,
            launch: None,
        })
        .await?;
    let session_id = conn.session_id();
    info!(session_id = %session_id, "sse stream opened");

    let sse_conn = state
        .manager
        .sse()
        .connection(session_id)
        .ok_or_else(|| GatewayError::Internal("sse connection missing".to_string()))?;

    let mut cursor = last_event_id(&headers);
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data(
            json!({
                "session_id": session_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })
            .to_string(),
        ));
        // next_event drains everything buffered past the cursor before
        // parking, which is exactly the replay contract.
        while let Some(event) = sse_conn.next_event(&mut cursor).await {
            yield Ok(wire_event(&event));
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /sse` — open a stream; honours `Last-Event-ID`.
pub async fn get_sse(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
) -> Response {
    match open_sse(state, context, None, headers).await {
        Ok(stream) => stream.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Body for `POST /sse/events`.
#[derive(Debug, Deserialize)]
pub struct SseEventRequest {
    /// Event name
    pub event: String,
    /// Event payload
    pub data: Value,
    /// Deliver to one session; broadcast to all when unset
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

/// `POST /sse/events` — dispatch one event.
pub async fn post_sse_events(
    State(state): State<AppState>,
    Json(body): Json<SseEventRequest>,
) -> Response {
    match body.session_id {
        Some(session_id) => match state.manager.sse().connection(session_id) {
            Some(conn) => {
                let event_id = conn.publish(&body.event, body.data);
                Json(json!({ "delivered": 1, "event_id": event_id })).into_response()
            }
            None => GatewayError::NotFound(format!("sse session {session_id}")).into_response(),
        },
        None => {
            let reached = state
                .manager
                .sse()
                .broadcast(&body.event, &body.data, &BroadcastScope::All);
            Json(json!({ "delivered": reached })).into_response()
        }
    }
}

/// Body for `POST /sse/broadcast`.
#[derive(Debug, Deserialize)]
pub struct SseBroadcastRequest {
    /// Event name
    pub event: String,
    /// Event payload
    pub data: Value,
    /// Scope predicate; every session when unset
    #[serde(default)]
    pub filter: Option<BroadcastScope>,
}

/// `POST /sse/broadcast` — fan an event out to every session in scope.
pub async fn post_sse_broadcast(
    State(state): State<AppState>,
    Json(body): Json<SseBroadcastRequest>,
) -> Response {
    let scope = body.filter.unwrap_or_default();
    let reached = state.manager.sse().broadcast(&body.event, &body.data, &scope);
    Json(json!({ "delivered": reached })).into_response()
}

/// `GET /sse/replay/{session_id}` — the buffered ring from the start.
pub async fn get_sse_replay(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Response {
    match state.manager.sse().connection(session_id) {
        Some(conn) => Json(json!({
            "session_id": session_id,
            "events": conn.replay_all(),
            "dropped": conn.dropped_count(),
        }))
        .into_response(),
        None => GatewayError::NotFound(format!("sse session {session_id}")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_event_id_parses_or_defaults() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers), 0);
        headers.insert("last-event-id", "17".parse().unwrap());
        assert_eq!(last_event_id(&headers), 17);
        headers.insert("last-event-id", "junk".parse().unwrap());
        assert_eq!(last_event_id(&headers), 0);
    }
}
