//! STDIO bridge handlers: `/stdio/execute`, `/stdio/send`,
//! `/stdio/process`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::{Extension, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use meshgate_protocol::JsonRpcMessage;
use meshgate_transport::stdio::ProcessStatus;
use meshgate_transport::{
    CreateConnection, LaunchSpec, TransportConnection, TransportType,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

use super::middleware::RequestContext;
use super::state::AppState;

const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Body for `POST /stdio/execute`.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// Executable to run
    pub command: String,
    /// Arguments, in order
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides (applied over the inherited environment)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory
    #[serde(default)]
    pub dir: Option<String>,
    /// Exchange timeout like `"30s"` or plain seconds
    #[serde(default)]
    pub timeout: Option<String>,
}

fn parse_timeout(raw: Option<&str>) -> Duration {
    raw.and_then(|raw| {
        let trimmed = raw.trim().trim_end_matches('s');
        trimmed.parse::<u64>().ok().map(Duration::from_secs)
    })
    .unwrap_or(DEFAULT_EXCHANGE_TIMEOUT)
}

fn session_header(headers: &HeaderMap) -> GatewayResult<Uuid> {
    headers
        .get("x-session-id")
        .and_then(|h| h.to_str().ok())
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| GatewayError::Validation("missing or invalid X-Session-ID".to_string()))
}

/// `POST /stdio/execute` — spawn a subprocess backend and bind a session.
pub async fn post_stdio_execute(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Json(body): Json<ExecuteRequest>,
) -> Response {
    let exchange_timeout = parse_timeout(body.timeout.as_deref());
    debug!(?exchange_timeout, command = %body.command, "stdio execute");
    spawn_session(
        state,
        context,
        None,
        LaunchSpec {
            command: body.command,
            args: body.args,
            env: body.env,
            cwd: body.dir,
        },
    )
    .await
}

pub(crate) async fn spawn_session(
    state: AppState,
    context: RequestContext,
    backend_id: Option<Uuid>,
    launch: LaunchSpec,
) -> Response {
    let created = state
        .manager
        .create_connection(CreateConnection {
            transport: TransportType::Stdio,
            tenant: context.tenant,
            user: context.user,
            backend_id,
            namespace: None,
            client_id: None,
            launch: Some(launch),
        })
        .await;
    let (conn, _) = match created {
        Ok(created) => created,
        Err(e) => return GatewayError::from(e).into_response(),
    };
    let session_id = conn.session_id();

    let pid = state
        .manager
        .stdio()
        .connection(session_id)
        .and_then(|c| c.pid());
    info!(session_id = %session_id, pid = ?pid, "stdio session spawned");
    (
        StatusCode::CREATED,
        Json(json!({ "session_id": session_id, "pid": pid })),
    )
        .into_response()
}

/// `POST /stdio/send` — forward one MCP message to the subprocess. A
/// request waits for its paired response; a notification is
/// fire-and-forget.
pub async fn post_stdio_send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(message): Json<JsonRpcMessage>,
) -> Response {
    let session_id = match session_header(&headers) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let Some(conn) = state.manager.connection(session_id) else {
        return GatewayError::NotFound(format!("session {session_id}")).into_response();
    };

    match message {
        JsonRpcMessage::Request(request) => {
            let wanted = request.id.clone();
            if let Err(e) = conn.send(JsonRpcMessage::Request(request)).await {
                return GatewayError::from(e).into_response();
            }
            let _ = state.manager.store().touch(session_id);

            let started = Instant::now();
            loop {
                let Some(remaining) =
                    DEFAULT_EXCHANGE_TIMEOUT.checked_sub(started.elapsed())
                else {
                    return GatewayError::Timeout {
                        operation: "stdio send".to_string(),
                        timeout_ms: DEFAULT_EXCHANGE_TIMEOUT.as_millis() as u64,
                    }
                    .into_response();
                };
                let received = tokio::time::timeout(remaining, conn.receive()).await;
                match received {
                    Ok(Ok(Some(JsonRpcMessage::Response(response))))
                        if response.request_id() == Some(&wanted) =>
                    {
                        return Json(response).into_response();
                    }
                    Ok(Ok(Some(other))) => {
                        debug!(
                            method = other.method().unwrap_or("<response>"),
                            "unrelated frame while waiting for paired response"
                        );
                    }
                    Ok(Ok(None)) => {
                        return GatewayError::upstream_transient("stdio backend closed")
                            .into_response();
                    }
                    Ok(Err(e)) => return GatewayError::from(e).into_response(),
                    Err(_) => {
                        return GatewayError::Timeout {
                            operation: "stdio send".to_string(),
                            timeout_ms: DEFAULT_EXCHANGE_TIMEOUT.as_millis() as u64,
                        }
                        .into_response();
                    }
                }
            }
        }
        other => match conn.send(other).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => GatewayError::from(e).into_response(),
        },
    }
}

/// Query for `GET /stdio/process`.
#[derive(Debug, Deserialize)]
pub struct ProcessQuery {
    /// One of `start`, `status`, `stop`, `restart`
    pub action: String,
}

/// `GET /stdio/process` — observe or steer the subprocess behind a
/// session.
pub async fn get_stdio_process(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProcessQuery>,
) -> Response {
    let session_id = match session_header(&headers) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let Some(stdio) = state.manager.stdio().connection(session_id) else {
        return GatewayError::NotFound(format!("stdio session {session_id}")).into_response();
    };

    match query.action.as_str() {
        "status" => Json(stdio.process_info()).into_response(),
        "stop" => {
            state.manager.close(session_id).await;
            Json(stdio.process_info()).into_response()
        }
        "restart" => match stdio.restart().await {
            Ok(()) => Json(stdio.process_info()).into_response(),
            Err(e) => GatewayError::from(e).into_response(),
        },
        "start" => {
            // Start is restart for a dead child and a no-op otherwise.
            if matches!(
                stdio.status(),
                ProcessStatus::Stopped | ProcessStatus::Error
            ) {
                if let Err(e) = stdio.restart().await {
                    return GatewayError::from(e).into_response();
                }
            }
            Json(stdio.process_info()).into_response()
        }
        other => GatewayError::Validation(format!("unknown action '{other}'")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_parses_seconds_and_suffix() {
        assert_eq!(parse_timeout(Some("30s")), Duration::from_secs(30));
        assert_eq!(parse_timeout(Some("5")), Duration::from_secs(5));
        assert_eq!(parse_timeout(Some("bogus")), DEFAULT_EXCHANGE_TIMEOUT);
        assert_eq!(parse_timeout(None), DEFAULT_EXCHANGE_TIMEOUT);
    }
}
