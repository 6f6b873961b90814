//! Server-scoped transport variants under `/servers/{server_id}/…`,
//! for explicit routing to a single backend.

use axum::extract::{Extension, Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use meshgate_transport::LaunchSpec;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::proxy::RouteTarget;
use crate::registry::BackendEndpoint;

use super::middleware::RequestContext;
use super::state::AppState;
use super::{mcp, rpc, sse, stdio, ws};

/// `POST /servers/{server_id}/rpc` — single-shot JSON-RPC to one backend.
pub async fn post_server_rpc(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Extension(context): Extension<RequestContext>,
    body: String,
) -> Response {
    if let Err(e) = state.registry.lookup(server_id) {
        return e.into_response();
    }
    rpc::handle_rpc(state, context, RouteTarget::server(server_id), &body).await
}

/// `GET /servers/{server_id}/sse` — event stream bound to one backend.
pub async fn get_server_sse(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = state.registry.lookup(server_id) {
        return e.into_response();
    }
    match sse::open_sse(state, context, Some(server_id), headers).await {
        Ok(stream) => stream.into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /servers/{server_id}/ws` — duplex session bound to one backend.
pub async fn get_server_ws(
    websocket: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Extension(context): Extension<RequestContext>,
) -> Response {
    if let Err(e) = state.registry.lookup(server_id) {
        return e.into_response();
    }
    ws::upgrade_ws(websocket, state, context, Some(server_id)).await
}

/// `GET /servers/{server_id}/mcp` — streamable session bound to one
/// backend.
pub async fn get_server_mcp(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = state.registry.lookup(server_id) {
        return e.into_response();
    }
    mcp::handle_get(state, context, headers, Some(server_id)).await
}

/// `POST /servers/{server_id}/mcp` — streamable exchange bound to one
/// backend.
pub async fn post_server_mcp(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(e) = state.registry.lookup(server_id) {
        return e.into_response();
    }
    mcp::handle_post(state, context, headers, body, Some(server_id)).await
}

/// `POST /servers/{server_id}/stdio` — spawn the backend's registered
/// command and bind a bridge session.
pub async fn post_server_stdio(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Extension(context): Extension<RequestContext>,
) -> Response {
    let backend = match state.registry.lookup(server_id) {
        Ok(backend) => backend,
        Err(e) => return e.into_response(),
    };
    let BackendEndpoint::Command(spec) = backend.endpoint else {
        return GatewayError::Validation(format!(
            "backend '{}' has no launch command",
            backend.name
        ))
        .into_response();
    };
    let launch = LaunchSpec {
        command: spec.command,
        args: spec.args,
        env: spec.env,
        cwd: spec.cwd,
    };
    stdio::spawn_session(state, context, Some(server_id), launch).await
}
