//! JSON-RPC over HTTP handlers: `/rpc`, `/rpc/batch`, `/rpc/introspection`.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use meshgate_protocol::types::methods;
use meshgate_protocol::{JsonRpcRequest, JsonRpcResponse};
use meshgate_transport::http as http_transport;
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::error::GatewayError;
use crate::proxy::RouteTarget;

use super::middleware::RequestContext;
use super::state::AppState;

/// Header naming the backend that served the request.
pub const BACKEND_HEADER: &str = "X-MCP-Backend";

/// Header addressing a namespace instead of the default one.
pub const NAMESPACE_HEADER: &str = "x-mcp-namespace";

/// The target a plain request resolves to: a named namespace when the
/// header is present, the default namespace otherwise.
pub(crate) fn target_from_headers(headers: &HeaderMap) -> RouteTarget {
    headers
        .get(NAMESPACE_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(RouteTarget::namespace)
        .unwrap_or_default()
}

/// Route one request and shape the paired response; routing failures
/// become JSON-RPC error responses with the original id.
async fn dispatch_one(
    state: AppState,
    context: RequestContext,
    target: RouteTarget,
    request: JsonRpcRequest,
    served_by: Arc<Mutex<Option<String>>>,
) -> JsonRpcResponse {
    let id = request.id.clone();
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
        Ok(routed) => {
            *served_by.lock() = Some(routed.backend_name.clone());
            routed.response
        }
        Err(e) => {
            debug!(request_id = %context.request_id, "rpc routing failed: {e}");
            JsonRpcResponse::error(e.to_jsonrpc(), id)
        }
    }
}

/// Shared single-shot path, also used by the server-scoped variant.
pub(crate) async fn handle_rpc(
    state: AppState,
    context: RequestContext,
    target: RouteTarget,
    body: &str,
) -> Response {
    let payload = match http_transport::parse_payload(body) {
        Ok(payload) => payload,
        Err(error_response) => {
            return (StatusCode::BAD_REQUEST, Json(error_response)).into_response();
        }
    };

    let served_by = Arc::new(Mutex::new(None));
    let response_body = http_transport::dispatch_payload(payload, |request| {
        dispatch_one(
            state.clone(),
            context.clone(),
            target.clone(),
            request,
            Arc::clone(&served_by),
        )
    })
    .await;

    match response_body {
        Some(body) => {
            let mut response = Json(body).into_response();
            let backend = served_by.lock().clone();
            if let Some(name) = backend {
                if let Ok(value) = HeaderValue::from_str(&name) {
                    response.headers_mut().insert(BACKEND_HEADER, value);
                }
            }
            response
        }
        // Notifications only: nothing is owed on the wire.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// `POST /rpc` — one JSON-RPC object or an array. Routing targets the
/// default namespace unless `X-MCP-Namespace` names another.
pub async fn post_rpc(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let target = target_from_headers(&headers);
    handle_rpc(state, context, target, &body).await
}

/// `POST /rpc/batch` — an array of JSON-RPC objects, answered pairwise.
pub async fn post_rpc_batch(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !body.trim_start().starts_with('[') {
        return GatewayError::Validation("batch endpoint expects a JSON array".to_string())
            .into_response();
    }
    let target = target_from_headers(&headers);
    handle_rpc(state, context, target, &body).await
}

/// `GET /rpc/introspection` — the advertised method set.
pub async fn get_introspection() -> Response {
    Json(json!({
        "methods": methods::ADVERTISED,
        "jsonrpc": "2.0",
    }))
    .into_response()
}
