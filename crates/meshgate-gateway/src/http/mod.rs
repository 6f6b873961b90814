//! External HTTP surface: routers, handlers, and middleware.

pub mod mcp;
pub mod middleware;
pub mod rpc;
pub mod servers;
pub mod sse;
pub mod state;
pub mod stdio;
pub mod ws;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// `GET /health` — liveness plus the headline counters.
async fn get_health(State(state): State<AppState>) -> Response {
    let stats = state.manager.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_sessions": stats.live_sessions,
        "backends": state.registry.len(),
    }))
    .into_response()
}

/// Assemble the full router: every transport surface, the server-scoped
/// variants, and the middleware stack (identity stamping outermost, then
/// rate limiting).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        // JSON-RPC over HTTP
        .route("/rpc", post(rpc::post_rpc))
        .route("/rpc/batch", post(rpc::post_rpc_batch))
        .route("/rpc/introspection", get(rpc::get_introspection))
        // Server-Sent Events
        .route("/sse", get(sse::get_sse))
        .route("/sse/events", post(sse::post_sse_events))
        .route("/sse/broadcast", post(sse::post_sse_broadcast))
        .route("/sse/replay/{session_id}", get(sse::get_sse_replay))
        // WebSocket
        .route("/ws", get(ws::get_ws))
        .route("/ws/send", post(ws::post_ws_send))
        .route("/ws/broadcast", post(ws::post_ws_broadcast))
        .route("/ws/ping", post(ws::post_ws_ping))
        .route("/ws/close", delete(ws::delete_ws_close))
        // Streamable MCP
        .route("/mcp", get(mcp::get_mcp).post(mcp::post_mcp))
        .route("/mcp/capabilities", get(mcp::get_mcp_capabilities))
        .route("/mcp/status", get(mcp::get_mcp_status))
        // STDIO bridge
        .route("/stdio/execute", post(stdio::post_stdio_execute))
        .route("/stdio/send", post(stdio::post_stdio_send))
        .route("/stdio/process", get(stdio::get_stdio_process))
        // Server-scoped variants
        .route("/servers/{server_id}/rpc", post(servers::post_server_rpc))
        .route("/servers/{server_id}/sse", get(servers::get_server_sse))
        .route("/servers/{server_id}/ws", get(servers::get_server_ws))
        .route(
            "/servers/{server_id}/mcp",
            get(servers::get_server_mcp).post(servers::post_server_mcp),
        )
        .route(
            "/servers/{server_id}/stdio",
            post(servers::post_server_stdio),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
