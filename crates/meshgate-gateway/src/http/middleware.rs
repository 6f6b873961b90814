//! Request middleware: identity stamping and rate-limit admission.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::net::SocketAddr;
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::ratelimit::RateDecision;

use super::state::AppState;

/// Per-request identity, stamped before anything else runs.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Best-effort client address
    pub client_ip: String,
    /// Correlation id, echoed back as `X-Request-ID`
    pub request_id: String,
    /// Bearer or API-key token, when presented (validation is external)
    pub token: Option<String>,
    /// Tenant the request acts as; single-tenant deployments use the
    /// default
    pub tenant: String,
    /// User the request acts as
    pub user: String,
}

/// Tenant used when no identity is presented.
pub const DEFAULT_TENANT: &str = "default";
/// User used when no identity is presented.
pub const ANONYMOUS_USER: &str = "anonymous";

fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .or_else(|| request.headers().get("x-real-ip"))
        .and_then(|h| h.to_str().ok())
        .map(|raw| raw.split(',').next().unwrap_or(raw).trim().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
}

/// Stamp ip, correlation id, and presented token onto the request, and
/// echo the correlation id on the response.
pub async fn context_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let context = RequestContext {
        client_ip: client_ip(&request),
        request_id: request_id.clone(),
        token: bearer_token(&request),
        tenant: request
            .headers()
            .get("x-tenant-id")
            .and_then(|h| h.to_str().ok())
            .unwrap_or(DEFAULT_TENANT)
            .to_string(),
        user: request
            .headers()
            .get("x-user-id")
            .and_then(|h| h.to_str().ok())
            .unwrap_or(ANONYMOUS_USER)
            .to_string(),
    };

    let mut request = request;
    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

/// Per-ip sliding-window admission. Requests carrying a configured bypass
/// token skip the limiter entirely.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(context) = request.extensions().get::<RequestContext>().cloned() else {
        // Context middleware always runs first; treat absence as a bug but
        // do not block traffic on it.
        return next.run(request).await;
    };

    if state.limiter.is_bypassed(context.token.as_deref()) {
        debug!(ip = %context.client_ip, "rate limit bypassed by token");
        return next.run(request).await;
    }

    match state.limiter.check(&context.client_ip, Utc::now()).await {
        RateDecision::Allow => next.run(request).await,
        RateDecision::Deny { retry_after } => {
            let retry_secs = retry_after.as_secs().max(1);
            GatewayError::RateLimited {
                retry_after_secs: retry_secs,
            }
            .into_response()
        }
    }
}
