//! Gateway error taxonomy.
//!
//! Lower layers return typed errors; this module is the single place they
//! are mapped to HTTP statuses and JSON-RPC error objects. Retry policy
//! hangs off the taxonomy: only transient upstream failures are retried.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use meshgate_protocol::{JsonRpcError, JsonRpcErrorCode};
use meshgate_transport::{ManagerError, SessionError, TransportError};
use serde_json::json;

/// Result type for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Everything that can go wrong between the HTTP front and a backend.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Bad input: malformed JSON-RPC, unknown method, invalid parameters
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or invalid credentials, insufficient role
    #[error("auth error: {0}")]
    Auth(String),

    /// Unknown id or name
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate name or conflicting registration
    #[error("conflict: {0}")]
    Conflict(String),

    /// A cap was hit: session limits, queue depth, tenant quota
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Admission denied by the rate limiter
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the window has room again
        retry_after_secs: u64,
    },

    /// No healthy backend could serve the request
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Upstream failure; `transient` failures are retried against a
    /// re-selected backend
    #[error("upstream error: {message}")]
    Upstream {
        /// Failure detail
        message: String,
        /// Whether a retry against another backend may succeed
        transient: bool,
    },

    /// Framing or protocol violation on a transport
    #[error("protocol error {code}: {message}")]
    Protocol {
        /// JSON-RPC error code
        code: i32,
        /// Violation detail
        message: String,
    },

    /// A bounded wait elapsed
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// The deadline that elapsed
        timeout_ms: u64,
    },

    /// A bug or unreachable state; logged with a correlation id
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Transient upstream failure (connect refused, 5xx, timeout).
    pub fn upstream_transient(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            transient: true,
        }
    }

    /// Permanent upstream failure.
    pub fn upstream_permanent(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether a retry against a re-selected backend may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Upstream { transient: true, .. } | Self::Timeout { .. }
        )
    }

    /// The HTTP status this error maps to at the boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Protocol { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The JSON-RPC error object this error maps to.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            Self::Validation(msg) => {
                JsonRpcError::new(JsonRpcErrorCode::InvalidRequest, msg.clone())
            }
            Self::NotFound(msg) => JsonRpcError::application(-32004, msg.clone()),
            Self::Auth(msg) => JsonRpcError::application(-32003, msg.clone()),
            Self::Conflict(msg) => JsonRpcError::application(-32005, msg.clone()),
            Self::ResourceExhausted(msg) => JsonRpcError::application(-32006, msg.clone()),
            Self::RateLimited { retry_after_secs } => {
                JsonRpcError::application(-32007, "rate limited")
                    .with_data(json!({ "retryAfter": retry_after_secs }))
            }
            Self::ServiceUnavailable(msg) => JsonRpcError::application(-32008, msg.clone()),
            Self::Upstream { message, .. } => JsonRpcError::application(-32009, message.clone()),
            Self::Protocol { code, message } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: None,
            },
            Self::Timeout { .. } | Self::Internal(_) => {
                JsonRpcError::new(JsonRpcErrorCode::InternalError, self.to_string())
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (
            status,
            Json(json!({
                "error": self.to_string(),
                "code": self.to_jsonrpc().code,
            })),
        )
            .into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<TransportError> for GatewayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout {
                operation: "transport".to_string(),
                timeout_ms: 0,
            },
            TransportError::Protocol { code, message } => Self::Protocol { code, message },
            TransportError::PeerClosed => Self::upstream_transient("peer closed"),
            TransportError::Canceled => Self::Internal("operation canceled".to_string()),
            TransportError::QueueFull => {
                Self::ResourceExhausted("outbound queue full".to_string())
            }
            TransportError::Unavailable(msg) => Self::ServiceUnavailable(msg),
            TransportError::ConnectionFailed(msg) => Self::upstream_transient(msg),
            TransportError::SendFailed(msg) => Self::upstream_transient(msg),
            TransportError::Serialization(msg) => Self::Validation(msg),
            TransportError::Io(msg) => Self::upstream_transient(msg),
        }
    }
}

impl From<SessionError> for GatewayError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Exhausted { .. } | SessionError::QuotaExceeded { .. } => {
                Self::ResourceExhausted(err.to_string())
            }
            SessionError::NotFound(id) => Self::NotFound(format!("session {id}")),
        }
    }
}

impl From<ManagerError> for GatewayError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Session(e) => e.into(),
            ManagerError::Transport(e) => e.into(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            GatewayError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::RateLimited { retry_after_secs: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::upstream_transient("x").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Timeout {
                operation: "probe".into(),
                timeout_ms: 10
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(GatewayError::upstream_transient("refused").is_transient());
        assert!(!GatewayError::upstream_permanent("bad request").is_transient());
        assert!(!GatewayError::Validation("x".into()).is_transient());
        assert!(!GatewayError::RateLimited { retry_after_secs: 1 }.is_transient());
    }

    #[test]
    fn session_exhaustion_maps_to_429() {
        let err: GatewayError = SessionError::Exhausted { current: 5, max: 5 }.into();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn protocol_code_is_preserved_on_the_wire() {
        let err: GatewayError = TransportError::protocol(-32002, "too large").into();
        assert_eq!(err.to_jsonrpc().code, -32002);
    }
}
