//! Single-shot JSON-RPC over HTTP.
//!
//! The exchange is stateless: one HTTP body in, one paired body out. The
//! transport's job is framing discipline. Every non-notification request
//! yields a response with a matching id; batch responses come back in
//! request order; invalid elements become error responses in place rather
//! than poisoning the rest of the batch.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use meshgate_protocol::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;
use uuid::Uuid;

use crate::core::{
    SessionContext, Transport, TransportConnection, TransportError, TransportResult, TransportType,
};

/// One element of a client payload after validation.
#[derive(Debug)]
pub enum ClientCall {
    /// A well-formed request
    Request(JsonRpcRequest),
    /// A well-formed notification (no response owed)
    Notification(JsonRpcNotification),
    /// A malformed element; the paired error response to emit in its place
    Invalid(JsonRpcResponse),
}

/// A validated client payload: one call or an ordered batch.
#[derive(Debug)]
pub enum HttpPayload {
    /// Single call
    Single(ClientCall),
    /// Ordered batch of calls
    Batch(Vec<ClientCall>),
}

fn validate_element(value: Value) -> ClientCall {
    // Try request first (has id), then notification.
    match serde_json::from_value::<JsonRpcRequest>(value.clone()) {
        Ok(req) => ClientCall::Request(req),
        Err(_) => match serde_json::from_value::<JsonRpcNotification>(value) {
            Ok(note) => ClientCall::Notification(note),
            Err(e) => ClientCall::Invalid(JsonRpcResponse::error_without_id(JsonRpcError::new(
                JsonRpcErrorCode::InvalidRequest,
                format!("invalid request object: {e}"),
            ))),
        },
    }
}

/// Parse and validate an HTTP body.
///
/// Returns `Err` with the complete response to emit when the body is not
/// processable at all: unparseable JSON (`-32700`) or an empty batch
/// (`-32600`).
pub fn parse_payload(body: &str) -> Result<HttpPayload, JsonRpcResponse> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| JsonRpcResponse::parse_error(Some(format!("Parse error: {e}"))))?;

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(JsonRpcResponse::error_without_id(JsonRpcError::new(
                    JsonRpcErrorCode::InvalidRequest,
                    "empty batch",
                )));
            }
            Ok(HttpPayload::Batch(
                items.into_iter().map(validate_element).collect(),
            ))
        }
        other => Ok(HttpPayload::Single(validate_element(other))),
    }
}

/// Run a validated payload through a dispatcher, pairing responses by id
/// and preserving batch order.
///
/// Returns the serialized response body, or `None` when the payload was
/// notifications only (HTTP 202, no body).
pub async fn dispatch_payload<F, Fut>(payload: HttpPayload, dispatch: F) -> Option<Value>
where
    F: Fn(JsonRpcRequest) -> Fut,
    Fut: Future<Output = JsonRpcResponse>,
{
    match payload {
        HttpPayload::Single(call) => match call {
            ClientCall::Request(req) => {
                let resp = dispatch(req).await;
                Some(serde_json::to_value(&resp).unwrap_or(Value::Null))
            }
            ClientCall::Notification(note) => {
                trace!(method = %note.method, "notification accepted");
                None
            }
            ClientCall::Invalid(resp) => Some(serde_json::to_value(&resp).unwrap_or(Value::Null)),
        },
        HttpPayload::Batch(calls) => {
            let mut responses = Vec::with_capacity(calls.len());
            for call in calls {
                match call {
                    ClientCall::Request(req) => {
                        let resp = dispatch(req).await;
                        responses.push(serde_json::to_value(&resp).unwrap_or(Value::Null));
                    }
                    ClientCall::Notification(note) => {
                        trace!(method = %note.method, "batch notification accepted");
                    }
                    ClientCall::Invalid(resp) => {
                        responses.push(serde_json::to_value(&resp).unwrap_or(Value::Null));
                    }
                }
            }
            if responses.is_empty() {
                None
            } else {
                Some(Value::Array(responses))
            }
        }
    }
}

/// The single-shot HTTP transport. Sessions are ephemeral loopbacks used
/// for manager bookkeeping; no state survives the exchange.
#[derive(Debug, Default)]
pub struct HttpTransport;

impl HttpTransport {
    /// Create the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }

    async fn create_session(
        &self,
        ctx: SessionContext,
    ) -> TransportResult<Arc<dyn TransportConnection>> {
        Ok(Arc::new(HttpConnection::new(ctx.session_id)))
    }
}

/// In-memory loopback connection for a single HTTP exchange: the handler
/// injects client messages, the proxy pumps them, and responses queue for
/// the handler to collect.
#[derive(Debug)]
pub struct HttpConnection {
    session_id: Uuid,
    inbound_tx: mpsc::Sender<JsonRpcMessage>,
    inbound_rx: Mutex<mpsc::Receiver<JsonRpcMessage>>,
    outbound_tx: mpsc::Sender<JsonRpcMessage>,
    outbound_rx: Mutex<mpsc::Receiver<JsonRpcMessage>>,
    open: AtomicBool,
}

impl HttpConnection {
    const QUEUE_DEPTH: usize = 64;

    fn new(session_id: Uuid) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(Self::QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(Self::QUEUE_DEPTH);
        Self {
            session_id,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            open: AtomicBool::new(true),
        }
    }

    /// Queue a client message for the gateway side to `receive`.
    pub async fn inject(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::PeerClosed);
        }
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| TransportError::PeerClosed)
    }

    /// Collect the next response the gateway `send`s toward the client.
    pub async fn collect(&self) -> Option<JsonRpcMessage> {
        self.outbound_rx.lock().await.recv().await
    }
}

#[async_trait]
impl TransportConnection for HttpConnection {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::PeerClosed);
        }
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| TransportError::PeerClosed)
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn close(&self) -> TransportResult<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_protocol::RequestId;
    use serde_json::json;

    async fn echo(req: JsonRpcRequest) -> JsonRpcResponse {
        JsonRpcResponse::success(json!({"method": req.method}), req.id)
    }

    #[tokio::test]
    async fn single_request_pairs_response() {
        let payload =
            parse_payload(r#"{"jsonrpc":"2.0","method":"tools/list","id":"7"}"#).unwrap();
        let body = dispatch_payload(payload, echo).await.unwrap();
        assert_eq!(body["id"], json!("7"));
        assert_eq!(body["result"]["method"], json!("tools/list"));
    }

    #[tokio::test]
    async fn batch_preserves_request_order() {
        let payload = parse_payload(
            r#"[{"jsonrpc":"2.0","method":"a","id":1},
                {"jsonrpc":"2.0","method":"b","id":2},
                {"jsonrpc":"2.0","method":"c","id":3}]"#,
        )
        .unwrap();
        let body = dispatch_payload(payload, echo).await.unwrap();
        let ids: Vec<_> = body.as_array().unwrap().iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn invalid_batch_element_errors_in_place() {
        let payload = parse_payload(
            r#"[{"jsonrpc":"2.0","method":"a","id":1},
                {"not":"jsonrpc"},
                {"jsonrpc":"2.0","method":"c","id":3}]"#,
        )
        .unwrap();
        let body = dispatch_payload(payload, echo).await.unwrap();
        let arr = body.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[1]["error"]["code"], json!(-32600));
        assert_eq!(arr[2]["id"], json!(3));
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_request() {
        let payload = parse_payload(r#"{"jsonrpc":"1.0","method":"a","id":1}"#).unwrap();
        let body = dispatch_payload(payload, echo).await.unwrap();
        assert_eq!(body["error"]["code"], json!(-32600));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let resp = parse_payload("{nope").unwrap_err();
        assert_eq!(resp.error_object().unwrap().code, -32700);
        assert!(resp.request_id().is_none());
    }

    #[test]
    fn empty_batch_is_invalid_request() {
        let resp = parse_payload("[]").unwrap_err();
        assert_eq!(resp.error_object().unwrap().code, -32600);
    }

    #[tokio::test]
    async fn notifications_produce_no_body() {
        let payload =
            parse_payload(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(dispatch_payload(payload, echo).await.is_none());
    }

    #[tokio::test]
    async fn loopback_connection_round_trip() {
        let transport = HttpTransport::new();
        let ctx = SessionContext {
            session_id: Uuid::new_v4(),
            tenant: "t".into(),
            user: "u".into(),
            backend_id: None,
            launch: None,
        };
        let conn = transport.create_session(ctx).await.unwrap();
        assert_eq!(conn.transport_type(), TransportType::Http);
        let http = HttpConnection::new(conn.session_id());

        http.inject(JsonRpcMessage::Request(JsonRpcRequest::new(
            "ping",
            None,
            RequestId::from(1),
        )))
        .await
        .unwrap();
        let got = http.receive().await.unwrap().unwrap();
        assert_eq!(got.method(), Some("ping"));

        http.close().await.unwrap();
        assert!(!http.is_open());
        assert!(matches!(
            http.send(JsonRpcMessage::Request(JsonRpcRequest::new(
                "ping",
                None,
                RequestId::from(2)
            )))
            .await,
            Err(TransportError::PeerClosed)
        ));
    }
}
