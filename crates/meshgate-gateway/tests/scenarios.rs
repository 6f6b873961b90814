//! End-to-end gateway scenarios over the assembled router: round-robin
//! attribution, rate-limit admission, unhealthy ejection, the streamable
//! initialize exchange, and the STDIO bridge handshake.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use meshgate_gateway::balancer::{LoadBalancer, RoundRobin};
use meshgate_gateway::config::GatewayConfig;
use meshgate_gateway::health::{HealthConfig, HealthProber};
use meshgate_gateway::http::{router, AppState};
use meshgate_gateway::proxy::{Proxy, ProxyConfig, RouteTarget, StdioPool};
use meshgate_gateway::ratelimit::{MemoryStore, RateLimitConfig, RateLimiter, RateRule};
use meshgate_gateway::registry::{
    BackendEndpoint, BackendProtocol, BackendRegistry, BackendSpec, BackendStatus,
    HealthCheckRecord, ProbeStatus,
};
use meshgate_gateway::virtual_server::{
    AdapterError, AdapterResult, VirtualServerAdapter, VirtualServerRegistry,
};
use meshgate_protocol::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use meshgate_transport::{ManagerConfig, TransportManager};
use serde_json::{json, Value};
use tower::ServiceExt;

/// Adapter that answers every call with its own name, so responses carry
/// backend attribution in-band as well as in the header.
struct NamedAdapter(&'static str);

#[async_trait::async_trait]
impl VirtualServerAdapter for NamedAdapter {
    async fn list_tools(&self) -> AdapterResult<Vec<ToolDescriptor>> {
        Ok(vec![ToolDescriptor {
            name: format!("{}-tool", self.0),
            description: None,
            input_schema: json!({"type": "object"}),
        }])
    }

    async fn call_tool(&self, _name: &str, _args: Value) -> AdapterResult<Value> {
        Ok(json!({ "served_by": self.0 }))
    }

    async fn list_resources(&self) -> AdapterResult<Vec<ResourceDescriptor>> {
        Ok(Vec::new())
    }

    async fn read_resource(&self, uri: &str) -> AdapterResult<Value> {
        Err(AdapterError::new(-32002, format!("no resource '{uri}'")))
    }

    async fn list_prompts(&self) -> AdapterResult<Vec<PromptDescriptor>> {
        Ok(Vec::new())
    }

    async fn get_prompt(&self, name: &str, _args: Value) -> AdapterResult<Value> {
        Err(AdapterError::new(-32002, format!("no prompt '{name}'")))
    }
}

fn virtual_spec(name: &str) -> BackendSpec {
    BackendSpec {
        tenant: "default".into(),
        name: name.into(),
        protocol: BackendProtocol::Http,
        endpoint: BackendEndpoint::Url("http://127.0.0.1:9/".parse().unwrap()),
        capabilities: HashMap::new(),
        weight: 100,
        timeout_secs: 5,
        max_retries: 0,
        tags: Default::default(),
        metadata: HashMap::new(),
    }
}

/// Assemble a gateway state with virtual backends and a memory-only
/// limiter; no sockets, no subprocesses.
fn test_state(backend_names: &[&'static str], rules: Vec<RateRule>) -> AppState {
    let registry = Arc::new(BackendRegistry::new());
    let virtuals = Arc::new(VirtualServerRegistry::new());
    for name in backend_names {
        let backend = registry.register(virtual_spec(name)).expect("register");
        virtuals.attach(backend.id, Arc::new(NamedAdapter(name)));
    }

    let limiter = Arc::new(RateLimiter::with_stores(
        RateLimitConfig {
            rules,
            ..Default::default()
        },
        None,
        Arc::new(MemoryStore::new()),
    ));
    let manager = Arc::new(TransportManager::new(ManagerConfig::default()));
    let balancer: Arc<dyn LoadBalancer> = Arc::new(RoundRobin::new());
    let stdio_pool = Arc::new(StdioPool::new(Arc::clone(&manager)));
    let proxy = Arc::new(Proxy::new(
        Arc::clone(&registry),
        Arc::clone(&balancer),
        Arc::clone(&virtuals),
        Arc::clone(&stdio_pool),
        ProxyConfig::default(),
    ));

    AppState {
        config: Arc::new(GatewayConfig::default()),
        registry,
        balancer,
        limiter,
        manager,
        proxy,
        virtuals,
        stdio_pool,
        started_at: Utc::now(),
    }
}

fn rpc_request(id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/rpc")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!(
            r#"{{"jsonrpc":"2.0","method":"tools/list","id":"{id}"}}"#
        )))
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

/// S1: three sequential `tools/list` calls cycle attribution A, B, A.
#[tokio::test]
async fn round_robin_attribution_cycles() {
    let state = test_state(&["alpha", "beta"], vec![]);
    let app = router(state);

    let mut served = Vec::new();
    for id in ["1", "2", "3"] {
        let response = app.clone().oneshot(rpc_request(id)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let backend = response
            .headers()
            .get("X-MCP-Backend")
            .and_then(|h| h.to_str().ok())
            .expect("attribution header")
            .to_string();
        let body = body_json(response).await;
        assert_eq!(body["id"], json!(id));
        assert!(body["result"]["tools"][0]["name"]
            .as_str()
            .expect("tool name")
            .starts_with(&backend));
        served.push(backend);
    }
    assert_eq!(served, vec!["alpha", "beta", "alpha"]);
}

/// S4: with a 5-per-second rule, exactly five of ten requests from one ip
/// are admitted and the rest carry `Retry-After`.
#[tokio::test]
async fn rate_limit_admits_exactly_the_window() {
    let state = test_state(
        &["alpha"],
        vec![RateRule {
            limit: 5,
            window_secs: 1,
        }],
    );
    let app = router(state);

    let mut ok = 0;
    let mut limited = 0;
    for id in 0..10 {
        let mut request = rpc_request(&id.to_string());
        request
            .headers_mut()
            .insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        let response = app.clone().oneshot(request).await.expect("response");
        match response.status() {
            StatusCode::OK => ok += 1,
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after: u64 = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|h| h.to_str().ok())
                    .and_then(|raw| raw.parse().ok())
                    .expect("Retry-After header");
                assert!(retry_after <= 1);
                limited += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(limited, 5);
}

/// Namespace-addressed requests resolve only within that namespace.
#[tokio::test]
async fn namespace_header_scopes_candidates() {
    let state = test_state(&["alpha", "beta"], vec![]);
    let beta = state
        .registry
        .lookup_by_name("default", "beta")
        .expect("registered");
    state
        .registry
        .assign_namespace("team-b", beta.id)
        .expect("namespace");
    let app = router(state);

    for id in ["1", "2", "3"] {
        let mut request = rpc_request(id);
        request
            .headers_mut()
            .insert("x-mcp-namespace", "team-b".parse().unwrap());
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let backend = response
            .headers()
            .get("X-MCP-Backend")
            .and_then(|h| h.to_str().ok())
            .expect("attribution header");
        assert_eq!(backend, "beta");
    }
}

/// Distinct ips do not share a window.
#[tokio::test]
async fn rate_limit_is_per_ip() {
    let state = test_state(
        &["alpha"],
        vec![RateRule {
            limit: 1,
            window_secs: 60,
        }],
    );
    let app = router(state);

    for ip in ["198.51.100.1", "198.51.100.2", "198.51.100.3"] {
        let mut request = rpc_request("1");
        request
            .headers_mut()
            .insert("x-forwarded-for", ip.parse().unwrap());
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}

/// S5: three consecutive probe failures eject a backend from selection;
/// one success brings it back.
#[tokio::test]
async fn unhealthy_backend_is_never_selected() {
    let state = test_state(&["healthy", "shaky"], vec![]);
    let shaky = state
        .registry
        .lookup_by_name("default", "shaky")
        .expect("registered");

    let prober = HealthProber::new(
        Arc::clone(&state.registry),
        Arc::clone(&state.manager),
        HealthConfig {
            failure_threshold: 3,
            ..Default::default()
        },
    );
    let failure = HealthCheckRecord {
        backend_id: shaky.id,
        status: ProbeStatus::Timeout,
        latency_ms: None,
        message: Some("probe deadline".into()),
        timestamp: Utc::now(),
    };
    for _ in 0..3 {
        let current = state.registry.lookup(shaky.id).expect("lookup");
        prober.apply(&current, &failure);
    }
    assert_eq!(
        state.registry.lookup(shaky.id).expect("lookup").status,
        BackendStatus::Unhealthy
    );

    // Selection never returns the unhealthy backend.
    for _ in 0..20 {
        let candidates = state
            .proxy
            .resolve_candidates(&RouteTarget::default())
            .expect("candidates");
        assert!(candidates.iter().all(|b| b.id != shaky.id));
        let chosen = state.balancer.select(&candidates).expect("selection");
        assert_ne!(chosen.id, shaky.id);
    }

    // One healthy probe restores it.
    let current = state.registry.lookup(shaky.id).expect("lookup");
    prober.apply(
        &current,
        &HealthCheckRecord {
            backend_id: shaky.id,
            status: ProbeStatus::Healthy,
            latency_ms: Some(2),
            message: None,
            timestamp: Utc::now(),
        },
    );
    let candidates = state
        .proxy
        .resolve_candidates(&RouteTarget::default())
        .expect("candidates");
    assert!(candidates.iter().any(|b| b.id == shaky.id));
}

/// The streamable endpoint terminates the initialize exchange itself and
/// hands back a session token.
#[tokio::test]
async fn mcp_initialize_returns_gateway_capabilities() {
    let state = test_state(&["alpha"], vec![]);
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "jsonrpc": "2.0",
                "id": "init",
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "t", "version": "1"}
                }
            })
            .to_string(),
        ))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("mcp-session-id"));
    let body = body_json(response).await;
    assert_eq!(body["id"], json!("init"));
    assert_eq!(
        body["result"]["protocolVersion"],
        json!(meshgate_protocol::PROTOCOL_VERSION)
    );
    assert_eq!(body["result"]["serverInfo"]["name"], json!("meshgate"));
}

/// Unknown server ids on the scoped surface are 404s.
#[tokio::test]
async fn server_scoped_unknown_id_is_not_found() {
    let state = test_state(&["alpha"], vec![]);
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/servers/{}/rpc", uuid::Uuid::new_v4()))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            r#"{"jsonrpc":"2.0","method":"tools/list","id":"1"}"#,
        ))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// S3: spawn a one-exchange responder over the STDIO bridge and complete
/// an initialize handshake against it.
#[cfg(unix)]
#[tokio::test]
async fn stdio_execute_and_initialize_round_trip() {
    let state = test_state(&[], vec![]);
    let app = router(state.clone());

    let script = r#"read line; printf '{"jsonrpc":"2.0","result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"responder","version":"1"}},"id":"init"}\n'"#;
    let execute = Request::builder()
        .method("POST")
        .uri("/stdio/execute")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "command": "sh",
                "args": ["-c", script],
                "timeout": "30s"
            })
            .to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(execute).await.expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let spawned = body_json(response).await;
    let session_id = spawned["session_id"].as_str().expect("session id").to_string();
    assert!(spawned["pid"].as_u64().expect("pid") > 0);

    let send = Request::builder()
        .method("POST")
        .uri("/stdio/send")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-Session-ID", &session_id)
        .body(Body::from(
            json!({
                "jsonrpc": "2.0",
                "method": "initialize",
                "id": "init",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "t", "version": "1"}
                }
            })
            .to_string(),
        ))
        .expect("request");
    let response = app.oneshot(send).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], json!("init"));
    assert_eq!(body["result"]["serverInfo"]["name"], json!("responder"));
}
