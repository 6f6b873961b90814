//! Proxy and routing core.
//!
//! A request addresses a namespace, a specific server, or nothing (the
//! default namespace). The proxy resolves candidates from the registry,
//! lets the balancer pick one, and dispatches by backend kind: HTTP-family
//! backends get a forwarded JSON-RPC POST, STDIO backends an exchange over
//! a pooled bridge session, virtual backends an adapter dispatch.
//! Transient failures burn a retry against a re-selected backend with
//! jittered exponential backoff; a per-backend circuit breaker
//! short-circuits repeat offenders.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use meshgate_protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use meshgate_transport::{CreateConnection, TransportConnection, TransportManager, TransportType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{
    Backend, BackendEndpoint, BackendFilter, BackendRegistry, DEFAULT_NAMESPACE,
};
use crate::virtual_server::{self, VirtualServerRegistry};

/// Where a request is addressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTarget {
    /// Namespace to resolve in; the default namespace when unset
    pub namespace: Option<String>,
    /// Specific backend, when the path names one
    pub server_id: Option<Uuid>,
}

impl RouteTarget {
    /// Target one backend by id.
    pub fn server(id: Uuid) -> Self {
        Self {
            namespace: None,
            server_id: Some(id),
        }
    }

    /// Target a namespace.
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
            server_id: None,
        }
    }
}

/// Retry tuning for transient upstream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First backoff delay (ms)
    pub base_delay_ms: u64,
    /// Exponential multiplier per attempt
    pub multiplier: f64,
    /// Jitter factor in `[0, 1]`
    pub jitter: f64,
    /// Backoff ceiling (ms)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            multiplier: 2.0,
            jitter: 0.1,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay_ms as f64 * exp;
        let jittered = raw * (1.0 + (fastrand::f64() - 0.5) * 2.0 * self.jitter);
        Duration::from_millis((jittered as u64).min(self.max_delay_ms))
    }
}

/// Per-backend circuit-breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Master switch
    pub enabled: bool,
    /// Failures within the window that trip the breaker
    pub failure_threshold: usize,
    /// Sliding failure window (seconds)
    pub window_secs: u64,
    /// Open duration before a half-open probe (seconds)
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            window_secs: 30,
            cooldown_secs: 30,
        }
    }
}

/// Proxy tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Retry behavior for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit-breaker behavior
    #[serde(default)]
    pub breaker: BreakerConfig,
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    failures: VecDeque<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
        }
    }
}

/// Circuit breakers keyed by backend id: Closed → Open → Half-Open. Open
/// short-circuits selection; after the cooldown exactly one probe request
/// is let through.
#[derive(Debug)]
pub struct CircuitBreakers {
    entries: DashMap<Uuid, Mutex<BreakerEntry>>,
    config: BreakerConfig,
}

impl CircuitBreakers {
    /// Create with the given tuning.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Whether a request may go to this backend right now. Flips Open to
    /// Half-Open (admitting the probe) once the cooldown has elapsed.
    pub fn admit(&self, backend_id: Uuid) -> bool {
        if !self.config.enabled {
            return true;
        }
        let entry = self
            .entries
            .entry(backend_id)
            .or_insert_with(|| Mutex::new(BreakerEntry::new()));
        let mut entry = entry.lock();
        match entry.state {
            BreakerState::Closed => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= Duration::from_secs(self.config.cooldown_secs) {
                    debug!(backend_id = %backend_id, "breaker half-open, admitting probe");
                    entry.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // One probe at a time.
            BreakerState::HalfOpen => false,
        }
    }

    /// Record a request outcome.
    pub fn record(&self, backend_id: Uuid, success: bool) {
        if !self.config.enabled {
            return;
        }
        let entry = self
            .entries
            .entry(backend_id)
            .or_insert_with(|| Mutex::new(BreakerEntry::new()));
        let mut entry = entry.lock();
        if success {
            entry.failures.clear();
            if !matches!(entry.state, BreakerState::Closed) {
                info!(backend_id = %backend_id, "breaker closed");
            }
            entry.state = BreakerState::Closed;
            return;
        }

        match entry.state {
            BreakerState::HalfOpen => {
                // Failed probe: back to Open for a fresh cooldown.
                entry.state = BreakerState::Open {
                    since: Instant::now(),
                };
            }
            BreakerState::Open { .. } => {}
            BreakerState::Closed => {
                let now = Instant::now();
                let window = Duration::from_secs(self.config.window_secs);
                entry.failures.push_back(now);
                while entry
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    entry.failures.pop_front();
                }
                if entry.failures.len() >= self.config.failure_threshold {
                    warn!(backend_id = %backend_id, "breaker opened");
                    entry.state = BreakerState::Open { since: now };
                }
            }
        }
    }

    #[cfg(test)]
    fn is_open(&self, backend_id: Uuid) -> bool {
        self.entries
            .get(&backend_id)
            .is_some_and(|e| matches!(e.lock().state, BreakerState::Open { .. }))
    }
}

/// Pooled STDIO sessions, one per backend, used for proxying single-shot
/// requests to subprocess backends. Exchanges are serialized per backend
/// so request/response pairing stays unambiguous on the pipe.
pub struct StdioPool {
    manager: Arc<TransportManager>,
    slots: DashMap<Uuid, Arc<TokioMutex<Option<Uuid>>>>,
}

impl std::fmt::Debug for StdioPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioPool")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl StdioPool {
    /// Create an empty pool.
    pub fn new(manager: Arc<TransportManager>) -> Self {
        Self {
            manager,
            slots: DashMap::new(),
        }
    }

    /// Send one request to a STDIO backend and await its paired response.
    pub async fn exchange(
        &self,
        backend: &Backend,
        request: JsonRpcRequest,
        deadline: Duration,
    ) -> GatewayResult<JsonRpcResponse> {
        let BackendEndpoint::Command(spec) = &backend.endpoint else {
            return Err(GatewayError::Validation(format!(
                "backend '{}' is not a stdio backend",
                backend.name
            )));
        };

        let slot = self
            .slots
            .entry(backend.id)
            .or_insert_with(|| Arc::new(TokioMutex::new(None)))
            .clone();
        let mut slot = slot.lock().await;

        // Reuse the pooled session when it is still live.
        let session_id = match *slot {
            Some(id) if self.manager.connection(id).is_some_and(|c| c.is_open()) => id,
            _ => {
                let (conn, snapshot) = self
                    .manager
                    .create_connection(CreateConnection {
                        transport: TransportType::Stdio,
                        tenant: backend.tenant.clone(),
                        user: "gateway".to_string(),
                        backend_id: Some(backend.id),
                        namespace: None,
                        client_id: None,
                        launch: Some(spec.clone()),
                    })
                    .await?;
                debug!(backend_id = %backend.id, session_id = %conn.session_id(), "stdio session pooled");
                *slot = Some(snapshot.id);
                snapshot.id
            }
        };

        let conn = self
            .manager
            .connection(session_id)
            .ok_or_else(|| GatewayError::upstream_transient("stdio session vanished"))?;
        let wanted = request.id.clone();
        conn.send(JsonRpcMessage::Request(request))
            .await
            .map_err(|e| {
                *slot = None;
                GatewayError::from(e)
            })?;

        let started = Instant::now();
        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or_else(|| GatewayError::Timeout {
                    operation: "stdio exchange".to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })?;
            let message = tokio::time::timeout(remaining, conn.receive())
                .await
                .map_err(|_| GatewayError::Timeout {
                    operation: "stdio exchange".to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })??;
            match message {
                Some(JsonRpcMessage::Response(response))
                    if response.request_id() == Some(&wanted) =>
                {
                    return Ok(response);
                }
                Some(other) => {
                    debug!(
                        method = other.method().unwrap_or("<response>"),
                        "unrelated frame during stdio exchange"
                    );
                }
                None => {
                    *slot = None;
                    return Err(GatewayError::upstream_transient("stdio backend closed"));
                }
            }
        }
    }
}

/// A routed response with backend attribution for the wire.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    /// The paired JSON-RPC response
    pub response: JsonRpcResponse,
    /// Serving backend id
    pub backend_id: Uuid,
    /// Serving backend name, for the attribution header
    pub backend_name: String,
}

/// Raw reverse-proxy result for the streamable pass-through surface.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Upstream status code
    pub status: u16,
    /// Upstream body, parsed as JSON when possible
    pub body: Value,
}

/// The proxy core.
pub struct Proxy {
    registry: Arc<BackendRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    virtuals: Arc<VirtualServerRegistry>,
    stdio: Arc<StdioPool>,
    breakers: CircuitBreakers,
    client: reqwest::Client,
    config: ProxyConfig,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").finish_non_exhaustive()
    }
}

impl Proxy {
    /// Build the proxy. The STDIO pool is injected so the health prober
    /// can share its pooled sessions.
    pub fn new(
        registry: Arc<BackendRegistry>,
        balancer: Arc<dyn LoadBalancer>,
        virtuals: Arc<VirtualServerRegistry>,
        stdio: Arc<StdioPool>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            registry,
            balancer,
            virtuals,
            stdio,
            breakers: CircuitBreakers::new(config.breaker.clone()),
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Resolve the candidate set for a target: namespace members (default
    /// namespace when unspecified), narrowed to one id when given,
    /// `active` status only.
    pub fn resolve_candidates(&self, target: &RouteTarget) -> GatewayResult<Vec<Backend>> {
        if let Some(id) = target.server_id {
            let backend = self.registry.lookup(id)?;
            return Ok(if backend.status == crate::registry::BackendStatus::Active {
                vec![backend]
            } else {
                Vec::new()
            });
        }
        let namespace = target
            .namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        Ok(self.registry.list(&BackendFilter {
            active_only: true,
            namespace: Some(namespace),
            ..Default::default()
        }))
    }

    /// Route one JSON-RPC request: resolve, select, dispatch, and retry
    /// transient failures against re-selected backends.
    pub async fn route(
        &self,
        target: &RouteTarget,
        request: JsonRpcRequest,
        client_ip: Option<&str>,
        request_id: &str,
    ) -> GatewayResult<RoutedResponse> {
        let candidates = self.resolve_candidates(target)?;
        if candidates.is_empty() {
            return Err(GatewayError::ServiceUnavailable(
                "no active backend for target".to_string(),
            ));
        }
        let retry_budget = candidates.iter().map(|b| b.max_retries).max().unwrap_or(0);

        let mut excluded: HashSet<Uuid> = HashSet::new();
        let mut attempt: u32 = 0;
        loop {
            let eligible: Vec<Backend> = candidates
                .iter()
                .filter(|b| !excluded.contains(&b.id) && self.breakers.admit(b.id))
                .cloned()
                .collect();
            let backend = self.balancer.select(&eligible)?;

            let started = Instant::now();
            let outcome = self
                .dispatch(&backend, request.clone(), client_ip, request_id)
                .await;
            let latency = started.elapsed();
            let success = outcome.is_ok();
            self.balancer.update_stats(backend.id, success, latency);
            self.breakers.record(backend.id, success);

            match outcome {
                Ok(response) => {
                    return Ok(RoutedResponse {
                        response,
                        backend_id: backend.id,
                        backend_name: backend.name,
                    });
                }
                Err(e) if e.is_transient() && attempt < retry_budget => {
                    attempt += 1;
                    excluded.insert(backend.id);
                    let delay = self.config.retry.delay(attempt);
                    warn!(
                        backend = %backend.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient upstream failure, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(
        &self,
        backend: &Backend,
        request: JsonRpcRequest,
        client_ip: Option<&str>,
        request_id: &str,
    ) -> GatewayResult<JsonRpcResponse> {
        if let Some(adapter) = self.virtuals.adapter(backend.id) {
            return Ok(virtual_server::dispatch(adapter.as_ref(), request).await);
        }
        match &backend.endpoint {
            BackendEndpoint::Command(_) => {
                self.stdio.exchange(backend, request, backend.timeout).await
            }
            BackendEndpoint::Url(url) => {
                self.forward_jsonrpc(backend, url.clone(), request, client_ip, request_id)
                    .await
            }
        }
    }

    async fn forward_jsonrpc(
        &self,
        backend: &Backend,
        url: url::Url,
        request: JsonRpcRequest,
        client_ip: Option<&str>,
        request_id: &str,
    ) -> GatewayResult<JsonRpcResponse> {
        let mut builder = self
            .client
            .post(url)
            .timeout(backend.timeout)
            .header("X-Request-ID", request_id)
            .header("X-Forwarded-Proto", "http")
            .json(&request);
        if let Some(ip) = client_ip {
            builder = builder.header("X-Forwarded-For", ip);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                GatewayError::upstream_transient(format!("{}: {e}", backend.name))
            } else {
                GatewayError::upstream_permanent(format!("{}: {e}", backend.name))
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::upstream_transient(format!(
                "{} returned {status}",
                backend.name
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::upstream_permanent(format!(
                "{} returned {status}",
                backend.name
            )));
        }
        response
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| GatewayError::upstream_permanent(format!("bad upstream body: {e}")))
    }

    /// Raw pass-through for the streamable surface: forward an arbitrary
    /// HTTP exchange to a selected backend.
    pub async fn forward_raw(
        &self,
        target: &RouteTarget,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: Option<Value>,
        request_id: &str,
    ) -> GatewayResult<RawResponse> {
        let candidates = self.resolve_candidates(target)?;
        let backend = self.balancer.select(&candidates)?;
        let BackendEndpoint::Url(base) = &backend.endpoint else {
            return Err(GatewayError::Validation(
                "raw pass-through needs an HTTP backend".to_string(),
            ));
        };
        let url = base
            .join(path.trim_start_matches('/'))
            .map_err(|e| GatewayError::Validation(format!("bad path: {e}")))?;

        let mut builder = match method.to_ascii_uppercase().as_str() {
            "GET" => self.client.get(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            _ => self.client.post(url),
        };
        builder = builder
            .timeout(backend.timeout)
            .header("X-Request-ID", request_id)
            .header("X-Forwarded-Proto", "http");
        for (key, value) in headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let started = Instant::now();
        let outcome = builder.send().await;
        let success = outcome.is_ok();
        self.balancer
            .update_stats(backend.id, success, started.elapsed());
        self.breakers.record(backend.id, success);

        let response =
            outcome.map_err(|e| GatewayError::upstream_transient(format!("{e}")))?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(RawResponse { status, body })
    }

    /// The pooled STDIO exchange, shared with the health prober.
    pub fn stdio_pool(&self) -> &Arc<StdioPool> {
        &self.stdio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let config = RetryConfig {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(config.delay(1), Duration::from_millis(100));
        assert_eq!(config.delay(2), Duration::from_millis(200));
        assert_eq!(config.delay(10), Duration::from_millis(5_000));
    }

    #[test]
    fn breaker_opens_after_threshold_and_probes_after_cooldown() {
        let breakers = CircuitBreakers::new(BreakerConfig {
            enabled: true,
            failure_threshold: 3,
            window_secs: 60,
            cooldown_secs: 0,
        });
        let id = Uuid::new_v4();

        assert!(breakers.admit(id));
        for _ in 0..3 {
            breakers.record(id, false);
        }
        assert!(breakers.is_open(id));

        // Zero cooldown: next admit is the half-open probe, and only one.
        assert!(breakers.admit(id));
        assert!(!breakers.admit(id));

        breakers.record(id, true);
        assert!(breakers.admit(id));
    }

    #[test]
    fn failed_probe_reopens() {
        let breakers = CircuitBreakers::new(BreakerConfig {
            enabled: true,
            failure_threshold: 1,
            window_secs: 60,
            cooldown_secs: 0,
        });
        let id = Uuid::new_v4();
        breakers.record(id, false);
        assert!(breakers.is_open(id));
        assert!(breakers.admit(id)); // probe
        breakers.record(id, false);
        assert!(breakers.is_open(id));
    }

    #[test]
    fn disabled_breaker_admits_everything() {
        let breakers = CircuitBreakers::new(BreakerConfig {
            enabled: false,
            ..Default::default()
        });
        let id = Uuid::new_v4();
        for _ in 0..100 {
            breakers.record(id, false);
        }
        assert!(breakers.admit(id));
    }

    #[test]
    fn route_target_forms() {
        let id = Uuid::new_v4();
        assert_eq!(RouteTarget::server(id).server_id, Some(id));
        assert_eq!(
            RouteTarget::namespace("team-a").namespace.as_deref(),
            Some("team-a")
        );
        assert_eq!(RouteTarget::default(), RouteTarget {
            namespace: None,
            server_id: None
        });
    }
}
