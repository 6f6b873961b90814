//! Health probing.
//!
//! One scheduler iterates the registry on an interval and probes every
//! backend that is administratively serving. Probe outcomes feed the
//! registry's per-backend failure counter; crossing the threshold marks
//! the backend `unhealthy`, and a single success brings it back. The
//! prober never ejects a backend from selection itself — the balancer
//! consults status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use meshgate_protocol::types::methods;
use meshgate_protocol::{JsonRpcRequest, RequestId};
use meshgate_transport::{SessionFilter, SessionState, TransportManager, TransportType};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::proxy::StdioPool;
use crate::registry::{
    Backend, BackendEndpoint, BackendRegistry, BackendStatus, HealthCheckRecord, ProbeStatus,
};

/// Prober tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Probe interval
    pub interval: Duration,
    /// Per-probe deadline
    pub timeout: Duration,
    /// Consecutive failures before a backend goes unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

/// The health prober.
pub struct HealthProber {
    registry: Arc<BackendRegistry>,
    manager: Arc<TransportManager>,
    client: reqwest::Client,
    config: HealthConfig,
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HealthProber {
    /// Build the prober.
    pub fn new(
        registry: Arc<BackendRegistry>,
        manager: Arc<TransportManager>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            manager,
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Run until shutdown. The loop exits within one probe timeout of the
    /// signal because every probe is individually bounded.
    pub async fn run(self: Arc<Self>, stdio: Arc<StdioPool>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("health prober stopping");
                        return;
                    }
                }
            }
            self.probe_all(&stdio).await;
        }
    }

    /// One sweep over every probeable backend.
    pub async fn probe_all(&self, stdio: &StdioPool) {
        for id in self.registry.ids() {
            let Ok(backend) = self.registry.lookup(id) else {
                continue;
            };
            // Administratively parked backends are left alone.
            if matches!(
                backend.status,
                BackendStatus::Inactive | BackendStatus::Maintenance
            ) {
                continue;
            }
            if let Some(record) = self.probe(&backend, stdio).await {
                self.apply(&backend, &record);
            }
        }
    }

    /// Probe one backend. Returns `None` when no probe can run (a STDIO
    /// backend with no live session), which causes no state transition.
    pub async fn probe(&self, backend: &Backend, stdio: &StdioPool) -> Option<HealthCheckRecord> {
        let started = Instant::now();
        let outcome = match &backend.endpoint {
            BackendEndpoint::Url(url) => Some(self.probe_http(backend, url).await),
            BackendEndpoint::Command(_) => self.probe_stdio(backend, stdio).await,
        };
        outcome.map(|(status, message)| HealthCheckRecord {
            backend_id: backend.id,
            status,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            message,
            timestamp: Utc::now(),
        })
    }

    /// HTTP-family probe: GET the declared health URL, or the endpoint
    /// itself. Any 2xx within the deadline is healthy.
    async fn probe_http(&self, backend: &Backend, url: &Url) -> (ProbeStatus, Option<String>) {
        let target = backend
            .metadata
            .get("health_url")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<Url>().ok())
            .unwrap_or_else(|| url.clone());

        match tokio::time::timeout(self.config.timeout, self.client.get(target).send()).await {
            Ok(Ok(response)) if response.status().is_success() => (ProbeStatus::Healthy, None),
            Ok(Ok(response)) => (
                ProbeStatus::Unhealthy,
                Some(format!("status {}", response.status())),
            ),
            Ok(Err(e)) => (ProbeStatus::Error, Some(e.to_string())),
            Err(_) => (ProbeStatus::Timeout, Some("probe deadline elapsed".into())),
        }
    }

    /// STDIO probe: a minimal `ping` over a live bridge session. With no
    /// live session there is nothing to probe, so no record is produced.
    async fn probe_stdio(
        &self,
        backend: &Backend,
        stdio: &StdioPool,
    ) -> Option<(ProbeStatus, Option<String>)> {
        let live = self.manager.list(&SessionFilter {
            backend_id: Some(backend.id),
            transport: Some(TransportType::Stdio),
            state: Some(SessionState::Active),
            ..Default::default()
        });
        if live.is_empty() {
            return None;
        }

        let ping = JsonRpcRequest::new(
            methods::PING,
            None,
            RequestId::String(format!("probe-{}", uuid::Uuid::new_v4())),
        );
        match stdio.exchange(backend, ping, self.config.timeout).await {
            Ok(response) if response.is_success() => Some((ProbeStatus::Healthy, None)),
            Ok(response) => Some((
                ProbeStatus::Unhealthy,
                response.error_object().map(|e| e.message.clone()),
            )),
            Err(e) => Some((ProbeStatus::Error, Some(e.to_string()))),
        }
    }

    /// Fold one probe record into backend state: record it, then drive the
    /// Unknown/Healthy/Unhealthy transitions.
    pub fn apply(&self, backend: &Backend, record: &HealthCheckRecord) {
        let failures = match self.registry.record_probe(record) {
            Ok(failures) => failures,
            Err(_) => return, // unregistered mid-sweep
        };

        if record.status.is_success() {
            // One success is enough to leave unhealthy.
            if backend.status == BackendStatus::Unhealthy {
                info!(backend = %backend.name, "backend recovered");
                let _ = self.registry.set_status(backend.id, BackendStatus::Active);
            }
        } else if failures >= self.config.failure_threshold
            && backend.status == BackendStatus::Active
        {
            warn!(
                backend = %backend.name,
                failures,
                "backend marked unhealthy"
            );
            let _ = self
                .registry
                .set_status(backend.id, BackendStatus::Unhealthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendProtocol, BackendSpec};
    use std::collections::{HashMap, HashSet};

    fn registry_with_backend() -> (Arc<BackendRegistry>, Backend) {
        let registry = Arc::new(BackendRegistry::new());
        let backend = registry
            .register(BackendSpec {
                tenant: "t".into(),
                name: "probed".into(),
                protocol: BackendProtocol::Http,
                endpoint: BackendEndpoint::Url("http://127.0.0.1:1/".parse().unwrap()),
                capabilities: HashMap::new(),
                weight: 100,
                timeout_secs: 30,
                max_retries: 3,
                tags: HashSet::new(),
                metadata: HashMap::new(),
            })
            .unwrap();
        (registry, backend)
    }

    fn prober(registry: Arc<BackendRegistry>) -> HealthProber {
        let manager = Arc::new(meshgate_transport::TransportManager::new(
            meshgate_transport::ManagerConfig::default(),
        ));
        HealthProber::new(
            registry,
            manager,
            HealthConfig {
                failure_threshold: 3,
                ..Default::default()
            },
        )
    }

    fn failure_record(backend: &Backend) -> HealthCheckRecord {
        HealthCheckRecord {
            backend_id: backend.id,
            status: ProbeStatus::Timeout,
            latency_ms: Some(10_000),
            message: Some("deadline".into()),
            timestamp: Utc::now(),
        }
    }

    fn success_record(backend: &Backend) -> HealthCheckRecord {
        HealthCheckRecord {
            backend_id: backend.id,
            status: ProbeStatus::Healthy,
            latency_ms: Some(3),
            message: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unhealthy_only_after_threshold_consecutive_failures() {
        let (registry, backend) = registry_with_backend();
        let prober = prober(Arc::clone(&registry));

        for _ in 0..2 {
            let current = registry.lookup(backend.id).unwrap();
            prober.apply(&current, &failure_record(&backend));
        }
        assert_eq!(
            registry.lookup(backend.id).unwrap().status,
            BackendStatus::Active
        );

        let current = registry.lookup(backend.id).unwrap();
        prober.apply(&current, &failure_record(&backend));
        assert_eq!(
            registry.lookup(backend.id).unwrap().status,
            BackendStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn a_success_resets_the_streak() {
        let (registry, backend) = registry_with_backend();
        let prober = prober(Arc::clone(&registry));

        for _ in 0..2 {
            let current = registry.lookup(backend.id).unwrap();
            prober.apply(&current, &failure_record(&backend));
        }
        let current = registry.lookup(backend.id).unwrap();
        prober.apply(&current, &success_record(&backend));
        assert_eq!(
            registry.lookup(backend.id).unwrap().health.consecutive_failures,
            0
        );

        // The streak starts over; two more failures stay active.
        for _ in 0..2 {
            let current = registry.lookup(backend.id).unwrap();
            prober.apply(&current, &failure_record(&backend));
        }
        assert_eq!(
            registry.lookup(backend.id).unwrap().status,
            BackendStatus::Active
        );
    }

    #[tokio::test]
    async fn single_success_recovers_an_unhealthy_backend() {
        let (registry, backend) = registry_with_backend();
        let prober = prober(Arc::clone(&registry));

        for _ in 0..3 {
            let current = registry.lookup(backend.id).unwrap();
            prober.apply(&current, &failure_record(&backend));
        }
        assert_eq!(
            registry.lookup(backend.id).unwrap().status,
            BackendStatus::Unhealthy
        );

        let current = registry.lookup(backend.id).unwrap();
        prober.apply(&current, &success_record(&backend));
        assert_eq!(
            registry.lookup(backend.id).unwrap().status,
            BackendStatus::Active
        );
    }

    #[tokio::test]
    async fn maintenance_backends_are_not_flipped() {
        let (registry, backend) = registry_with_backend();
        registry
            .set_status(backend.id, BackendStatus::Maintenance)
            .unwrap();
        let prober = prober(Arc::clone(&registry));

        for _ in 0..5 {
            let current = registry.lookup(backend.id).unwrap();
            prober.apply(&current, &failure_record(&backend));
        }
        assert_eq!(
            registry.lookup(backend.id).unwrap().status,
            BackendStatus::Maintenance
        );
    }

    #[tokio::test]
    async fn unreachable_http_backend_probes_as_failure() {
        let (registry, backend) = registry_with_backend();
        let prober = HealthProber::new(
            Arc::clone(&registry),
            Arc::new(meshgate_transport::TransportManager::new(
                meshgate_transport::ManagerConfig::default(),
            )),
            HealthConfig {
                timeout: Duration::from_millis(500),
                ..Default::default()
            },
        );
        let stdio = StdioPool::new(Arc::new(meshgate_transport::TransportManager::new(
            meshgate_transport::ManagerConfig::default(),
        )));

        // Port 1 refuses connections; outcome is a failure of some kind.
        let record = prober.probe(&backend, &stdio).await.unwrap();
        assert!(!record.status.is_success());
    }
}
