//! Backend registry: the authoritative, read-mostly index of MCP servers.
//!
//! Reads take a shared lock on a stable map; writes are rare (registration,
//! status flips, probe records) and appear atomic to readers. Backends are
//! unique per `(tenant, name)`. Namespaces are an administrative grouping
//! kept beside the registry; requests may address a namespace instead of a
//! server id.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use meshgate_transport::LaunchSpec;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

/// Weight ceiling enforced on write.
pub const MAX_WEIGHT: u32 = 1000;
/// Request timeout bounds enforced on write.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper request timeout bound.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    /// Subprocess speaking line-delimited JSON-RPC
    Stdio,
    /// Plain HTTP endpoint
    Http,
    /// TLS HTTP endpoint
    Https,
    /// WebSocket endpoint
    WebSocket,
    /// SSE endpoint
    Sse,
}

impl BackendProtocol {
    /// Whether the proxy reaches this backend over HTTP.
    pub fn is_http_family(&self) -> bool {
        matches!(self, Self::Http | Self::Https | Self::Sse | Self::WebSocket)
    }
}

/// Where a backend lives: a URL, or a command to spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackendEndpoint {
    /// Network endpoint
    Url(Url),
    /// Subprocess launch description
    Command(LaunchSpec),
}

/// Administrative backend status. Only the health prober and admin action
/// may change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Serving traffic
    Active,
    /// Administratively disabled
    Inactive,
    /// Ejected by the health prober
    Unhealthy,
    /// Temporarily drained for maintenance
    Maintenance,
}

/// Probe outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Probe succeeded
    Healthy,
    /// Probe got a negative answer
    Unhealthy,
    /// Probe deadline elapsed
    Timeout,
    /// Probe could not run
    Error,
}

impl ProbeStatus {
    /// Whether the outcome counts as a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// One recorded probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckRecord {
    /// Probed backend
    pub backend_id: Uuid,
    /// Outcome classification
    pub status: ProbeStatus,
    /// Observed latency
    pub latency_ms: Option<u64>,
    /// Failure detail, when any
    pub message: Option<String>,
    /// When the probe ran
    pub timestamp: DateTime<Utc>,
}

/// Rolling health view kept on each backend.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Last probe outcome; `None` before the first probe
    pub status: Option<ProbeStatus>,
    /// Last observed latency
    pub latency_ms: Option<u64>,
    /// When the last probe ran
    pub checked_at: Option<DateTime<Utc>>,
    /// Consecutive failed probes
    pub consecutive_failures: u32,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            status: None,
            latency_ms: None,
            checked_at: None,
            consecutive_failures: 0,
        }
    }
}

/// A registered MCP backend.
#[derive(Debug, Clone, Serialize)]
pub struct Backend {
    /// Backend identifier
    pub id: Uuid,
    /// Owning tenant
    pub tenant: String,
    /// Human name, unique within the tenant
    pub name: String,
    /// Protocol kind
    pub protocol: BackendProtocol,
    /// Network endpoint or launch command
    pub endpoint: BackendEndpoint,
    /// Declared capability map
    pub capabilities: HashMap<String, Value>,
    /// Balancing weight, clamped to `[0, 1000]`
    pub weight: u32,
    /// Per-request timeout, clamped to `[1s, 300s]`
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Retry budget for transient failures
    pub max_retries: u32,
    /// Unordered tag set
    pub tags: HashSet<String>,
    /// Administrative status
    pub status: BackendStatus,
    /// Rolling probe view
    pub health: HealthSnapshot,
    /// Free-form metadata
    pub metadata: HashMap<String, Value>,
}

mod duration_secs {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// Registration input; the registry assigns the id and clamps bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSpec {
    /// Owning tenant
    pub tenant: String,
    /// Human name, unique within the tenant
    pub name: String,
    /// Protocol kind
    pub protocol: BackendProtocol,
    /// Network endpoint or launch command
    pub endpoint: BackendEndpoint,
    /// Declared capability map
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
    /// Balancing weight
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry budget for transient failures
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Unordered tag set
    #[serde(default)]
    pub tags: HashSet<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_weight() -> u32 {
    100
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retries() -> u32 {
    3
}

/// Filter for [`BackendRegistry::list`]. Unset fields match everything;
/// `tags` requires every listed tag to be present.
#[derive(Debug, Clone, Default)]
pub struct BackendFilter {
    /// Match a tenant
    pub tenant: Option<String>,
    /// Keep only `Active` backends
    pub active_only: bool,
    /// Restrict to one namespace
    pub namespace: Option<String>,
    /// Required tags (intersection)
    pub tags: Vec<String>,
    /// Match a protocol kind
    pub protocol: Option<BackendProtocol>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<Uuid, Backend>,
    by_name: HashMap<(String, String), Uuid>,
}

/// The backend registry.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    inner: RwLock<RegistryInner>,
    namespaces: RwLock<HashMap<String, HashSet<Uuid>>>,
}

/// Namespace used when a request does not address one explicitly.
pub const DEFAULT_NAMESPACE: &str = "default";

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Fails with `Conflict` when the tenant already
    /// has a backend of that name. New backends join the default namespace.
    pub fn register(&self, spec: BackendSpec) -> GatewayResult<Backend> {
        let mut inner = self.inner.write();
        let name_key = (spec.tenant.clone(), spec.name.clone());
        if inner.by_name.contains_key(&name_key) {
            return Err(GatewayError::Conflict(format!(
                "backend '{}' already registered for tenant '{}'",
                spec.name, spec.tenant
            )));
        }

        let backend = Backend {
            id: Uuid::new_v4(),
            tenant: spec.tenant,
            name: spec.name,
            protocol: spec.protocol,
            endpoint: spec.endpoint,
            capabilities: spec.capabilities,
            weight: spec.weight.min(MAX_WEIGHT),
            timeout: Duration::from_secs(spec.timeout_secs)
                .clamp(MIN_TIMEOUT, MAX_TIMEOUT),
            max_retries: spec.max_retries,
            tags: spec.tags,
            status: BackendStatus::Active,
            health: HealthSnapshot::default(),
            metadata: spec.metadata,
        };
        inner.by_name.insert(name_key, backend.id);
        inner.by_id.insert(backend.id, backend.clone());
        drop(inner);

        self.namespaces
            .write()
            .entry(DEFAULT_NAMESPACE.to_string())
            .or_default()
            .insert(backend.id);

        info!(backend_id = %backend.id, name = %backend.name, "backend registered");
        Ok(backend)
    }

    /// Remove a backend and its namespace memberships.
    pub fn unregister(&self, id: Uuid) -> GatewayResult<()> {
        let mut inner = self.inner.write();
        let backend = inner
            .by_id
            .remove(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("backend {id}")))?;
        inner
            .by_name
            .remove(&(backend.tenant.clone(), backend.name.clone()));
        drop(inner);

        let mut namespaces = self.namespaces.write();
        for members in namespaces.values_mut() {
            members.remove(&id);
        }
        info!(backend_id = %id, "backend unregistered");
        Ok(())
    }

    /// Look up by id.
    pub fn lookup(&self, id: Uuid) -> GatewayResult<Backend> {
        self.inner
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("backend {id}")))
    }

    /// Look up by `(tenant, name)`.
    pub fn lookup_by_name(&self, tenant: &str, name: &str) -> GatewayResult<Backend> {
        let inner = self.inner.read();
        let id = inner
            .by_name
            .get(&(tenant.to_string(), name.to_string()))
            .ok_or_else(|| {
                GatewayError::NotFound(format!("backend '{name}' for tenant '{tenant}'"))
            })?;
        Ok(inner.by_id[id].clone())
    }

    /// List backends matching the filter, ordered by `(tenant, name)` so
    /// selection strategies see a stable candidate sequence.
    pub fn list(&self, filter: &BackendFilter) -> Vec<Backend> {
        let namespace_members = filter.namespace.as_deref().map(|ns| {
            self.namespaces
                .read()
                .get(ns)
                .cloned()
                .unwrap_or_default()
        });
        let mut backends: Vec<Backend> = self
            .inner
            .read()
            .by_id
            .values()
            .filter(|b| {
                filter.tenant.as_deref().is_none_or(|t| t == b.tenant)
                    && (!filter.active_only || b.status == BackendStatus::Active)
                    && namespace_members
                        .as_ref()
                        .is_none_or(|members| members.contains(&b.id))
                    && filter.tags.iter().all(|t| b.tags.contains(t))
                    && filter.protocol.is_none_or(|p| p == b.protocol)
            })
            .cloned()
            .collect();
        backends.sort_by(|a, b| (&a.tenant, &a.name).cmp(&(&b.tenant, &b.name)));
        backends
    }

    /// Set administrative status. Equal transitions are coalesced; returns
    /// whether the status actually changed.
    pub fn set_status(&self, id: Uuid, status: BackendStatus) -> GatewayResult<bool> {
        let mut inner = self.inner.write();
        let backend = inner
            .by_id
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("backend {id}")))?;
        if backend.status == status {
            return Ok(false);
        }
        debug!(backend_id = %id, from = ?backend.status, to = ?status, "status transition");
        backend.status = status;
        Ok(true)
    }

    /// Record a probe outcome into the backend's health snapshot. A success
    /// resets the consecutive-failure counter; a failure increments it.
    /// Returns the counter after the update.
    pub fn record_probe(&self, record: &HealthCheckRecord) -> GatewayResult<u32> {
        let mut inner = self.inner.write();
        let backend = inner
            .by_id
            .get_mut(&record.backend_id)
            .ok_or_else(|| GatewayError::NotFound(format!("backend {}", record.backend_id)))?;
        let health = &mut backend.health;
        health.status = Some(record.status);
        health.latency_ms = record.latency_ms;
        health.checked_at = Some(record.timestamp);
        if record.status.is_success() {
            health.consecutive_failures = 0;
        } else {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        }
        Ok(health.consecutive_failures)
    }

    /// Add a backend to a namespace.
    pub fn assign_namespace(&self, namespace: &str, id: Uuid) -> GatewayResult<()> {
        // Validate existence before touching the namespace map.
        self.lookup(id)?;
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(id);
        Ok(())
    }

    /// Remove a backend from a namespace.
    pub fn remove_from_namespace(&self, namespace: &str, id: Uuid) {
        if let Some(members) = self.namespaces.write().get_mut(namespace) {
            members.remove(&id);
        }
    }

    /// Backend ids in a namespace.
    pub fn namespace_members(&self, namespace: &str) -> HashSet<Uuid> {
        self.namespaces
            .read()
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Every registered backend id.
    pub fn ids(&self) -> Vec<Uuid> {
        self.inner.read().by_id.keys().copied().collect()
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_spec(tenant: &str, name: &str) -> BackendSpec {
        BackendSpec {
            tenant: tenant.to_string(),
            name: name.to_string(),
            protocol: BackendProtocol::Http,
            endpoint: BackendEndpoint::Url("http://127.0.0.1:9000/mcp".parse().unwrap()),
            capabilities: HashMap::new(),
            weight: 100,
            timeout_secs: 30,
            max_retries: 3,
            tags: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn register_is_unique_per_tenant_and_name() {
        let registry = BackendRegistry::new();
        registry.register(http_spec("acme", "a")).unwrap();
        assert!(matches!(
            registry.register(http_spec("acme", "a")),
            Err(GatewayError::Conflict(_))
        ));
        // Same name under another tenant is fine.
        registry.register(http_spec("other", "a")).unwrap();
    }

    #[test]
    fn weight_and_timeout_are_clamped() {
        let registry = BackendRegistry::new();
        let mut spec = http_spec("t", "clamped");
        spec.weight = 5000;
        spec.timeout_secs = 0;
        let backend = registry.register(spec).unwrap();
        assert_eq!(backend.weight, MAX_WEIGHT);
        assert_eq!(backend.timeout, MIN_TIMEOUT);
    }

    #[test]
    fn lookup_by_name_and_unregister() {
        let registry = BackendRegistry::new();
        let backend = registry.register(http_spec("t", "x")).unwrap();
        assert_eq!(registry.lookup_by_name("t", "x").unwrap().id, backend.id);

        registry.unregister(backend.id).unwrap();
        assert!(matches!(
            registry.lookup(backend.id),
            Err(GatewayError::NotFound(_))
        ));
        assert!(registry.namespace_members(DEFAULT_NAMESPACE).is_empty());
    }

    #[test]
    fn list_filters_by_status_namespace_tags_protocol() {
        let registry = BackendRegistry::new();
        let mut spec = http_spec("t", "tagged");
        spec.tags = HashSet::from(["prod".to_string(), "eu".to_string()]);
        let tagged = registry.register(spec).unwrap();
        let other = registry.register(http_spec("t", "other")).unwrap();
        registry.set_status(other.id, BackendStatus::Inactive).unwrap();
        registry.assign_namespace("team-a", tagged.id).unwrap();

        let active = registry.list(&BackendFilter {
            active_only: true,
            ..Default::default()
        });
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, tagged.id);

        let in_ns = registry.list(&BackendFilter {
            namespace: Some("team-a".into()),
            ..Default::default()
        });
        assert_eq!(in_ns.len(), 1);

        let by_tags = registry.list(&BackendFilter {
            tags: vec!["prod".into(), "eu".into()],
            ..Default::default()
        });
        assert_eq!(by_tags.len(), 1);

        let missing_tag = registry.list(&BackendFilter {
            tags: vec!["prod".into(), "us".into()],
            ..Default::default()
        });
        assert!(missing_tag.is_empty());
    }

    #[test]
    fn equal_status_transitions_coalesce() {
        let registry = BackendRegistry::new();
        let backend = registry.register(http_spec("t", "s")).unwrap();
        assert!(registry.set_status(backend.id, BackendStatus::Unhealthy).unwrap());
        assert!(!registry.set_status(backend.id, BackendStatus::Unhealthy).unwrap());
    }

    #[test]
    fn probe_records_drive_the_failure_counter() {
        let registry = BackendRegistry::new();
        let backend = registry.register(http_spec("t", "p")).unwrap();
        let failure = HealthCheckRecord {
            backend_id: backend.id,
            status: ProbeStatus::Timeout,
            latency_ms: None,
            message: Some("deadline".into()),
            timestamp: Utc::now(),
        };
        assert_eq!(registry.record_probe(&failure).unwrap(), 1);
        assert_eq!(registry.record_probe(&failure).unwrap(), 2);

        let success = HealthCheckRecord {
            backend_id: backend.id,
            status: ProbeStatus::Healthy,
            latency_ms: Some(4),
            message: None,
            timestamp: Utc::now(),
        };
        assert_eq!(registry.record_probe(&success).unwrap(), 0);
        let looked_up = registry.lookup(backend.id).unwrap();
        assert_eq!(looked_up.health.latency_ms, Some(4));
        assert_eq!(looked_up.health.status, Some(ProbeStatus::Healthy));
    }
}
