//! Gateway configuration.
//!
//! Boot takes one YAML file plus a handful of environment overrides
//! (`MESHGATE_REDIS_URL`, `MESHGATE_JWT_SECRET`, `MESHGATE_LOG_LEVEL`,
//! `MESHGATE_LISTEN`). An invalid config aborts boot with a single-line
//! reason; nothing starts half-configured.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::balancer::BalancerStrategy;
use crate::proxy::ProxyConfig;
use crate::ratelimit::RateLimitConfig;
use crate::registry::BackendSpec;
use crate::virtual_server::RestToolMapping;

/// Listen address configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSection {
    /// The socket address to bind.
    pub fn addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("invalid listen address: {e}"))
    }
}

/// Session capacity section.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// Global cap on live sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-tenant cap on live sessions
    #[serde(default = "default_max_per_tenant")]
    pub max_sessions_per_tenant: usize,
    /// Idle ttl for single-shot HTTP bookkeeping sessions (seconds)
    #[serde(default = "default_http_ttl")]
    pub http_idle_secs: u64,
    /// Idle ttl for streaming sessions (seconds)
    #[serde(default = "default_stream_ttl")]
    pub stream_idle_secs: u64,
    /// Idle ttl for stdio sessions (seconds)
    #[serde(default = "default_stdio_ttl")]
    pub stdio_idle_secs: u64,
}

fn default_max_sessions() -> usize {
    10_000
}
fn default_max_per_tenant() -> usize {
    1_000
}
fn default_http_ttl() -> u64 {
    60
}
fn default_stream_ttl() -> u64 {
    300
}
fn default_stdio_ttl() -> u64 {
    600
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_sessions_per_tenant: default_max_per_tenant(),
            http_idle_secs: default_http_ttl(),
            stream_idle_secs: default_stream_ttl(),
            stdio_idle_secs: default_stdio_ttl(),
        }
    }
}

/// Health prober section.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    /// Probe interval (seconds)
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    /// Per-probe deadline (seconds)
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    /// Consecutive failures before a backend goes unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_probe_interval() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HealthSection {
    /// Convert into prober tuning.
    pub fn to_health_config(&self) -> crate::health::HealthConfig {
        crate::health::HealthConfig {
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            failure_threshold: self.failure_threshold,
        }
    }
}

/// Load-balancer section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BalancerSection {
    /// Selection strategy
    #[serde(default)]
    pub strategy: BalancerStrategy,
}

/// One virtual server entry: a REST upstream presented as a backend.
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualServerSection {
    /// Owning tenant
    pub tenant: String,
    /// Backend name, unique within the tenant
    pub name: String,
    /// Upstream base URL
    pub base_url: url::Url,
    /// Declared tool mappings
    #[serde(default)]
    pub tools: Vec<RestToolMapping>,
}

/// The whole gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Listen address
    #[serde(default)]
    pub server: ServerSection,
    /// Log filter, `tracing_subscriber` env-filter syntax
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Shared secret for token validation (consumed by the external auth
    /// layer; carried here so one file configures the deployment)
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Session capacity
    #[serde(default)]
    pub sessions: SessionSection,
    /// Rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Health probing
    #[serde(default)]
    pub health: HealthSection,
    /// Load balancing
    #[serde(default)]
    pub balancer: BalancerSection,
    /// Proxy retry and breaker tuning
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Statically registered backends
    #[serde(default)]
    pub backends: Vec<BackendSpec>,
    /// Namespace memberships: namespace → backend names
    #[serde(default)]
    pub namespaces: HashMap<String, Vec<String>>,
    /// Virtual servers
    #[serde(default)]
    pub virtual_servers: Vec<VirtualServerSection>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load from a YAML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config '{}': {e}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| format!("cannot parse config '{}': {e}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply the standard environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("MESHGATE_REDIS_URL") {
            if !url.is_empty() {
                self.rate_limit.redis_url = Some(url);
            }
        }
        if let Ok(secret) = std::env::var("MESHGATE_JWT_SECRET") {
            if !secret.is_empty() {
                self.jwt_secret = Some(secret);
            }
        }
        if let Ok(level) = std::env::var("MESHGATE_LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
        if let Ok(listen) = std::env::var("MESHGATE_LISTEN") {
            if let Some((host, port)) = listen.rsplit_once(':') {
                if let Ok(port) = port.parse() {
                    self.server.host = host.to_string();
                    self.server.port = port;
                }
            }
        }
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        self.server.addr()?;
        if self.server.port == 0 {
            return Err("listen port must be non-zero".to_string());
        }
        self.rate_limit.validate()?;
        if self.health.interval_secs == 0 {
            return Err("health.interval_secs must be positive".to_string());
        }
        if self.health.failure_threshold == 0 {
            return Err("health.failure_threshold must be positive".to_string());
        }
        if self.sessions.max_sessions == 0 {
            return Err("sessions.max_sessions must be positive".to_string());
        }
        let mut names = std::collections::HashSet::new();
        for backend in &self.backends {
            if !names.insert((backend.tenant.clone(), backend.name.clone())) {
                return Err(format!(
                    "duplicate backend '{}' for tenant '{}'",
                    backend.name, backend.tenant
                ));
            }
        }
        Ok(())
    }

    /// Session limits for the transport manager.
    pub fn session_limits(&self) -> meshgate_transport::SessionLimits {
        meshgate_transport::SessionLimits {
            max_sessions: self.sessions.max_sessions,
            max_sessions_per_tenant: self.sessions.max_sessions_per_tenant,
        }
    }

    /// Idle ttl map for the janitor.
    pub fn idle_ttls(&self) -> HashMap<meshgate_transport::TransportType, Duration> {
        use meshgate_transport::TransportType;
        HashMap::from([
            (
                TransportType::Http,
                Duration::from_secs(self.sessions.http_idle_secs),
            ),
            (
                TransportType::Sse,
                Duration::from_secs(self.sessions.stream_idle_secs),
            ),
            (
                TransportType::WebSocket,
                Duration::from_secs(self.sessions.stream_idle_secs),
            ),
            (
                TransportType::Streamable,
                Duration::from_secs(self.sessions.stream_idle_secs),
            ),
            (
                TransportType::Stdio,
                Duration::from_secs(self.sessions.stdio_idle_secs),
            ),
        ])
    }
}
