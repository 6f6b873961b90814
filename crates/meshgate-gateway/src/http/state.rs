//! Shared application state for the HTTP surface.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use meshgate_transport::TransportManager;

use crate::balancer::LoadBalancer;
use crate::config::GatewayConfig;
use crate::proxy::{Proxy, StdioPool};
use crate::ratelimit::RateLimiter;
use crate::registry::BackendRegistry;
use crate::virtual_server::VirtualServerRegistry;

/// Everything the handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Boot configuration
    pub config: Arc<GatewayConfig>,
    /// Backend registry
    pub registry: Arc<BackendRegistry>,
    /// Load balancer
    pub balancer: Arc<dyn LoadBalancer>,
    /// Rate limiter
    pub limiter: Arc<RateLimiter>,
    /// Transport manager
    pub manager: Arc<TransportManager>,
    /// Proxy core
    pub proxy: Arc<Proxy>,
    /// Virtual-server adapters
    pub virtuals: Arc<VirtualServerRegistry>,
    /// STDIO pool shared between the proxy and the prober
    pub stdio_pool: Arc<StdioPool>,
    /// Boot time, for the status surface
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("backends", &self.registry.len())
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
