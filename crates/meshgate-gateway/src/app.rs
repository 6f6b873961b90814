//! Gateway assembly and lifecycle.
//!
//! `Gateway::build` wires the subsystems from one configuration: registry
//! seeding, namespace membership, virtual-server adapters, transports,
//! limiter, prober, and the janitor. `run` serves until a shutdown signal,
//! then closes every session and reaps every child before returning.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use meshgate_transport::{ManagerConfig, TransportManager};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::balancer;
use crate::config::GatewayConfig;
use crate::health::HealthProber;
use crate::http::{self, AppState};
use crate::proxy::{Proxy, StdioPool};
use crate::ratelimit::RateLimiter;
use crate::registry::BackendRegistry;
use crate::virtual_server::{RestAdapter, VirtualServerRegistry};

/// A built gateway, ready to serve.
pub struct Gateway {
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("backends", &self.state.registry.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Wire every subsystem from the configuration and start the
    /// background loops.
    pub async fn build(config: GatewayConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()).await);

        let manager = Arc::new(TransportManager::new(ManagerConfig {
            limits: config.session_limits(),
            idle_ttls: config.idle_ttls(),
            ..ManagerConfig::default()
        }));

        let registry = Arc::new(BackendRegistry::new());
        let virtuals = Arc::new(VirtualServerRegistry::new());

        for spec in config.backends.clone() {
            registry.register(spec).context("seeding backends")?;
        }
        for (namespace, names) in &config.namespaces {
            for name in names {
                let backend = registry
                    .list(&Default::default())
                    .into_iter()
                    .find(|b| &b.name == name)
                    .ok_or_else(|| {
                        anyhow!("namespace '{namespace}' references unknown backend '{name}'")
                    })?;
                registry.assign_namespace(namespace, backend.id)?;
            }
        }

        let rest_client = reqwest::Client::new();
        for entry in config.virtual_servers.clone() {
            let backend = registry
                .register(crate::registry::BackendSpec {
                    tenant: entry.tenant,
                    name: entry.name,
                    protocol: crate::registry::BackendProtocol::Http,
                    endpoint: crate::registry::BackendEndpoint::Url(entry.base_url.clone()),
                    capabilities: Default::default(),
                    weight: 100,
                    timeout_secs: 30,
                    max_retries: 3,
                    tags: Default::default(),
                    metadata: Default::default(),
                })
                .context("registering virtual server")?;
            virtuals.attach(
                backend.id,
                Arc::new(RestAdapter::new(
                    rest_client.clone(),
                    entry.base_url,
                    entry.tools,
                )),
            );
        }

        let load_balancer: Arc<dyn balancer::LoadBalancer> =
            Arc::from(balancer::build(config.balancer.strategy));
        let stdio_pool = Arc::new(StdioPool::new(Arc::clone(&manager)));
        let proxy = Arc::new(Proxy::new(
            Arc::clone(&registry),
            Arc::clone(&load_balancer),
            Arc::clone(&virtuals),
            Arc::clone(&stdio_pool),
            config.proxy.clone(),
        ));

        let state = AppState {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            balancer: load_balancer,
            limiter: Arc::clone(&limiter),
            manager: Arc::clone(&manager),
            proxy,
            virtuals,
            stdio_pool: Arc::clone(&stdio_pool),
            started_at: Utc::now(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prober = Arc::new(HealthProber::new(
            Arc::clone(&registry),
            Arc::clone(&manager),
            config.health.to_health_config(),
        ));
        let background = vec![
            tokio::spawn(prober.run(stdio_pool, shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&manager).run_janitor(shutdown_rx.clone())),
            tokio::spawn(limiter.run_sweeper(shutdown_rx)),
        ];

        Ok(Self {
            state,
            shutdown_tx,
            background,
        })
    }

    /// The shared state, for embedding the router in tests.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until ctrl-c, then drain: stop the background loops, close
    /// every session, and reap every child.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self
            .state
            .config
            .server
            .addr()
            .map_err(|reason| anyhow!(reason))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind {addr}"))?;
        info!(%addr, "meshgate listening");

        let router = http::router(self.state.clone());
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

        self.shutdown().await;
        Ok(())
    }

    /// Drain everything; also used directly by tests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.state.manager.shutdown().await;
        for task in self.background {
            if tokio::time::timeout(std::time::Duration::from_secs(11), task)
                .await
                .is_err()
            {
                warn!("background task did not stop in time");
            }
        }
        info!("meshgate stopped");
    }
}
