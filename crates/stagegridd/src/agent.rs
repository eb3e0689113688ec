//! Agent assembly and lifecycle.
//!
//! Builds every subsystem from one `AgentConfig`, then runs the
//! background loops next to the API server until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stagegrid_core::AgentConfig;
use stagegrid_expose::{ProxyManager, RedirectionManager, TunnelManager};
use stagegrid_ingest::DesiredStateStore;
use stagegrid_reconcile::{ClusterControl, Reconciler};
use stagegrid_report::{StatusReporter, StatusSources};

pub struct Agent {
    pub config: AgentConfig,
    pub agent_id: String,
    pub store: Arc<DesiredStateStore>,
    pub redirections: Arc<RedirectionManager>,
    pub proxies: Arc<ProxyManager>,
    pub tunnels: Option<Arc<TunnelManager>>,
    pub reconciler: Arc<Reconciler>,
    pub reporter: Arc<StatusReporter>,
}

impl Agent {
    pub fn new(mut config: AgentConfig, cluster: Arc<dyn ClusterControl>) -> anyhow::Result<Self> {
        config.validate()?;
        let agent_id = config.resolve_agent_id();
        let probe_timeout = config.health.probe_timeout();

        let store = Arc::new(DesiredStateStore::new(agent_id.clone()));
        let redirections = Arc::new(
            RedirectionManager::new(&config.redirect)
                .with_reserved_ports(config.listener_ports().map(|(_, port)| port)),
        );
        let proxies = Arc::new(ProxyManager::new(
            agent_id.clone(),
            &config.proxy,
            probe_timeout,
        ));
        let tunnels = if config.tunnel.enabled {
            let hostname = config.tunnel_hostname(&agent_id);
            Some(Arc::new(TunnelManager::new(&config.tunnel, hostname, probe_timeout)?))
        } else {
            None
        };

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            cluster,
            redirections.clone(),
            proxies.clone(),
        ));

        let sources = StatusSources {
            agent_id: agent_id.clone(),
            reconciler: reconciler.clone(),
            redirections: redirections.clone(),
            proxies: proxies.clone(),
            tunnels: tunnels.clone(),
        };
        let reporter = Arc::new(StatusReporter::new(&config, sources)?);

        Ok(Self {
            config,
            agent_id,
            store,
            redirections,
            proxies,
            tunnels,
            reconciler,
            reporter,
        })
    }

    pub fn sources(&self) -> StatusSources {
        self.reporter.sources().clone()
    }

    pub fn router(&self) -> Router {
        stagegrid_api::build_router(self.store.clone(), self.reporter.clone())
    }

    /// Bring up local listeners and external infrastructure.
    ///
    /// Only the proxy listener is fatal. Cluster and tunnel failures leave
    /// the agent in degraded service.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        let proxy_addr = self
            .proxies
            .start()
            .await
            .with_context(|| format!("binding proxy listener on port {}", self.config.proxy.listen_port))?;
        info!(addr = %proxy_addr, "proxy listener ready");

        let cluster = self.reconciler.cluster();
        match cluster.ensure_cluster().await {
            Ok(()) => info!(cluster = %self.config.cluster.name, "local cluster ready"),
            Err(e) => warn!(error = %e, "local cluster unavailable, continuing degraded"),
        }

        if let Some(tunnels) = &self.tunnels {
            match tunnels.setup().await {
                Ok(t) => info!(
                    tunnel_id = %t.tunnel_id,
                    public_url = %t.public_url,
                    status = %t.status,
                    "tunnel started"
                ),
                Err(e) => warn!(error = %e, "tunnel setup failed"),
            }
        }
        Ok(())
    }

    /// One pass over forwarders, proxy routes and tunnels. Nothing is
    /// removed; results are only logged.
    pub async fn health_pass(&self) {
        for id in self.redirections.check_forwarders().await {
            warn!(workload_id = %id, "redirection forwarder exited");
        }

        let routes = self.proxies.health_check().await;
        let unhealthy = routes.iter().filter(|r| !r.healthy).count();
        for route in routes.iter().filter(|r| !r.healthy) {
            warn!(
                workload_id = %route.workload_id,
                path = %route.path,
                detail = %route.detail,
                "proxy route unhealthy"
            );
        }

        if let Some(tunnels) = &self.tunnels {
            for tunnel in tunnels.health_check().await {
                if !tunnel.healthy {
                    warn!(tunnel_id = %tunnel.tunnel_id, public_url = %tunnel.public_url, "tunnel unhealthy");
                }
            }
        }
        debug!(routes = routes.len(), unhealthy, "health pass complete");
    }

    async fn health_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "health checker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.health_pass().await;
                }
                _ = shutdown.changed() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }

    /// Run the agent on `listener` until `shutdown` flips.
    ///
    /// After the API server and every loop have stopped, supervised
    /// processes are stopped explicitly.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.prepare().await?;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let agent = self.clone();
        let rx = shutdown.clone();
        let interval = self.config.reconcile.sync_interval();
        handles.push(tokio::spawn(async move {
            agent.reconciler.run(interval, rx).await;
        }));

        let agent = self.clone();
        let rx = shutdown.clone();
        let interval = self.config.control_plane.status_interval();
        handles.push(tokio::spawn(async move {
            agent.reporter.run(interval, rx).await;
        }));

        let agent = self.clone();
        let rx = shutdown.clone();
        let interval = self.config.health.check_interval();
        handles.push(tokio::spawn(async move {
            agent.health_loop(interval, rx).await;
        }));

        if self.config.registration.enabled {
            let agent = self.clone();
            handles.push(tokio::spawn(async move {
                agent.reporter.register_once().await;
            }));
        }

        let addr = listener.local_addr()?;
        info!(%addr, agent_id = %self.agent_id, "agent API listening");

        let mut server_shutdown = shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                // A dropped sender also ends the server.
                let _ = server_shutdown.changed().await;
            })
            .await?;

        for handle in handles {
            let _ = handle.await;
        }
        self.stop_processes().await;
        info!("agent stopped");
        Ok(())
    }

    /// Stop forwarders, tunnels and the proxy listener.
    pub async fn stop_processes(&self) {
        self.redirections.shutdown().await;
        if let Some(tunnels) = &self.tunnels {
            tunnels.shutdown().await;
        }
        self.proxies.shutdown();
    }
}
