//! Outbound channel to the control plane.
//!
//! The reporter only produces: a periodic status push and a one-shot
//! registration. Failures are logged and left for the next interval;
//! registration is not retried.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stagegrid_core::{AgentConfig, epoch_secs};
use stagegrid_core::config::RegistrationSection;

use crate::error::{ReportError, ReportResult};
use crate::snapshot::{StatusSnapshot, StatusSources};

pub const STATUS_PATH: &str = "/api/v1/staging/status";
pub const REGISTER_PATH: &str = "/api/v1/register-local-agent";
pub const AGENT_ID_HEADER: &str = "X-Agent-ID";

pub struct StatusReporter {
    client: reqwest::Client,
    control_plane: String,
    sources: StatusSources,
    registration: RegistrationSection,
    placeholder_url: String,
    namespace: String,
    cluster_name: String,
    sync_interval: String,
}

impl StatusReporter {
    pub fn new(config: &AgentConfig, sources: StatusSources) -> ReportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.control_plane.request_timeout())
            .build()?;
        Ok(Self {
            client,
            control_plane: config.control_plane.url.trim_end_matches('/').to_string(),
            sources,
            registration: config.registration.clone(),
            placeholder_url: config.tunnel.placeholder_url.clone(),
            namespace: config.cluster.namespace.clone(),
            cluster_name: config.cluster.name.clone(),
            sync_interval: config.reconcile.sync_interval.clone(),
        })
    }

    pub fn sources(&self) -> &StatusSources {
        &self.sources
    }

    /// Build and push one status snapshot.
    pub async fn push_status(&self) -> ReportResult<StatusSnapshot> {
        let snapshot = self.sources.snapshot().await;
        self.post(STATUS_PATH, &snapshot).await?;
        info!(
            total = snapshot.counts.total,
            created = snapshot.counts.created,
            failed = snapshot.counts.failed,
            "status pushed to control plane"
        );
        Ok(snapshot)
    }

    /// Register this agent with the control plane.
    pub async fn register(&self) -> ReportResult<()> {
        let payload = self.registration_payload().await;
        self.post(REGISTER_PATH, &payload).await?;
        info!(
            agent_id = %self.sources.agent_id,
            host = %payload["host"],
            current_pods = %payload["pod_scheduling"]["current_pods"],
            "registered with control plane"
        );
        Ok(())
    }

    /// The registration document: advertised host, capabilities,
    /// resources and current workloads.
    pub async fn registration_payload(&self) -> serde_json::Value {
        let host = self
            .sources
            .public_url()
            .await
            .unwrap_or_else(|| self.placeholder_url.clone());
        let workloads = self.sources.reconciler.snapshot().await;
        let cluster_status = self.sources.reconciler.cluster().health().await;

        let capabilities: serde_json::Map<String, serde_json::Value> = self
            .registration
            .capabilities
            .iter()
            .map(|c| (c.clone(), serde_json::Value::Bool(true)))
            .collect();

        json!({
            "host": host,
            "agent_info": {
                "agent_id": self.sources.agent_id,
                "status": "healthy",
                "timestamp": epoch_secs(),
            },
            "pod_scheduling": {
                "current_pods": workloads.len(),
                "available_pods": workloads,
                "capabilities": capabilities,
                "resources": {
                    "cpu_available": self.registration.cpu_available,
                    "memory_available": self.registration.memory_available,
                    "storage_available": self.registration.storage_available,
                    "network_ports": self.registration.network_ports,
                },
                "staging_config": {
                    "namespace": self.namespace,
                    "cluster_name": self.cluster_name,
                    "sync_interval": self.sync_interval,
                    "auto_scale": self.registration.auto_scale,
                    "pod_scheduling": true,
                },
            },
            "endpoints": {
                "health": "/health",
                "pod_status": "/api/v1/pods/status",
                "register_agent": REGISTER_PATH,
                "pod_update": "/api/v1/pods",
            },
            "cluster_status": cluster_status,
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> ReportResult<()> {
        let endpoint = format!("{}{}", self.control_plane, path);
        let response = self
            .client
            .post(&endpoint)
            .header(AGENT_ID_HEADER, &self.sources.agent_id)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ReportError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }
        debug!(%endpoint, "control plane accepted request");
        Ok(())
    }

    /// Push immediately, then every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "status reporter started");
        if let Err(e) = self.push_status().await {
            warn!(error = %e, "status push failed");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.push_status().await {
                        warn!(error = %e, "status push failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("status reporter shutting down");
                    break;
                }
            }
        }
    }

    /// One registration attempt, logged either way.
    pub async fn register_once(&self) {
        if let Err(e) = self.register().await {
            error!(error = %e, "control plane registration failed");
        }
    }
}
