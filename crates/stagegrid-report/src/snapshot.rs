//! Status snapshots assembled from every owner table.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use stagegrid_core::{
    ExposureSummary, PortRedirection, ProxyRoute, TrackedWorkload, TunnelEndpoint, WorkloadCounts,
    epoch_secs,
};
use stagegrid_expose::{ProxyManager, RedirectionManager, TunnelManager};
use stagegrid_reconcile::{ClusterHealth, Reconciler};

/// Everything the agent reports about itself at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub agent_id: String,
    /// `healthy`, or `degraded` when the cluster is not running.
    pub status: String,
    pub counts: WorkloadCounts,
    pub workloads: BTreeMap<String, TrackedWorkload>,
    pub redirections: Vec<PortRedirection>,
    pub proxies: Vec<ProxyRoute>,
    pub tunnels: Vec<TunnelEndpoint>,
    pub exposure: ExposureOverview,
    pub cluster_status: ClusterHealth,
    pub last_sync: Option<u64>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExposureOverview {
    pub redirections: ExposureSummary,
    pub proxies: ExposureSummary,
    pub tunnels: ExposureSummary,
}

/// Read handles on the tables a snapshot is built from.
///
/// Each table is read through its owner in turn, so no two table locks
/// are ever held together.
#[derive(Clone)]
pub struct StatusSources {
    pub agent_id: String,
    pub reconciler: Arc<Reconciler>,
    pub redirections: Arc<RedirectionManager>,
    pub proxies: Arc<ProxyManager>,
    /// `None` when tunnelling is disabled.
    pub tunnels: Option<Arc<TunnelManager>>,
}

impl StatusSources {
    pub async fn snapshot(&self) -> StatusSnapshot {
        let workloads: BTreeMap<_, _> = self
            .reconciler
            .snapshot()
            .await
            .into_iter()
            .map(|t| (t.descriptor.id.clone(), t))
            .collect();
        let counts = self.reconciler.counts().await;
        let redirections = self.redirections.list().await;
        let proxies = self.proxies.list().await;
        let tunnels = match &self.tunnels {
            Some(t) => t.list().await,
            None => Vec::new(),
        };
        let cluster_status = self.reconciler.cluster().health().await;

        let exposure = ExposureOverview {
            redirections: ExposureSummary::from_statuses(redirections.iter().map(|r| r.status)),
            proxies: ExposureSummary::from_statuses(proxies.iter().map(|r| r.status)),
            tunnels: ExposureSummary::from_statuses(tunnels.iter().map(|t| t.status)),
        };
        let status = match cluster_status {
            ClusterHealth::Running => "healthy",
            _ => "degraded",
        };

        StatusSnapshot {
            agent_id: self.agent_id.clone(),
            status: status.to_string(),
            counts,
            workloads,
            redirections,
            proxies,
            tunnels,
            exposure,
            cluster_status,
            last_sync: self.reconciler.last_sync(),
            timestamp: epoch_secs(),
        }
    }

    /// Best public URL to advertise: an established tunnel, else the
    /// placeholder, else `None` when tunnelling is off.
    pub async fn public_url(&self) -> Option<String> {
        match &self.tunnels {
            Some(t) => Some(t.best_public_url().await),
            None => None,
        }
    }
}
