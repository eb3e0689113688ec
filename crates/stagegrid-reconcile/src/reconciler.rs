//! The reconciliation loop.
//!
//! Each tick pulls the desired-state snapshot, tracks new workloads,
//! makes one create attempt for every workload that is not yet created,
//! and wires exposure for created workloads. No lock on the tracked
//! table is held while the cluster or an exposure manager is called.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use stagegrid_core::{
    LifecycleState, TrackedWorkload, WorkloadCounts, WorkloadDescriptor, WorkloadId, epoch_secs,
};
use stagegrid_expose::{ExposeError, ProxyManager, RedirectionManager};
use stagegrid_ingest::DesiredStateStore;

use crate::cluster::ClusterControl;
use crate::error::{ReconcileError, ReconcileResult};

/// Where the reconciler reads desired state from.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// A copy of the current desired set.
    async fn desired(&self) -> Vec<WorkloadDescriptor>;
}

#[async_trait]
impl DesiredStateSource for DesiredStateStore {
    async fn desired(&self) -> Vec<WorkloadDescriptor> {
        self.snapshot().await
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Create attempts made.
    pub attempted: usize,
    pub created: usize,
    pub failed: usize,
    /// Workloads with a full set of exposure records after the tick.
    pub exposed: usize,
}

pub struct Reconciler {
    source: Arc<dyn DesiredStateSource>,
    cluster: Arc<dyn ClusterControl>,
    redirections: Arc<RedirectionManager>,
    proxies: Arc<ProxyManager>,
    tracked: RwLock<HashMap<WorkloadId, TrackedWorkload>>,
    last_sync: AtomicU64,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn DesiredStateSource>,
        cluster: Arc<dyn ClusterControl>,
        redirections: Arc<RedirectionManager>,
        proxies: Arc<ProxyManager>,
    ) -> Self {
        Self {
            source,
            cluster,
            redirections,
            proxies,
            tracked: RwLock::new(HashMap::new()),
            last_sync: AtomicU64::new(0),
        }
    }

    pub fn cluster(&self) -> Arc<dyn ClusterControl> {
        self.cluster.clone()
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> ReconcileReport {
        let desired = self.source.desired().await;
        let now = epoch_secs();
        let mut report = ReconcileReport::default();

        // Track new workloads and pick the ones needing a create attempt.
        let mut to_create = Vec::new();
        let mut created = Vec::new();
        {
            let mut tracked = self.tracked.write().await;
            for desc in desired {
                match tracked.get_mut(&desc.id) {
                    Some(entry) => {
                        // Descriptor changes never reset lifecycle state.
                        if !same_identity(&entry.descriptor, &desc) {
                            debug!(workload_id = %desc.id, "tracked descriptor updated");
                            entry.last_updated = now;
                        }
                        entry.descriptor = desc;
                    }
                    None => {
                        info!(
                            workload_id = %desc.id,
                            name = %desc.name,
                            image = %desc.image,
                            "tracking new workload"
                        );
                        tracked.insert(desc.id.clone(), TrackedWorkload::new(desc, now));
                    }
                }
            }
            for entry in tracked.values() {
                if entry.state.needs_create() {
                    to_create.push(entry.descriptor.clone());
                } else {
                    created.push((entry.descriptor.clone(), entry.local_address.clone()));
                }
            }
        }

        to_create.sort_by(|a, b| a.id.cmp(&b.id));
        for desc in to_create {
            report.attempted += 1;
            let result = self.cluster.create_workload(&desc).await;

            let mut tracked = self.tracked.write().await;
            let Some(entry) = tracked.get_mut(&desc.id) else {
                continue;
            };
            entry.attempts += 1;
            entry.last_updated = epoch_secs();
            match result {
                Ok(workload) => {
                    entry.state = LifecycleState::Created;
                    entry.last_error = None;
                    if workload.local_address.is_some() {
                        entry.local_address = workload.local_address.clone();
                    }
                    report.created += 1;
                    info!(
                        workload_id = %desc.id,
                        pod = %workload.name,
                        namespace = %workload.namespace,
                        local_address = ?workload.local_address,
                        "workload created in local cluster"
                    );
                    created.push((desc, entry.local_address.clone()));
                }
                Err(e) => {
                    entry.state = LifecycleState::Failed;
                    entry.last_error = Some(e.to_string());
                    report.failed += 1;
                    warn!(
                        workload_id = %desc.id,
                        attempts = entry.attempts,
                        error = %e,
                        "workload create failed, retrying next tick"
                    );
                }
            }
        }

        created.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        for (desc, local_address) in created {
            if self.wire_exposure(&desc, local_address).await {
                report.exposed += 1;
            }
        }

        self.last_sync.store(epoch_secs(), Ordering::Relaxed);
        debug!(
            attempted = report.attempted,
            created = report.created,
            failed = report.failed,
            exposed = report.exposed,
            "reconciliation tick complete"
        );
        report
    }

    /// Set up whatever exposure a created workload is still missing.
    ///
    /// Returns true when the workload has every record it should have.
    async fn wire_exposure(&self, desc: &WorkloadDescriptor, known: Option<String>) -> bool {
        let wants_redirect = !desc.remote_address.trim().is_empty();
        let has_redirect = !wants_redirect || self.redirections.contains(&desc.id).await;
        let has_route = self.proxies.contains(&desc.id).await;
        if has_redirect && has_route {
            return true;
        }

        let local_address = match known {
            Some(addr) => addr,
            None => match self.cluster.workload_address(desc).await {
                Ok(Some(addr)) => {
                    self.record_address(&desc.id, &addr).await;
                    addr
                }
                Ok(None) => {
                    debug!(workload_id = %desc.id, "no cluster address yet, exposure deferred");
                    return false;
                }
                Err(e) => {
                    warn!(workload_id = %desc.id, error = %e, "cannot read cluster address, exposure deferred");
                    return false;
                }
            },
        };

        let mut complete = true;
        if !has_redirect {
            match self.redirections.setup(desc, &local_address).await {
                Ok(r) => debug!(workload_id = %desc.id, local_port = r.local_port, status = %r.status, "redirection wired"),
                Err(e) => {
                    warn!(workload_id = %desc.id, error = %e, "redirection setup failed");
                    complete = false;
                }
            }
        }
        if !has_route {
            match self.proxies.setup(desc, &local_address).await {
                Ok(r) => debug!(workload_id = %desc.id, path = %r.path, "proxy route wired"),
                Err(e) => {
                    warn!(workload_id = %desc.id, error = %e, "proxy setup failed");
                    complete = false;
                }
            }
        }
        complete
    }

    async fn record_address(&self, id: &str, address: &str) {
        let mut tracked = self.tracked.write().await;
        if let Some(entry) = tracked.get_mut(id) {
            entry.local_address = Some(address.to_string());
            entry.last_updated = epoch_secs();
        }
    }

    /// Stop tracking a workload: delete it from the cluster and tear down
    /// its exposure. If the workload is still desired it is picked up
    /// again as new on the next tick.
    pub async fn forget(&self, id: &str) -> ReconcileResult<TrackedWorkload> {
        let desc = self
            .get(id)
            .await
            .map(|t| t.descriptor)
            .ok_or_else(|| ReconcileError::NotTracked(id.to_string()))?;

        self.cluster.delete_workload(&desc).await?;

        match self.redirections.remove(id).await {
            Ok(_) | Err(ExposeError::RedirectionNotFound(_)) => {}
            Err(e) => warn!(workload_id = %id, error = %e, "redirection teardown failed"),
        }
        match self.proxies.remove(id).await {
            Ok(_) | Err(ExposeError::RouteNotFound(_)) => {}
            Err(e) => warn!(workload_id = %id, error = %e, "proxy teardown failed"),
        }

        let removed = self
            .tracked
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ReconcileError::NotTracked(id.to_string()))?;
        info!(workload_id = %id, "workload forgotten");
        Ok(removed)
    }

    /// Copy of the tracked table, sorted by id.
    pub async fn snapshot(&self) -> Vec<TrackedWorkload> {
        let tracked = self.tracked.read().await;
        let mut all: Vec<_> = tracked.values().cloned().collect();
        all.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        all
    }

    pub async fn counts(&self) -> WorkloadCounts {
        let tracked = self.tracked.read().await;
        let mut counts = WorkloadCounts::default();
        for entry in tracked.values() {
            counts.record(entry.state);
        }
        counts
    }

    pub async fn get(&self, id: &str) -> Option<TrackedWorkload> {
        self.tracked.read().await.get(id).cloned()
    }

    /// Unix time of the last completed tick.
    pub fn last_sync(&self) -> Option<u64> {
        match self.last_sync.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        }
    }

    /// Tick immediately, then every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "reconciler started");
        self.tick().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}

/// Compares the fields that describe the workload, ignoring freshness stamps.
fn same_identity(a: &WorkloadDescriptor, b: &WorkloadDescriptor) -> bool {
    a.name == b.name
        && a.namespace == b.namespace
        && a.image == b.image
        && a.remote_address == b.remote_address
        && a.remote_port == b.remote_port
        && a.labels == b.labels
}
