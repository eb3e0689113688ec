//! Cluster control interface.
//!
//! The reconciler only ever talks to the local cluster through this
//! trait. `KubectlCluster` is the production adapter; tests substitute
//! an in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stagegrid_core::WorkloadDescriptor;

use crate::error::ClusterResult;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWorkload {
    pub name: String,
    pub namespace: String,
    /// Address assigned by the cluster. Often not known yet right after
    /// the create call returns.
    pub local_address: Option<String>,
}

/// A workload as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterWorkload {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub address: Option<String>,
    pub ready: bool,
    pub restarts: u32,
    pub node: Option<String>,
}

/// Coarse cluster state, reported as-is to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterHealth {
    Running,
    NotFound,
    Unknown,
}

impl ClusterHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterHealth::Running => "running",
            ClusterHealth::NotFound => "not-found",
            ClusterHealth::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Make sure the cluster exists, creating it if needed.
    async fn ensure_cluster(&self) -> ClusterResult<()>;

    async fn create_workload(&self, workload: &WorkloadDescriptor) -> ClusterResult<CreatedWorkload>;

    /// Current cluster-assigned address, `None` while unassigned.
    async fn workload_address(&self, workload: &WorkloadDescriptor) -> ClusterResult<Option<String>>;

    async fn list_workloads(&self) -> ClusterResult<Vec<ClusterWorkload>>;

    async fn delete_workload(&self, workload: &WorkloadDescriptor) -> ClusterResult<()>;

    /// Never fails; inability to tell is `Unknown`.
    async fn health(&self) -> ClusterHealth;
}
