//! Shared domain types used across Stagegrid crates.
//!
//! Desired-state descriptors arrive from the control plane, tracked
//! workloads are owned by the reconciler, and the exposure records
//! (redirections, proxy routes, tunnels) are owned by their managers.
//! Everything here is plain data; locking lives with the owners.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a workload, assigned by the control plane.
pub type WorkloadId = String;

// ── Desired state ─────────────────────────────────────────────────

/// A workload the control plane wants mirrored locally.
///
/// The control plane's pod payloads carry more fields than this
/// (usage figures, remote status); unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadDescriptor {
    pub id: WorkloadId,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub image: String,
    /// Address the workload is reachable at in the remote environment.
    #[serde(default, alias = "ip")]
    pub remote_address: String,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Status string as reported by the remote environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_status: Option<String>,
    #[serde(default, alias = "node_name", skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Unix timestamp (seconds), stamped on first ingestion.
    #[serde(default, skip_deserializing)]
    pub created_at: u64,
    /// Unix timestamp (seconds), stamped on every ingestion.
    #[serde(default, skip_deserializing)]
    pub updated_at: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_remote_port() -> u16 {
    80
}

impl WorkloadDescriptor {
    /// Minimal descriptor, mostly useful for tests and fixtures.
    pub fn new(id: &str, name: &str, image: &str, remote_address: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            namespace: default_namespace(),
            image: image.to_string(),
            remote_address: remote_address.to_string(),
            remote_port: default_remote_port(),
            labels: HashMap::new(),
            remote_status: None,
            node: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// A descriptor without an id or name cannot be keyed or named
    /// downstream and is rejected at ingestion.
    pub fn is_well_formed(&self) -> bool {
        !self.id.trim().is_empty() && !self.name.trim().is_empty()
    }
}

// ── Tracked workloads ─────────────────────────────────────────────

/// Lifecycle of a workload in the local cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotCreated,
    Created,
    Failed,
}

impl LifecycleState {
    /// Whether the reconciler should attempt a cluster create.
    pub fn needs_create(&self) -> bool {
        matches!(self, LifecycleState::NotCreated | LifecycleState::Failed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::NotCreated => write!(f, "not_created"),
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Failed => write!(f, "failed"),
        }
    }
}

/// A desired workload as seen by the reconciler.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackedWorkload {
    #[serde(flatten)]
    pub descriptor: WorkloadDescriptor,
    pub state: LifecycleState,
    /// Address assigned by the local cluster, once known.
    pub local_address: Option<String>,
    /// Message from the most recent failed create.
    pub last_error: Option<String>,
    /// Number of create attempts made so far.
    pub attempts: u32,
    pub first_seen: u64,
    pub last_updated: u64,
}

impl TrackedWorkload {
    pub fn new(descriptor: WorkloadDescriptor, now: u64) -> Self {
        Self {
            descriptor,
            state: LifecycleState::NotCreated,
            local_address: None,
            last_error: None,
            attempts: 0,
            first_seen: now,
            last_updated: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Aggregate lifecycle counts over the tracked table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadCounts {
    pub total: usize,
    pub created: usize,
    pub failed: usize,
    pub not_created: usize,
}

impl WorkloadCounts {
    pub fn record(&mut self, state: LifecycleState) {
        self.total += 1;
        match state {
            LifecycleState::Created => self.created += 1,
            LifecycleState::Failed => self.failed += 1,
            LifecycleState::NotCreated => self.not_created += 1,
        }
    }
}

// ── Exposure records ──────────────────────────────────────────────

/// Status shared by redirections, proxy routes and tunnels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExposureStatus {
    Pending,
    Active,
    Failed,
}

impl std::fmt::Display for ExposureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExposureStatus::Pending => write!(f, "pending"),
            ExposureStatus::Active => write!(f, "active"),
            ExposureStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-table status summary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExposureSummary {
    pub total: usize,
    pub active: usize,
    pub pending: usize,
    pub failed: usize,
}

impl ExposureSummary {
    pub fn from_statuses(statuses: impl IntoIterator<Item = ExposureStatus>) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            summary.total += 1;
            match status {
                ExposureStatus::Active => summary.active += 1,
                ExposureStatus::Pending => summary.pending += 1,
                ExposureStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

/// Local TCP port forwarded to a workload's remote address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortRedirection {
    pub workload_id: WorkloadId,
    pub workload_name: String,
    pub remote_address: String,
    pub remote_port: u16,
    /// Address assigned by the local cluster.
    pub local_address: String,
    pub local_port: u16,
    pub status: ExposureStatus,
    /// Hostname registered in the alias file, if that succeeded.
    pub alias: Option<String>,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// HTTP path on the shared listener forwarded to a workload backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyRoute {
    pub route_id: String,
    pub workload_id: WorkloadId,
    pub workload_name: String,
    /// Path prefix, always `/<name>`.
    pub path: String,
    pub backend_address: String,
    pub backend_url: String,
    /// URL the route is reachable at on this host.
    pub local_url: String,
    pub status: ExposureStatus,
    pub created_at: u64,
}

/// A supervised tunnel publishing one local port under a public URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelEndpoint {
    pub tunnel_id: String,
    pub hostname: String,
    pub local_port: u16,
    pub protocol: String,
    pub public_url: String,
    pub status: ExposureStatus,
    pub pid: Option<u32>,
    pub created_at: u64,
}
