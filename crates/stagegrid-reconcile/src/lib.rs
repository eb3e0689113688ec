//! stagegrid-reconcile: keeps the local cluster in line with the
//! desired-state feed.
//!
//! ```text
//! Reconciler
//!   ├── DesiredStateSource (ingested snapshot, read-only copy)
//!   ├── ClusterControl (kind + kubectl, or a test fake)
//!   └── exposure managers (redirections, proxy routes)
//! ```
//!
//! Each tracked workload moves NotCreated → Created, or → Failed and
//! back to Created on a later tick. No tick ever leaves Created; a
//! changed descriptor updates the tracked copy without re-creating.

pub mod cluster;
pub mod error;
pub mod kubectl;
pub mod reconciler;

pub use cluster::{ClusterControl, ClusterHealth, ClusterWorkload, CreatedWorkload};
pub use error::{ClusterError, ClusterResult, ReconcileError, ReconcileResult};
pub use kubectl::KubectlCluster;
pub use reconciler::{DesiredStateSource, ReconcileReport, Reconciler};
