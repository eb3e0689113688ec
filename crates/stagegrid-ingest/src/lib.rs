//! stagegrid-ingest: the desired-state feed.
//!
//! The control plane pushes batches of workload descriptors to the
//! agent. This crate owns the resulting desired-state table and hands
//! out copies of it to the reconciler; nothing outside the store ever
//! holds a reference into the table.
//!
//! ```text
//! control plane ──POST batch──▶ DesiredStateStore ──snapshot()──▶ Reconciler
//! ```

pub mod error;
pub mod store;

pub use error::{IngestError, IngestResult};
pub use store::{BatchAction, DesiredStateStore, IngestBatch, IngestOutcome};
