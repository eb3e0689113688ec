//! stagegrid-report: the agent's outbound channel to the control plane.
//!
//! ```text
//! StatusReporter
//!   ├── push_status()  POST /api/v1/staging/status  (every interval)
//!   └── register()     POST /api/v1/register-local-agent  (once at startup)
//!         │
//!         └── StatusSources → Reconciler, RedirectionManager,
//!                             ProxyManager, TunnelManager
//! ```
//!
//! Ingestion arrives on the agent's own HTTP listener; nothing here
//! ever reads from the control plane.

pub mod error;
pub mod reporter;
pub mod snapshot;

pub use error::{ReportError, ReportResult};
pub use reporter::{AGENT_ID_HEADER, StatusReporter};
pub use snapshot::{ExposureOverview, StatusSnapshot, StatusSources};
