//! stagegrid-expose: traffic exposure for reconciled workloads.
//!
//! Each manager owns its own table behind its own lock and is only
//! ever called, never reached into.
//!
//! # Components
//!
//! - **`redirect`**: local ports forwarded to remote workload addresses,
//!   using **`ports`** for allocation and **`alias`** for name aliases
//! - **`proxy`**: path routes on one shared HTTP listener
//! - **`tunnel`**: a supervised tunnel process publishing a local port
//! - **`process`**: the managed-subprocess handle forwarders and tunnels run under
//! - **`probe`**: HTTP probes for route and tunnel health checks

pub mod alias;
pub mod error;
pub mod ports;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod redirect;
pub mod tunnel;

pub use error::{ExposeError, ExposeResult};
pub use ports::PortAllocator;
pub use process::{ManagedProcess, ProcessSpec};
pub use proxy::{ProxyManager, RouteHealth};
pub use redirect::RedirectionManager;
pub use tunnel::{RemovedTunnel, TunnelHealth, TunnelManager};
