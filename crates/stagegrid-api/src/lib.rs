//! stagegrid-api: the agent's inbound REST surface.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/pods` | Desired-state push from the control plane |
//! | GET | `/api/v1/pods/status` | Ingested desired-state snapshot |
//! | GET | `/api/v1/status` | Full status snapshot |
//! | GET | `/api/v1/workloads/{id}` | One tracked workload |
//! | GET | `/api/v1/redirections` | Redirection table |
//! | GET | `/api/v1/redirections/{id}` | One redirection |
//! | GET | `/api/v1/proxies` | Proxy route table |
//! | GET | `/api/v1/proxies/{id}` | One proxy route |
//! | GET | `/api/v1/tunnels` | Tunnel table |
//! | POST | `/api/v1/register-local-agent` | Scheduling and capabilities document |
//! | POST | `/register-local-agent` | Same, at the legacy root path |
//! | GET | `/health` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use stagegrid_ingest::DesiredStateStore;
use stagegrid_report::{StatusReporter, StatusSources};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<DesiredStateStore>,
    pub sources: StatusSources,
    pub reporter: Arc<StatusReporter>,
}

/// Build the complete agent router.
pub fn build_router(store: Arc<DesiredStateStore>, reporter: Arc<StatusReporter>) -> Router {
    let state = ApiState {
        store,
        sources: reporter.sources().clone(),
        reporter,
    };

    let api_routes = Router::new()
        .route("/pods", post(handlers::ingest_pods))
        .route("/pods/status", get(handlers::pods_status))
        .route("/status", get(handlers::status))
        .route("/workloads/{id}", get(handlers::get_workload))
        .route("/redirections", get(handlers::list_redirections))
        .route("/redirections/{id}", get(handlers::get_redirection))
        .route("/proxies", get(handlers::list_proxies))
        .route("/proxies/{id}", get(handlers::get_proxy))
        .route("/tunnels", get(handlers::list_tunnels))
        .route("/register-local-agent", post(handlers::register_local_agent))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/register-local-agent", post(handlers::register_local_agent))
        .route("/health", get(handlers::health))
        .with_state(state)
}
