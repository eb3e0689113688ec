//! REST API handlers.
//!
//! Reads go through the owning component's accessors and return
//! copies; the only write is the ingestion push.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::{info, warn};

use stagegrid_core::{ExposureSummary, epoch_secs};
use stagegrid_ingest::{IngestBatch, IngestError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Ingestion ──────────────────────────────────────────────────

/// Acknowledgement sent back to the control plane.
#[derive(Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub message: String,
    pub count: usize,
}

/// POST /api/v1/pods
pub async fn ingest_pods(
    State(state): State<ApiState>,
    Json(batch): Json<IngestBatch>,
) -> impl IntoResponse {
    let action = batch.action.clone();
    match state.store.apply(batch).await {
        Ok(outcome) => {
            info!(
                action = ?outcome.action,
                processed = outcome.processed,
                skipped = outcome.skipped,
                "desired state updated"
            );
            Json(IngestResponse {
                success: true,
                message: format!("Successfully processed {} pods", outcome.processed),
                count: outcome.processed,
            })
            .into_response()
        }
        Err(e) => {
            warn!(%action, error = %e, "desired state push rejected");
            let status = match e {
                IngestError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
                IngestError::UnknownAction(_) => StatusCode::BAD_REQUEST,
            };
            error_response(&e.to_string(), status).into_response()
        }
    }
}

/// GET /api/v1/pods/status
pub async fn pods_status(State(state): State<ApiState>) -> impl IntoResponse {
    let pods = state.store.snapshot().await;
    ApiResponse::ok(serde_json::json!({
        "agent_id": state.store.agent_id(),
        "count": pods.len(),
        "pods": pods,
        "timestamp": epoch_secs(),
    }))
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.sources.snapshot().await)
}

/// GET /api/v1/workloads/{id}
pub async fn get_workload(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sources.reconciler.get(&id).await {
        Some(workload) => ApiResponse::ok(workload).into_response(),
        None => error_response("workload not tracked", StatusCode::NOT_FOUND).into_response(),
    }
}

// ── Exposure tables ────────────────────────────────────────────

/// A table listing with its status summary.
#[derive(Serialize)]
struct TableView<T: Serialize> {
    #[serde(flatten)]
    summary: ExposureSummary,
    items: Vec<T>,
    timestamp: u64,
}

impl<T: Serialize> TableView<T> {
    fn new(summary: ExposureSummary, items: Vec<T>) -> Self {
        Self {
            summary,
            items,
            timestamp: epoch_secs(),
        }
    }
}

/// GET /api/v1/redirections
pub async fn list_redirections(State(state): State<ApiState>) -> impl IntoResponse {
    let redirections = &state.sources.redirections;
    ApiResponse::ok(TableView::new(
        redirections.summary().await,
        redirections.list().await,
    ))
}

/// GET /api/v1/redirections/{id}
pub async fn get_redirection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sources.redirections.get(&id).await {
        Some(r) => ApiResponse::ok(r).into_response(),
        None => error_response("redirection not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /api/v1/proxies
pub async fn list_proxies(State(state): State<ApiState>) -> impl IntoResponse {
    let proxies = &state.sources.proxies;
    ApiResponse::ok(TableView::new(proxies.summary().await, proxies.list().await))
}

/// GET /api/v1/proxies/{id}
pub async fn get_proxy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sources.proxies.get(&id).await {
        Some(route) => ApiResponse::ok(route).into_response(),
        None => error_response("proxy route not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /api/v1/tunnels
pub async fn list_tunnels(State(state): State<ApiState>) -> impl IntoResponse {
    let view = match &state.sources.tunnels {
        Some(tunnels) => TableView::new(tunnels.summary().await, tunnels.list().await),
        None => TableView::new(ExposureSummary::default(), Vec::new()),
    };
    ApiResponse::ok(view)
}

// ── Registration ───────────────────────────────────────────────

/// POST /register-local-agent
///
/// Answers a control plane asking this agent to register. The body must
/// carry the caller's `host`.
pub async fn register_local_agent(
    State(state): State<ApiState>,
    Json(request): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Some(host) = request.get("host").and_then(|h| h.as_str()) else {
        warn!("registration request without host");
        return error_response("missing or invalid host", StatusCode::BAD_REQUEST).into_response();
    };
    info!(%host, "agent registration request received");

    let mut document = state.reporter.registration_payload().await;
    if let Some(fields) = document.as_object_mut() {
        if let Some(public_url) = fields.remove("host") {
            fields.insert("public_url".into(), public_url);
        }
        fields.insert("status".into(), "success".into());
        fields.insert(
            "message".into(),
            "Agent registered successfully with pod scheduling capabilities".into(),
        );
        fields.insert("agent_id".into(), state.store.agent_id().into());
        fields.insert("host".into(), host.into());
        fields.insert("timestamp".into(), epoch_secs().into());
    }
    Json(document).into_response()
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "agent_id": state.store.agent_id(),
        "pods": state.store.len().await,
        "timestamp": epoch_secs(),
    }))
}
