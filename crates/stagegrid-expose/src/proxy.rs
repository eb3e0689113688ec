//! Reverse proxy manager.
//!
//! Workloads are published under `/<name>` on one shared HTTP listener.
//! The agent starts the listener at startup with [`ProxyManager::start`];
//! otherwise the first route starts it. It serves for the rest of the
//! process:
//!
//! ```text
//! GET /health          listener liveness
//! GET /api/proxies     route table
//! ANY /<name>/rest     ──▶ http://<backend>:<backend_port>/rest
//! ```
//!
//! Forwarded requests get `Host` rewritten to the backend and carry
//! `X-Proxy-By` / `X-Original-Host`. Unreachable backends produce a 502;
//! the listener itself never goes down because of a backend.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock, watch};
use tracing::{debug, info, warn};

use stagegrid_core::config::ProxySection;
use stagegrid_core::{
    ExposureStatus, ExposureSummary, ProxyRoute, WorkloadDescriptor, WorkloadId, date_stamp,
    epoch_secs,
};

use crate::error::{ExposeError, ExposeResult};
use crate::probe::{Acceptance, ProbeResult, http_probe};

/// Paths served by the listener itself.
const RESERVED_PREFIXES: &[&str] = &["/health", "/api"];

pub const PROXY_BY_HEADER: &str = "x-proxy-by";
pub const ORIGINAL_HOST_HEADER: &str = "x-original-host";

type RouteTable = Arc<RwLock<HashMap<WorkloadId, ProxyRoute>>>;
type HttpClient = Client<HttpConnector, Body>;

/// Health of one route as seen from the listener side.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteHealth {
    pub workload_id: WorkloadId,
    pub path: String,
    pub local_url: String,
    pub healthy: bool,
    pub detail: String,
}

pub struct ProxyManager {
    agent_id: String,
    listen_host: String,
    listen_port: u16,
    backend_port: u16,
    marker: String,
    request_timeout: Duration,
    probe_timeout: Duration,
    routes: RouteTable,
    listener: OnceCell<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyManager {
    pub fn new(agent_id: impl Into<String>, config: &ProxySection, probe_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            agent_id: agent_id.into(),
            listen_host: config.listen_host.clone(),
            listen_port: config.listen_port,
            backend_port: config.backend_port,
            marker: config.marker.clone(),
            request_timeout: config.request_timeout(),
            probe_timeout,
            routes: Arc::new(RwLock::new(HashMap::new())),
            listener: OnceCell::new(),
            shutdown_tx,
        }
    }

    /// Publish `workload` at `/<name>`, forwarding to `backend_address`.
    ///
    /// Returns the existing route unchanged if the workload already has
    /// one.
    pub async fn setup(
        &self,
        workload: &WorkloadDescriptor,
        backend_address: &str,
    ) -> ExposeResult<ProxyRoute> {
        if let Some(existing) = self.get(&workload.id).await {
            debug!(workload_id = %workload.id, path = %existing.path, "proxy route already exists");
            return Ok(existing);
        }
        if backend_address.trim().is_empty() {
            return Err(ExposeError::MissingBackend(workload.id.clone()));
        }

        let path = route_path(&workload.name);
        if let Some(reserved) = RESERVED_PREFIXES.iter().find(|p| path_matches(p, &path)) {
            return Err(ExposeError::PathConflict {
                path,
                owner: format!("listener endpoint {reserved}"),
            });
        }

        let addr = self.ensure_listener().await?;

        let mut routes = self.routes.write().await;
        // Re-check under the write lock; a concurrent setup may have won.
        if let Some(existing) = routes.get(&workload.id) {
            return Ok(existing.clone());
        }
        if let Some(owner) = routes.values().find(|r| r.path == path) {
            return Err(ExposeError::PathConflict {
                path,
                owner: owner.workload_id.clone(),
            });
        }

        let now = epoch_secs();
        let route = ProxyRoute {
            route_id: format!("{}-{}-{}", self.agent_id, workload.name, date_stamp(now)),
            workload_id: workload.id.clone(),
            workload_name: workload.name.clone(),
            local_url: format!("http://localhost:{}{}", addr.port(), path),
            backend_address: backend_address.to_string(),
            backend_url: format!("http://{}:{}", backend_address, self.backend_port),
            path,
            status: ExposureStatus::Active,
            created_at: now,
        };
        routes.insert(workload.id.clone(), route.clone());
        drop(routes);

        info!(
            workload_id = %route.workload_id,
            path = %route.path,
            backend = %route.backend_url,
            local_url = %route.local_url,
            "proxy route registered"
        );
        Ok(route)
    }

    /// Unregister a route. Requests to its path get 404 afterwards.
    pub async fn remove(&self, workload_id: &str) -> ExposeResult<ProxyRoute> {
        let route = self
            .routes
            .write()
            .await
            .remove(workload_id)
            .ok_or_else(|| ExposeError::RouteNotFound(workload_id.to_string()))?;
        info!(%workload_id, path = %route.path, "proxy route removed");
        Ok(route)
    }

    /// Probe every route's local URL. Failed routes stay registered.
    pub async fn health_check(&self) -> Vec<RouteHealth> {
        let routes = self.list().await;
        let mut results = Vec::with_capacity(routes.len());
        for route in routes {
            let probe = http_probe(&route.local_url, Acceptance::BelowServerError, self.probe_timeout).await;
            let detail = match probe {
                ProbeResult::Healthy => "ok".to_string(),
                ProbeResult::Unhealthy(status) => format!("status {status}"),
                ProbeResult::Failed => "unreachable".to_string(),
            };
            if !probe.is_healthy() {
                warn!(workload_id = %route.workload_id, path = %route.path, %detail, "proxy route unhealthy");
            }
            results.push(RouteHealth {
                workload_id: route.workload_id,
                path: route.path,
                local_url: route.local_url,
                healthy: probe.is_healthy(),
                detail,
            });
        }
        results
    }

    pub async fn get(&self, workload_id: &str) -> Option<ProxyRoute> {
        self.routes.read().await.get(workload_id).cloned()
    }

    pub async fn contains(&self, workload_id: &str) -> bool {
        self.routes.read().await.contains_key(workload_id)
    }

    /// All routes, ordered by path.
    pub async fn list(&self) -> Vec<ProxyRoute> {
        sorted_routes(&self.routes).await
    }

    pub async fn summary(&self) -> ExposureSummary {
        let routes = self.routes.read().await;
        ExposureSummary::from_statuses(routes.values().map(|r| r.status))
    }

    /// Bind and serve the shared listener if it is not running yet.
    pub async fn start(&self) -> ExposeResult<SocketAddr> {
        self.ensure_listener().await
    }

    /// Bound address of the shared listener, once started.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.get().copied()
    }

    /// Stop the shared listener.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn ensure_listener(&self) -> ExposeResult<SocketAddr> {
        self.listener
            .get_or_try_init(|| self.start_listener())
            .await
            .copied()
    }

    async fn start_listener(&self) -> ExposeResult<SocketAddr> {
        let bind = format!("{}:{}", self.listen_host, self.listen_port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|source| ExposeError::Bind {
                addr: bind.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;

        let state = ListenerState {
            agent_id: self.agent_id.clone(),
            marker: self.marker.clone(),
            request_timeout: self.request_timeout,
            routes: self.routes.clone(),
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        };
        let app = listener_router(state);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "proxy listener stopped with error");
            }
        });

        info!(%addr, "proxy listener started");
        Ok(addr)
    }
}

/// `/<name>` with surrounding slashes and whitespace trimmed.
pub fn route_path(name: &str) -> String {
    format!("/{}", name.trim().trim_matches('/'))
}

/// Whether a request path falls under a route prefix.
fn path_matches(prefix: &str, path: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

async fn sorted_routes(routes: &RouteTable) -> Vec<ProxyRoute> {
    let routes = routes.read().await;
    let mut out: Vec<ProxyRoute> = routes.values().cloned().collect();
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

// ── Listener ──────────────────────────────────────────────────────

#[derive(Clone)]
struct ListenerState {
    agent_id: String,
    marker: String,
    request_timeout: Duration,
    routes: RouteTable,
    client: HttpClient,
}

fn listener_router(state: ListenerState) -> Router {
    Router::new()
        .route("/health", get(listener_health))
        .route("/api/proxies", get(listener_routes))
        .fallback(forward)
        .with_state(state)
}

async fn listener_health(State(state): State<ListenerState>) -> impl IntoResponse {
    let routes = state.routes.read().await.len();
    Json(serde_json::json!({
        "status": "healthy",
        "agent_id": state.agent_id,
        "routes": routes,
        "timestamp": epoch_secs(),
    }))
}

async fn listener_routes(State(state): State<ListenerState>) -> impl IntoResponse {
    let routes = sorted_routes(&state.routes).await;
    Json(serde_json::json!({
        "agent_id": state.agent_id,
        "count": routes.len(),
        "routes": routes,
    }))
}

async fn forward(State(state): State<ListenerState>, mut req: Request<Body>) -> Response {
    let path = req.uri().path().to_string();
    let route = {
        let routes = state.routes.read().await;
        routes
            .values()
            .filter(|r| path_matches(&r.path, &path))
            .max_by_key(|r| r.path.len())
            .cloned()
    };
    let Some(route) = route else {
        return (StatusCode::NOT_FOUND, format!("no proxy route for {path}")).into_response();
    };

    let rest = &path[route.path.len()..];
    let rest = if rest.is_empty() { "/" } else { rest };
    let target = match req.uri().query() {
        Some(q) => format!("{}{}?{}", route.backend_url, rest, q),
        None => format!("{}{}", route.backend_url, rest),
    };
    let target_uri: Uri = match target.parse() {
        Ok(u) => u,
        Err(e) => {
            warn!(workload_id = %route.workload_id, %target, error = %e, "bad proxy target");
            return bad_gateway(&format!("invalid backend target: {e}"));
        }
    };
    let backend_host = target_uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default();

    let original_host = req.headers().get(header::HOST).cloned();
    *req.uri_mut() = target_uri;
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&backend_host) {
        headers.insert(header::HOST, value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.marker) {
        headers.insert(PROXY_BY_HEADER, value);
    }
    if let Some(value) = original_host {
        headers.insert(ORIGINAL_HOST_HEADER, value);
    }

    debug!(workload_id = %route.workload_id, %path, %target, "forwarding request");
    match tokio::time::timeout(state.request_timeout, state.client.request(req)).await {
        Ok(Ok(resp)) => resp.into_response(),
        Ok(Err(e)) => {
            warn!(workload_id = %route.workload_id, %target, error = %e, "backend request failed");
            bad_gateway(&e.to_string())
        }
        Err(_) => {
            warn!(workload_id = %route.workload_id, %target, "backend request timed out");
            bad_gateway("backend timed out")
        }
    }
}

fn bad_gateway(detail: &str) -> Response {
    (StatusCode::BAD_GATEWAY, format!("Proxy Error: {detail}")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Request as AxumRequest;

    fn config() -> ProxySection {
        ProxySection {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            backend_port: 80,
            marker: "stagegrid-test".to_string(),
            request_timeout: "2s".to_string(),
        }
    }

    fn workload(id: &str, name: &str) -> WorkloadDescriptor {
        WorkloadDescriptor::new(id, name, "nginx:alpine", "10.0.0.5")
    }

    /// Backend that echoes the request line and proxy headers as JSON.
    async fn echo_backend() -> SocketAddr {
        async fn echo(req: AxumRequest) -> Json<serde_json::Value> {
            let h = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            Json(serde_json::json!({
                "path": req.uri().path(),
                "query": req.uri().query(),
                "host": h("host"),
                "proxy_by": h(PROXY_BY_HEADER),
                "original_host": h(ORIGINAL_HOST_HEADER),
            }))
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(echo)).await.unwrap();
        });
        addr
    }

    fn manager_for(backend_port: u16) -> ProxyManager {
        let mut cfg = config();
        cfg.backend_port = backend_port;
        ProxyManager::new("agent-1", &cfg, Duration::from_secs(1))
    }

    #[test]
    fn path_matching() {
        assert!(path_matches("/web", "/web"));
        assert!(path_matches("/web", "/web/index.html"));
        assert!(!path_matches("/web", "/webapp"));
        assert_eq!(route_path(" web/ "), "/web");
    }

    #[tokio::test]
    async fn setup_is_idempotent_and_derives_identifiers() {
        let mgr = manager_for(80);
        let first = mgr.setup(&workload("a1", "web"), "10.244.0.7").await.unwrap();
        assert_eq!(first.path, "/web");
        assert_eq!(first.backend_url, "http://10.244.0.7:80");
        assert!(first.route_id.starts_with("agent-1-web-"));
        let port = mgr.listener_addr().unwrap().port();
        assert_eq!(first.local_url, format!("http://localhost:{port}/web"));

        let second = mgr.setup(&workload("a1", "web"), "10.244.0.99").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mgr.list().await.len(), 1);
        mgr.shutdown();
    }

    #[tokio::test]
    async fn start_binds_before_any_route() {
        let mgr = manager_for(80);
        assert!(mgr.listener_addr().is_none());
        let addr = mgr.start().await.unwrap();
        assert_eq!(mgr.listener_addr(), Some(addr));
        assert!(std::net::TcpListener::bind(addr).is_err());

        assert_eq!(mgr.start().await.unwrap(), addr);
        let route = mgr.setup(&workload("a1", "web"), "10.244.0.7").await.unwrap();
        assert_eq!(route.local_url, format!("http://localhost:{}/web", addr.port()));
        mgr.shutdown();
    }

    #[tokio::test]
    async fn start_on_busy_port_is_bind_error() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = config();
        cfg.listen_port = held.local_addr().unwrap().port();
        let mgr = ProxyManager::new("agent-1", &cfg, Duration::from_secs(1));

        assert!(matches!(mgr.start().await, Err(ExposeError::Bind { .. })));
        assert!(mgr.listener_addr().is_none());
    }

    #[tokio::test]
    async fn one_listener_for_all_routes() {
        let mgr = manager_for(80);
        mgr.setup(&workload("a1", "web"), "10.244.0.7").await.unwrap();
        let addr = mgr.listener_addr().unwrap();
        mgr.setup(&workload("b2", "api"), "10.244.0.8").await.unwrap();
        assert_eq!(mgr.listener_addr().unwrap(), addr);
        assert_eq!(mgr.summary().await.active, 2);
        mgr.shutdown();
    }

    #[tokio::test]
    async fn duplicate_path_is_rejected() {
        let mgr = manager_for(80);
        mgr.setup(&workload("a1", "web"), "10.244.0.7").await.unwrap();
        let err = mgr.setup(&workload("b2", "web"), "10.244.0.8").await.unwrap_err();
        assert!(matches!(err, ExposeError::PathConflict { owner, .. } if owner == "a1"));

        let err = mgr.setup(&workload("c3", "health"), "10.244.0.9").await.unwrap_err();
        assert!(matches!(err, ExposeError::PathConflict { .. }));
        mgr.shutdown();
    }

    #[tokio::test]
    async fn forwards_with_rewritten_host_and_marker() {
        let backend = echo_backend().await;
        let mgr = manager_for(backend.port());
        mgr.setup(&workload("a1", "web"), "127.0.0.1").await.unwrap();
        let proxy = mgr.listener_addr().unwrap();

        let body: serde_json::Value = reqwest::get(format!("http://{proxy}/web/assets/app.js?v=2"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["path"], "/assets/app.js");
        assert_eq!(body["query"], "v=2");
        assert_eq!(body["host"], format!("127.0.0.1:{}", backend.port()));
        assert_eq!(body["proxy_by"], "stagegrid-test");
        assert_eq!(body["original_host"], format!("{proxy}"));

        let root: serde_json::Value = reqwest::get(format!("http://{proxy}/web"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(root["path"], "/");
        mgr.shutdown();
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = closed.local_addr().unwrap().port();
        drop(closed);

        let mgr = manager_for(dead_port);
        mgr.setup(&workload("a1", "web"), "127.0.0.1").await.unwrap();
        let proxy = mgr.listener_addr().unwrap();

        let resp = reqwest::get(format!("http://{proxy}/web/")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 502);
        assert!(resp.text().await.unwrap().starts_with("Proxy Error"));

        // The listener survives and still answers its own endpoints.
        let health = reqwest::get(format!("http://{proxy}/health")).await.unwrap();
        assert_eq!(health.status().as_u16(), 200);
        mgr.shutdown();
    }

    #[tokio::test]
    async fn listener_endpoints_and_removal() {
        let backend = echo_backend().await;
        let mgr = manager_for(backend.port());
        mgr.setup(&workload("a1", "web"), "127.0.0.1").await.unwrap();
        let proxy = mgr.listener_addr().unwrap();

        let listing: serde_json::Value = reqwest::get(format!("http://{proxy}/api/proxies"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["count"], 1);
        assert_eq!(listing["routes"][0]["path"], "/web");

        mgr.remove("a1").await.unwrap();
        let resp = reqwest::get(format!("http://{proxy}/web/")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        assert!(matches!(mgr.remove("a1").await, Err(ExposeError::RouteNotFound(_))));
        mgr.shutdown();
    }

    #[tokio::test]
    async fn health_check_reports_without_removing() {
        let backend = echo_backend().await;
        let mgr = manager_for(backend.port());
        mgr.setup(&workload("a1", "web"), "127.0.0.1").await.unwrap();
        mgr.setup(&workload("b2", "api"), "127.0.0.1").await.unwrap();

        let report = mgr.health_check().await;
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|r| r.healthy));

        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = closed.local_addr().unwrap().port();
        drop(closed);
        let dead = manager_for(dead_port);
        dead.setup(&workload("c3", "gone"), "127.0.0.1").await.unwrap();
        let report = dead.health_check().await;
        assert_eq!(report.len(), 1);
        assert!(!report[0].healthy);
        assert!(dead.contains("c3").await);

        mgr.shutdown();
        dead.shutdown();
    }

    #[tokio::test]
    async fn missing_backend_address_is_rejected() {
        let mgr = manager_for(80);
        let err = mgr.setup(&workload("a1", "web"), "").await.unwrap_err();
        assert!(matches!(err, ExposeError::MissingBackend(_)));
        assert!(mgr.listener_addr().is_none());
    }
}
