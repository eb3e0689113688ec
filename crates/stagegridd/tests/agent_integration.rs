//! Agent integration tests.
//!
//! Assembles a full agent against an in-memory cluster and drives it
//! through the REST API: ingestion, reconciliation, exposure and status.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::watch;
use tower::ServiceExt;

use stagegrid_core::{AgentConfig, ExposureStatus, WorkloadDescriptor};
use stagegrid_reconcile::{
    ClusterControl, ClusterHealth, ClusterResult, ClusterWorkload, CreatedWorkload,
};
use stagegridd::Agent;

/// Cluster that creates everything and assigns one fixed address.
struct FixedAddressCluster {
    address: String,
}

#[async_trait]
impl ClusterControl for FixedAddressCluster {
    async fn ensure_cluster(&self) -> ClusterResult<()> {
        Ok(())
    }

    async fn create_workload(&self, w: &WorkloadDescriptor) -> ClusterResult<CreatedWorkload> {
        Ok(CreatedWorkload {
            name: w.name.clone(),
            namespace: "staging".into(),
            local_address: Some(self.address.clone()),
        })
    }

    async fn workload_address(&self, _w: &WorkloadDescriptor) -> ClusterResult<Option<String>> {
        Ok(Some(self.address.clone()))
    }

    async fn list_workloads(&self) -> ClusterResult<Vec<ClusterWorkload>> {
        Ok(Vec::new())
    }

    async fn delete_workload(&self, _w: &WorkloadDescriptor) -> ClusterResult<()> {
        Ok(())
    }

    async fn health(&self) -> ClusterHealth {
        ClusterHealth::Running
    }
}

fn test_config() -> AgentConfig {
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let control_plane = format!("http://{}", dead.local_addr().unwrap());
    drop(dead);

    let mut config = AgentConfig::default();
    config.agent.id = Some("agent-1".into());
    config.control_plane.url = control_plane;
    config.control_plane.request_timeout = "1s".into();
    config.redirect.bind_host = "127.0.0.1".into();
    config.redirect.forwarder_program = "sleep".into();
    config.redirect.forwarder_args = vec!["30".into()];
    config.redirect.startup_grace = "50ms".into();
    config.redirect.enable_alias = false;
    config.proxy.listen_host = "127.0.0.1".into();
    config.proxy.listen_port = 0;
    config.tunnel.enabled = false;
    config.registration.enabled = false;
    config
}

/// `len` consecutive ports that were all free a moment ago.
fn free_block(len: u16) -> u16 {
    for _ in 0..50 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let start = probe.local_addr().unwrap().port();
        drop(probe);
        if start > u16::MAX - len {
            continue;
        }
        if (start..start + len).all(|p| std::net::TcpListener::bind(("127.0.0.1", p)).is_ok()) {
            return start;
        }
    }
    panic!("no free port block found");
}

fn agent_with(config: AgentConfig, address: &str) -> Arc<Agent> {
    let cluster = Arc::new(FixedAddressCluster {
        address: address.to_string(),
    });
    Arc::new(Agent::new(config, cluster).unwrap())
}

fn push(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/pods")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn web_batch() -> serde_json::Value {
    serde_json::json!({
        "source_id": "agent-1",
        "action": "create",
        "items": [{
            "id": "a1",
            "name": "web",
            "image": "nginx:alpine",
            "remote_address": "10.0.0.5",
            "remote_port": 80
        }]
    })
}

#[tokio::test]
async fn ingest_reconcile_and_report() {
    let agent = agent_with(test_config(), "10.244.0.7");
    let router = agent.router();

    let resp = router.clone().oneshot(push(web_batch())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["count"], 1);

    let report = agent.reconciler.tick().await;
    assert_eq!(report.created, 1);

    let resp = router.clone().oneshot(get("/api/v1/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let status = json_body(resp).await;
    assert_eq!(status["data"]["counts"]["total"], 1);
    assert_eq!(status["data"]["counts"]["created"], 1);
    assert_eq!(status["data"]["counts"]["failed"], 0);
    assert!(status["data"]["timestamp"].as_u64().unwrap() > 0);

    let proxies = json_body(router.clone().oneshot(get("/api/v1/proxies")).await.unwrap()).await;
    assert_eq!(proxies["data"]["total"], 1);
    assert_eq!(proxies["data"]["items"][0]["path"], "/web");

    let redirections =
        json_body(router.clone().oneshot(get("/api/v1/redirections/a1")).await.unwrap()).await;
    let port = redirections["data"]["local_port"].as_u64().unwrap();
    assert!((8100..=9000).contains(&port));
    assert_eq!(redirections["data"]["remote_address"], "10.0.0.5");

    let workload = json_body(router.oneshot(get("/api/v1/workloads/a1")).await.unwrap()).await;
    assert_eq!(workload["data"]["state"], "created");
    assert_eq!(workload["data"]["local_address"], "10.244.0.7");

    agent.stop_processes().await;
}

#[tokio::test]
async fn update_batch_twice_is_idempotent() {
    let agent = agent_with(test_config(), "10.244.0.7");
    let router = agent.router();

    let mut batch = web_batch();
    batch["action"] = "update".into();
    router.clone().oneshot(push(batch.clone())).await.unwrap();
    let first = json_body(router.clone().oneshot(get("/api/v1/pods/status")).await.unwrap()).await;
    router.clone().oneshot(push(batch)).await.unwrap();
    let second = json_body(router.oneshot(get("/api/v1/pods/status")).await.unwrap()).await;

    // Only the freshness stamp may move between the two pushes.
    let without_stamp = |body: &serde_json::Value| {
        let mut pods = body["data"]["pods"].clone();
        for pod in pods.as_array_mut().unwrap() {
            pod.as_object_mut().unwrap().remove("updated_at");
        }
        pods
    };
    assert_eq!(without_stamp(&first), without_stamp(&second));
    assert_eq!(second["data"]["count"], 1);
}

#[tokio::test]
async fn push_from_other_source_is_rejected() {
    let agent = agent_with(test_config(), "10.244.0.7");
    let mut batch = web_batch();
    batch["source_id"] = "intruder".into();

    let resp = agent.router().oneshot(push(batch)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(agent.store.is_empty().await);
}

#[tokio::test]
async fn malformed_push_is_bad_request() {
    let agent = agent_with(test_config(), "10.244.0.7");
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/pods")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let resp = agent.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn proxy_route_forwards_to_backend() {
    async fn echo(req: axum::extract::Request) -> String {
        let marker = req
            .headers()
            .get("x-proxy-by")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        format!("{} {}", req.uri().path(), marker)
    }
    let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(backend, axum::Router::new().fallback(echo))
            .await
            .unwrap();
    });

    let mut config = test_config();
    config.proxy.backend_port = backend_port;
    let agent = agent_with(config, "127.0.0.1");
    agent.router().oneshot(push(web_batch())).await.unwrap();
    agent.reconciler.tick().await;

    let proxy = agent.proxies.listener_addr().unwrap();
    let text = reqwest::get(format!("http://{proxy}/web/hello"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "/hello stagegrid-agent");

    let missing = reqwest::get(format!("http://{proxy}/nothing")).await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    agent.stop_processes().await;
}

#[tokio::test]
async fn run_serves_until_shutdown() {
    let mut config = test_config();
    config.reconcile.sync_interval = "1h".into();
    let agent = agent_with(config, "10.244.0.7");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(agent.clone().run(listener, rx));

    let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["agent_id"], "agent-1");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let mut config = test_config();
    config.redirect.port_range_start = 9000;
    config.redirect.port_range_end = 8080;
    let cluster = Arc::new(FixedAddressCluster {
        address: "10.244.0.7".into(),
    });
    assert!(Agent::new(config, cluster).is_err());
}

#[tokio::test]
async fn listener_inside_redirect_range_is_rejected() {
    let mut config = test_config();
    config.proxy.listen_port = 8500;
    let cluster = Arc::new(FixedAddressCluster {
        address: "10.244.0.7".into(),
    });
    let err = Agent::new(config, cluster).err().unwrap();
    assert!(err.to_string().contains("proxy.listen_port 8500"));
}

#[tokio::test]
async fn default_port_layout_exposes_route_and_redirection() {
    // Same shape as the defaults: proxy, then agent, then the redirect
    // range above both.
    let base = free_block(24);
    let defaults = AgentConfig::default();
    let offset = |port: u16| base + (port - defaults.proxy.listen_port);

    let mut config = test_config();
    config.proxy.listen_port = base;
    config.agent.listen_port = offset(defaults.agent.listen_port);
    config.redirect.port_range_start = base + 20;
    config.redirect.port_range_end = base + 23;
    let agent = agent_with(config, "10.244.0.7");

    agent.prepare().await.unwrap();
    assert_eq!(agent.proxies.listener_addr().unwrap().port(), base);

    agent.router().oneshot(push(web_batch())).await.unwrap();
    let report = agent.reconciler.tick().await;
    assert_eq!(report.created, 1);
    assert_eq!(report.exposed, 1);

    let route = agent.proxies.get("a1").await.unwrap();
    assert_eq!(route.local_url, format!("http://localhost:{base}/web"));
    let redirection = agent.redirections.get("a1").await.unwrap();
    assert_eq!(redirection.local_port, base + 20);
    assert_eq!(redirection.status, ExposureStatus::Active);

    agent.stop_processes().await;
}

#[tokio::test]
async fn run_fails_when_proxy_port_is_taken() {
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = test_config();
    config.proxy.listen_port = held.local_addr().unwrap().port();
    let agent = agent_with(config, "10.244.0.7");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (_tx, rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(10), agent.clone().run(listener, rx))
        .await
        .unwrap();
    assert!(result.is_err());
    assert!(agent.proxies.listener_addr().is_none());
}

#[tokio::test]
async fn full_redirect_range_still_publishes_route() {
    let start = free_block(4);
    let mut config = test_config();
    config.redirect.port_range_start = start;
    config.redirect.port_range_end = start + 3;
    let agent = agent_with(config, "10.244.0.7");
    let router = agent.router();

    let mut batch = web_batch();
    batch["items"] = serde_json::json!([
        {"id": "a1", "name": "web", "image": "nginx:alpine", "remote_address": "10.0.0.5", "remote_port": 80},
        {"id": "b2", "name": "shop", "image": "shop:1", "remote_address": "10.0.0.6", "remote_port": 80},
    ]);
    router.clone().oneshot(push(batch)).await.unwrap();
    agent.reconciler.tick().await;
    assert_eq!(agent.redirections.list().await.len(), 2);

    // The rest of the range is held by sockets outside the agent.
    let foreign: Vec<std::net::TcpListener> = (start + 2..=start + 3)
        .map(|p| std::net::TcpListener::bind(("127.0.0.1", p)).unwrap())
        .collect();

    let mut batch = web_batch();
    batch["items"] = serde_json::json!([
        {"id": "c3", "name": "docs", "image": "docs:1", "remote_address": "10.0.0.7", "remote_port": 80},
    ]);
    router.clone().oneshot(push(batch)).await.unwrap();
    let report = agent.reconciler.tick().await;
    assert_eq!(report.created, 1);

    assert!(agent.redirections.get("c3").await.is_none());
    assert_eq!(agent.proxies.get("c3").await.unwrap().path, "/docs");
    let workload = json_body(router.clone().oneshot(get("/api/v1/workloads/c3")).await.unwrap()).await;
    assert_eq!(workload["data"]["state"], "created");

    drop(foreign);
    agent.reconciler.tick().await;
    assert_eq!(agent.redirections.get("c3").await.unwrap().local_port, start + 2);

    agent.stop_processes().await;
}

#[tokio::test]
async fn register_local_agent_answers_on_both_paths() {
    let agent = agent_with(test_config(), "10.244.0.7");
    let router = agent.router();
    router.clone().oneshot(push(web_batch())).await.unwrap();
    agent.reconciler.tick().await;

    for path in ["/register-local-agent", "/api/v1/register-local-agent"] {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"host":"cp.example"}"#))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
        let body = json_body(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["agent_id"], "agent-1");
        assert_eq!(body["host"], "cp.example");
        assert_eq!(body["pod_scheduling"]["current_pods"], 1);
        assert_eq!(body["pod_scheduling"]["available_pods"][0]["name"], "web");
    }

    let req = Request::builder()
        .method("POST")
        .uri("/register-local-agent")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    agent.stop_processes().await;
}
