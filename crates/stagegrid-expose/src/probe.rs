//! HTTP probe used by route and tunnel health checks.

use std::time::Duration;

use http::{StatusCode, Uri};
use tracing::debug;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered with an accepted status.
    Healthy,
    /// The endpoint answered, but with a rejected status.
    Unhealthy(StatusCode),
    /// No answer: connection error, bad URL, or timeout.
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Which statuses count as healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Anything below 500; a 404 from a live backend still means the
    /// route works.
    BelowServerError,
    /// Exactly 200.
    OkOnly,
}

impl Acceptance {
    pub fn accepts(&self, status: StatusCode) -> bool {
        match self {
            Acceptance::BelowServerError => status.as_u16() < 500,
            Acceptance::OkOnly => status == StatusCode::OK,
        }
    }
}

/// GET a plain-HTTP URL over a fresh connection.
pub async fn http_probe(url: &str, acceptance: Acceptance, timeout: Duration) -> ProbeResult {
    let uri: Uri = match url.parse() {
        Ok(u) => u,
        Err(e) => {
            debug!(error = %e, %url, "probe url is invalid");
            return ProbeResult::Failed;
        }
    };
    let Some(authority) = uri.authority().cloned() else {
        debug!(%url, "probe url has no host");
        return ProbeResult::Failed;
    };
    let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %url, "probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %url, "probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&path)
            .header(http::header::HOST, authority.as_str())
            .header(http::header::USER_AGENT, "stagegrid-probe/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, %url, "probe request build failed");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if acceptance.accepts(resp.status()) => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %url, "probe rejected status");
                ProbeResult::Unhealthy(resp.status())
            }
            Err(e) => {
                debug!(error = %e, %url, "probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%url, "probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Probe any URL: plain HTTP goes through [`http_probe`], HTTPS through
/// a TLS-capable client.
pub async fn url_probe(url: &str, acceptance: Acceptance, timeout: Duration) -> ProbeResult {
    if !url.starts_with("https://") {
        return http_probe(url, acceptance, timeout).await;
    }
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "failed to build https probe client");
            return ProbeResult::Failed;
        }
    };
    match client
        .get(url)
        .header(http::header::USER_AGENT, "stagegrid-probe/0.1")
        .send()
        .await
    {
        Ok(resp) if acceptance.accepts(resp.status()) => ProbeResult::Healthy,
        Ok(resp) => {
            debug!(status = %resp.status(), %url, "probe rejected status");
            ProbeResult::Unhealthy(resp.status())
        }
        Err(e) => {
            debug!(error = %e, %url, "https probe failed");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn acceptance_rules() {
        assert!(Acceptance::BelowServerError.accepts(StatusCode::NOT_FOUND));
        assert!(!Acceptance::BelowServerError.accepts(StatusCode::BAD_GATEWAY));
        assert!(Acceptance::OkOnly.accepts(StatusCode::OK));
        assert!(!Acceptance::OkOnly.accepts(StatusCode::NO_CONTENT));
    }

    #[tokio::test]
    async fn probe_classifies_statuses() {
        let base = serve(
            Router::new()
                .route("/ok", get(|| async { "ok" }))
                .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
                .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR })),
        )
        .await;
        let t = Duration::from_secs(2);

        assert_eq!(http_probe(&format!("{base}/ok"), Acceptance::OkOnly, t).await, ProbeResult::Healthy);
        assert_eq!(
            http_probe(&format!("{base}/missing"), Acceptance::BelowServerError, t).await,
            ProbeResult::Healthy
        );
        assert_eq!(
            http_probe(&format!("{base}/missing"), Acceptance::OkOnly, t).await,
            ProbeResult::Unhealthy(StatusCode::NOT_FOUND)
        );
        assert!(!http_probe(&format!("{base}/broken"), Acceptance::BelowServerError, t)
            .await
            .is_healthy());
    }

    #[tokio::test]
    async fn probe_connection_refused_is_failed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = http_probe(
            &format!("http://127.0.0.1:{port}/"),
            Acceptance::BelowServerError,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn url_probe_dispatches_plain_http() {
        let base = serve(Router::new().route("/", get(|| async { "ok" }))).await;
        let result = url_probe(&format!("{base}/"), Acceptance::OkOnly, Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn probe_bad_url_is_failed() {
        let result = http_probe("not a url", Acceptance::OkOnly, Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }
}
