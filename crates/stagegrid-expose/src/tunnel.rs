//! Tunnel manager: publishes a local port under a public URL.
//!
//! The tunnel program prints its public URL somewhere in its output
//! once the tunnel is up. Setup waits a bounded grace period for that
//! line; if it has not appeared the endpoint gets the placeholder URL
//! and stays `Pending` until a later `refresh_public_urls` finds it.
//!
//! `remove` only drops the record. The process handle is handed back
//! to the caller, who decides when to stop it.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use stagegrid_core::config::TunnelSection;
use stagegrid_core::{ExposureStatus, ExposureSummary, TunnelEndpoint, date_stamp, epoch_secs};

use crate::error::{ExposeError, ExposeResult};
use crate::probe::{Acceptance, url_probe};
use crate::process::{ManagedProcess, ProcessSpec};

struct TunnelEntry {
    record: TunnelEndpoint,
    process: Option<ManagedProcess>,
}

/// A tunnel taken out of the table. Its process is still running.
#[derive(Debug)]
pub struct RemovedTunnel {
    pub record: TunnelEndpoint,
    pub process: Option<ManagedProcess>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TunnelHealth {
    pub tunnel_id: String,
    pub public_url: String,
    pub healthy: bool,
}

pub struct TunnelManager {
    hostname: String,
    local_port: u16,
    protocol: String,
    program: String,
    args: Vec<String>,
    grace_period: Duration,
    url_pattern: Regex,
    placeholder_url: String,
    probe_timeout: Duration,
    /// Keyed by `<hostname>-<local_port>`.
    tunnels: RwLock<HashMap<String, TunnelEntry>>,
}

impl TunnelManager {
    pub fn new(config: &TunnelSection, hostname: String, probe_timeout: Duration) -> ExposeResult<Self> {
        Ok(Self {
            hostname,
            local_port: config.local_port,
            protocol: config.protocol.clone(),
            program: config.program.clone(),
            args: config.args.clone(),
            grace_period: config.grace_period(),
            url_pattern: Regex::new(&config.url_pattern)?,
            placeholder_url: config.placeholder_url.clone(),
            probe_timeout,
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    /// Set up the tunnel for the configured hostname and port.
    pub async fn setup(&self) -> ExposeResult<TunnelEndpoint> {
        let hostname = self.hostname.clone();
        self.setup_for(&hostname, self.local_port).await
    }

    /// Idempotent per `(hostname, local_port)`.
    pub async fn setup_for(&self, hostname: &str, local_port: u16) -> ExposeResult<TunnelEndpoint> {
        let key = format!("{hostname}-{local_port}");
        let mut record = {
            let mut tunnels = self.tunnels.write().await;
            if let Some(existing) = tunnels.get(&key) {
                debug!(%key, url = %existing.record.public_url, "tunnel already exists");
                return Ok(existing.record.clone());
            }
            let now = epoch_secs();
            let record = TunnelEndpoint {
                tunnel_id: format!("cloudflared-tunnel-{local_port}-{}", date_stamp(now)),
                hostname: hostname.to_string(),
                local_port,
                protocol: self.protocol.clone(),
                public_url: self.placeholder_url.clone(),
                status: ExposureStatus::Pending,
                pid: None,
                created_at: now,
            };
            tunnels.insert(
                key.clone(),
                TunnelEntry {
                    record: record.clone(),
                    process: None,
                },
            );
            record
        };

        let spec = ProcessSpec::from_template(
            &self.program,
            &self.args,
            &[("local_port", local_port.to_string())],
        );
        info!(command = %spec.command_line(), "starting tunnel");
        let process = match ManagedProcess::spawn(spec) {
            Ok(p) => p,
            Err(e) => {
                self.tunnels.write().await.remove(&key);
                warn!(%key, error = %e, "failed to start tunnel process");
                return Err(e);
            }
        };
        record.pid = process.pid();

        let found = process.wait_for_match(&self.url_pattern, self.grace_period).await;
        let running = process.is_running().await;
        match found {
            Some(url) => {
                record.public_url = url;
                record.status = ExposureStatus::Active;
            }
            None if running => {
                info!(%key, placeholder = %self.placeholder_url, "tunnel url not published yet");
            }
            None => {
                let output = process.output().await;
                warn!(%key, output = ?output, "tunnel process exited during startup");
                record.status = ExposureStatus::Failed;
            }
        }

        let mut tunnels = self.tunnels.write().await;
        match tunnels.get_mut(&key) {
            Some(entry) => {
                entry.record = record.clone();
                entry.process = Some(process);
            }
            None => {
                drop(tunnels);
                if let Err(e) = process.stop().await {
                    warn!(%key, error = %e, "failed to stop orphaned tunnel process");
                }
                return Err(ExposeError::TunnelNotFound(key));
            }
        }
        drop(tunnels);

        info!(
            tunnel_id = %record.tunnel_id,
            public_url = %record.public_url,
            local_port,
            status = %record.status,
            "tunnel set up"
        );
        Ok(record)
    }

    /// Re-scan process output of pending tunnels for their public URL.
    ///
    /// Returns how many records changed.
    pub async fn refresh_public_urls(&self) -> usize {
        let pending: Vec<(String, ManagedProcess)> = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .iter()
                .filter(|(_, e)| e.record.status != ExposureStatus::Failed)
                .filter_map(|(k, e)| e.process.clone().map(|p| (k.clone(), p)))
                .collect()
        };

        let mut updates = Vec::new();
        for (key, process) in pending {
            let running = process.is_running().await;
            let url = process.find_match(&self.url_pattern).await;
            updates.push((key, url, running));
        }

        let mut changed = 0;
        let mut tunnels = self.tunnels.write().await;
        for (key, url, running) in updates {
            let Some(entry) = tunnels.get_mut(&key) else {
                continue;
            };
            if !running {
                if entry.record.status != ExposureStatus::Failed {
                    warn!(tunnel_id = %entry.record.tunnel_id, "tunnel process exited");
                    entry.record.status = ExposureStatus::Failed;
                    changed += 1;
                }
                continue;
            }
            if let Some(url) = url {
                if entry.record.public_url != url || entry.record.status != ExposureStatus::Active {
                    info!(tunnel_id = %entry.record.tunnel_id, public_url = %url, "tunnel url discovered");
                    entry.record.public_url = url;
                    entry.record.status = ExposureStatus::Active;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Refresh URLs, then probe every active public URL. Nothing is
    /// removed on failure.
    pub async fn health_check(&self) -> Vec<TunnelHealth> {
        self.refresh_public_urls().await;
        let mut results = Vec::new();
        for record in self.list().await {
            let healthy = if record.status == ExposureStatus::Active {
                url_probe(&record.public_url, Acceptance::OkOnly, self.probe_timeout)
                    .await
                    .is_healthy()
            } else {
                false
            };
            if !healthy {
                warn!(tunnel_id = %record.tunnel_id, url = %record.public_url, "tunnel unhealthy");
            }
            results.push(TunnelHealth {
                tunnel_id: record.tunnel_id,
                public_url: record.public_url,
                healthy,
            });
        }
        results
    }

    /// Logical removal. The caller owns stopping the returned process.
    pub async fn remove(&self, tunnel_id: &str) -> ExposeResult<RemovedTunnel> {
        let mut tunnels = self.tunnels.write().await;
        let key = tunnels
            .iter()
            .find(|(_, e)| e.record.tunnel_id == tunnel_id)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| ExposeError::TunnelNotFound(tunnel_id.to_string()))?;
        let entry = tunnels
            .remove(&key)
            .ok_or_else(|| ExposeError::TunnelNotFound(tunnel_id.to_string()))?;
        info!(%tunnel_id, "tunnel removed from tracking");
        Ok(RemovedTunnel {
            record: entry.record,
            process: entry.process,
        })
    }

    pub async fn get(&self, tunnel_id: &str) -> Option<TunnelEndpoint> {
        self.tunnels
            .read()
            .await
            .values()
            .find(|e| e.record.tunnel_id == tunnel_id)
            .map(|e| e.record.clone())
    }

    pub async fn list(&self) -> Vec<TunnelEndpoint> {
        let tunnels = self.tunnels.read().await;
        let mut out: Vec<TunnelEndpoint> = tunnels.values().map(|e| e.record.clone()).collect();
        out.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        out
    }

    /// First active, discovered public URL; the placeholder otherwise.
    pub async fn best_public_url(&self) -> String {
        self.list()
            .await
            .into_iter()
            .find(|t| t.status == ExposureStatus::Active && t.public_url != self.placeholder_url)
            .map(|t| t.public_url)
            .unwrap_or_else(|| self.placeholder_url.clone())
    }

    pub fn placeholder_url(&self) -> &str {
        &self.placeholder_url
    }

    pub async fn summary(&self) -> ExposureSummary {
        let tunnels = self.tunnels.read().await;
        ExposureSummary::from_statuses(tunnels.values().map(|e| e.record.status))
    }

    /// Stop every tunnel process still tracked.
    pub async fn shutdown(&self) {
        let processes: Vec<ManagedProcess> = {
            let mut tunnels = self.tunnels.write().await;
            tunnels.values_mut().filter_map(|e| e.process.take()).collect()
        };
        for process in processes {
            if let Err(e) = process.stop().await {
                warn!(error = %e, "failed to stop tunnel process");
            }
        }
    }
}
