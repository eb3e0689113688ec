//! `kind` + `kubectl` adapter for the cluster control interface.
//!
//! Every command runs with a bounded timeout; a timeout is reported as
//! an ordinary, retryable error.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use stagegrid_core::WorkloadDescriptor;
use stagegrid_core::config::ClusterSection;

use crate::cluster::{ClusterControl, ClusterHealth, ClusterWorkload, CreatedWorkload};
use crate::error::{ClusterError, ClusterResult};

/// `kind create cluster` pulls a node image; give it more room than
/// ordinary commands.
const CLUSTER_CREATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Label carrying the control-plane workload id on mirrored pods.
pub const WORKLOAD_ID_LABEL: &str = "stagegrid/workload-id";

pub struct KubectlCluster {
    config: ClusterSection,
    timeout: Duration,
}

impl KubectlCluster {
    pub fn new(config: ClusterSection) -> Self {
        let timeout = config.command_timeout();
        Self { config, timeout }
    }

    /// kubeconfig context kind registers for the cluster.
    fn context(&self) -> String {
        format!("kind-{}", self.config.name)
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<&[u8]>) -> ClusterResult<String> {
        let context = self.context();
        let mut full = vec!["--context", context.as_str()];
        full.extend_from_slice(args);
        run(&self.config.kubectl, &full, stdin, self.timeout).await
    }

    /// JSON pod manifest for a mirrored workload.
    pub fn pod_manifest(&self, workload: &WorkloadDescriptor) -> serde_json::Value {
        let mut labels = serde_json::Map::new();
        for (k, v) in &workload.labels {
            labels.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        labels.insert(
            WORKLOAD_ID_LABEL.to_string(),
            serde_json::Value::String(workload.id.clone()),
        );

        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod_name(workload),
                "namespace": self.config.namespace,
                "labels": labels,
            },
            "spec": {
                "containers": [{
                    "name": self.config.container_name,
                    "image": workload.image,
                    "ports": [{
                        "name": "http",
                        "containerPort": self.config.container_port,
                        "protocol": "TCP",
                    }],
                    "resources": {
                        "requests": {
                            "cpu": self.config.cpu_request,
                            "memory": self.config.memory_request,
                        },
                        "limits": {
                            "cpu": self.config.cpu_limit,
                            "memory": self.config.memory_limit,
                        },
                    },
                }],
            },
        })
    }
}

#[async_trait]
impl ClusterControl for KubectlCluster {
    async fn ensure_cluster(&self) -> ClusterResult<()> {
        match self.health().await {
            ClusterHealth::Running => {
                debug!(cluster = %self.config.name, "kind cluster already running");
            }
            _ => {
                info!(cluster = %self.config.name, "creating kind cluster");
                run(
                    &self.config.kind,
                    &["create", "cluster", "--name", &self.config.name],
                    None,
                    CLUSTER_CREATE_TIMEOUT.max(self.timeout),
                )
                .await?;
                info!(cluster = %self.config.name, "kind cluster created");
            }
        }

        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": self.config.namespace },
        });
        self.kubectl(&["apply", "-f", "-"], Some(manifest.to_string().as_bytes()))
            .await?;
        Ok(())
    }

    async fn create_workload(&self, workload: &WorkloadDescriptor) -> ClusterResult<CreatedWorkload> {
        let manifest = self.pod_manifest(workload).to_string();
        self.kubectl(&["apply", "-f", "-"], Some(manifest.as_bytes())).await?;
        info!(
            workload_id = %workload.id,
            pod = %pod_name(workload),
            namespace = %self.config.namespace,
            image = %workload.image,
            "created pod in local cluster"
        );

        let local_address = match self.workload_address(workload).await {
            Ok(addr) => addr,
            Err(e) => {
                debug!(workload_id = %workload.id, error = %e, "pod address not readable yet");
                None
            }
        };
        Ok(CreatedWorkload {
            name: pod_name(workload),
            namespace: self.config.namespace.clone(),
            local_address,
        })
    }

    async fn workload_address(&self, workload: &WorkloadDescriptor) -> ClusterResult<Option<String>> {
        let name = pod_name(workload);
        let out = self
            .kubectl(&["get", "pod", &name, "-n", &self.config.namespace, "-o", "json"], None)
            .await?;
        let pod: PodJson =
            serde_json::from_str(&out).map_err(|e| ClusterError::Parse(e.to_string()))?;
        Ok(pod.status.pod_ip.filter(|ip| !ip.is_empty()))
    }

    async fn list_workloads(&self) -> ClusterResult<Vec<ClusterWorkload>> {
        let out = self
            .kubectl(&["get", "pods", "-n", &self.config.namespace, "-o", "json"], None)
            .await?;
        parse_pod_list(&out)
    }

    async fn delete_workload(&self, workload: &WorkloadDescriptor) -> ClusterResult<()> {
        let name = pod_name(workload);
        self.kubectl(
            &["delete", "pod", &name, "-n", &self.config.namespace, "--ignore-not-found"],
            None,
        )
        .await?;
        info!(workload_id = %workload.id, pod = %name, "deleted pod from local cluster");
        Ok(())
    }

    async fn health(&self) -> ClusterHealth {
        match run(&self.config.kind, &["get", "clusters"], None, self.timeout).await {
            Ok(out) if out.lines().any(|l| l.trim() == self.config.name) => ClusterHealth::Running,
            Ok(_) => ClusterHealth::NotFound,
            Err(e) => {
                warn!(error = %e, "failed to query kind clusters");
                ClusterHealth::Unknown
            }
        }
    }
}

/// Pod names must be lowercase DNS labels.
pub fn pod_name(workload: &WorkloadDescriptor) -> String {
    let name: String = workload
        .name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let name = name.trim_matches('-');
    if name.is_empty() {
        format!("workload-{}", workload.id.to_ascii_lowercase())
    } else {
        name.chars().take(63).collect()
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodJson>,
}

#[derive(Debug, Deserialize)]
struct PodJson {
    metadata: PodMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMeta {
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(rename = "nodeName")]
    node_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(rename = "containerStatuses", default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    ready: bool,
    #[serde(rename = "restartCount", default)]
    restart_count: u32,
}

fn parse_pod_list(json: &str) -> ClusterResult<Vec<ClusterWorkload>> {
    let list: PodList = serde_json::from_str(json).map_err(|e| ClusterError::Parse(e.to_string()))?;
    Ok(list
        .items
        .into_iter()
        .map(|pod| {
            let first = pod.status.container_statuses.first();
            ClusterWorkload {
                name: pod.metadata.name,
                namespace: pod.metadata.namespace,
                phase: pod.status.phase,
                address: pod.status.pod_ip.filter(|ip| !ip.is_empty()),
                ready: first.is_some_and(|c| c.ready),
                restarts: first.map_or(0, |c| c.restart_count),
                node: pod.spec.node_name,
            }
        })
        .collect())
}

/// Run a command to completion, returning stdout.
async fn run(
    program: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> ClusterResult<String> {
    let command_line = format!("{program} {}", args.join(" "));
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ClusterError::CommandNotFound(program.to_string())
        } else {
            ClusterError::Io(e)
        }
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        // Close stdin so the child sees EOF.
        drop(pipe);
    }

    debug!(command = %command_line, "running cluster command");
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ClusterError::Timeout {
                command: command_line,
                after: timeout,
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        return Err(ClusterError::CommandFailed {
            command: command_line,
            code: output.status.code(),
            stderr: if stderr.is_empty() { stdout } else { stderr },
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
