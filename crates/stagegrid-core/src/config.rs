//! stagegrid.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file
//! at all) yields a working agent. Durations are strings such as
//! `"30s"` or `"500ms"` and are validated at load time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::time::{epoch_secs, parse_duration};

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub control_plane: ControlPlaneSection,
    pub cluster: ClusterSection,
    pub reconcile: ReconcileSection,
    pub redirect: RedirectSection,
    pub proxy: ProxySection,
    pub tunnel: TunnelSection,
    pub health: HealthSection,
    pub registration: RegistrationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Identity checked against the source id of every ingestion batch.
    /// Generated at startup when unset.
    pub id: Option<String>,
    pub listen_host: String,
    pub listen_port: u16,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8082,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneSection {
    pub url: String,
    pub request_timeout: String,
    pub status_interval: String,
}

impl Default for ControlPlaneSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            request_timeout: "30s".to_string(),
            status_interval: "30s".to_string(),
        }
    }
}

impl ControlPlaneSection {
    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn status_interval(&self) -> Duration {
        parse_duration(&self.status_interval).unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Name of the local kind cluster.
    pub name: String,
    pub namespace: String,
    pub kubectl: String,
    pub kind: String,
    pub command_timeout: String,
    pub container_name: String,
    pub container_port: u16,
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "staging-cluster".to_string(),
            namespace: "staging".to_string(),
            kubectl: "kubectl".to_string(),
            kind: "kind".to_string(),
            command_timeout: "60s".to_string(),
            container_name: "main".to_string(),
            container_port: 80,
            cpu_request: "100m".to_string(),
            memory_request: "128Mi".to_string(),
            cpu_limit: "200m".to_string(),
            memory_limit: "256Mi".to_string(),
        }
    }
}

impl ClusterSection {
    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub sync_interval: String,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            sync_interval: "30s".to_string(),
        }
    }
}

impl ReconcileSection {
    pub fn sync_interval(&self) -> Duration {
        parse_duration(&self.sync_interval).unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectSection {
    /// Inclusive range; must not contain the agent or proxy listen port.
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Host used for the bind-and-release availability probe.
    pub bind_host: String,
    pub forwarder_program: String,
    /// Arguments with `{local_port}`, `{remote_host}`, `{remote_port}`
    /// placeholders.
    pub forwarder_args: Vec<String>,
    /// A forwarder that exits within this window is considered failed.
    pub startup_grace: String,
    pub enable_alias: bool,
    pub alias_file: PathBuf,
    pub alias_suffix: String,
}

impl Default for RedirectSection {
    fn default() -> Self {
        Self {
            port_range_start: 8100,
            port_range_end: 9000,
            bind_host: "0.0.0.0".to_string(),
            forwarder_program: "socat".to_string(),
            forwarder_args: vec![
                "TCP-LISTEN:{local_port},fork,reuseaddr".to_string(),
                "TCP:{remote_host}:{remote_port}".to_string(),
            ],
            startup_grace: "500ms".to_string(),
            enable_alias: true,
            alias_file: PathBuf::from("/tmp/staging_hosts"),
            alias_suffix: "-staging.local".to_string(),
        }
    }
}

impl RedirectSection {
    pub fn startup_grace(&self) -> Duration {
        parse_duration(&self.startup_grace).unwrap_or(Duration::from_millis(500))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub listen_host: String,
    pub listen_port: u16,
    /// Port on the backend address requests are forwarded to.
    pub backend_port: u16,
    /// Value of the `X-Proxy-By` header added to forwarded requests.
    pub marker: String,
    pub request_timeout: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
            backend_port: 80,
            marker: "stagegrid-agent".to_string(),
            request_timeout: "30s".to_string(),
        }
    }
}

impl ProxySection {
    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub enabled: bool,
    /// Defaults to `<agent-id>-agent.trycloudflare.com`.
    pub hostname: Option<String>,
    pub local_port: u16,
    pub protocol: String,
    pub program: String,
    /// Arguments with a `{local_port}` placeholder.
    pub args: Vec<String>,
    /// How long to wait for the public URL before using the placeholder.
    pub grace_period: String,
    /// Regex matched against the tunnel process output.
    pub url_pattern: String,
    pub placeholder_url: String,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            enabled: true,
            hostname: None,
            local_port: 8082,
            protocol: "quic".to_string(),
            program: "cloudflared".to_string(),
            args: vec![
                "tunnel".to_string(),
                "--url".to_string(),
                "http://localhost:{local_port}".to_string(),
            ],
            grace_period: "5s".to_string(),
            url_pattern: r"https://[a-zA-Z0-9-]+\.trycloudflare\.com".to_string(),
            placeholder_url: "https://tunnel-establishing.trycloudflare.com".to_string(),
        }
    }
}

impl TunnelSection {
    pub fn grace_period(&self) -> Duration {
        parse_duration(&self.grace_period).unwrap_or(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub check_interval: String,
    pub probe_timeout: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval: "60s".to_string(),
            probe_timeout: "5s".to_string(),
        }
    }
}

impl HealthSection {
    pub fn check_interval(&self) -> Duration {
        parse_duration(&self.check_interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.probe_timeout).unwrap_or(Duration::from_secs(5))
    }
}

/// Capabilities and resources advertised at self-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSection {
    pub enabled: bool,
    pub capabilities: Vec<String>,
    pub cpu_available: String,
    pub memory_available: String,
    pub storage_available: String,
    pub network_ports: Vec<u16>,
    pub auto_scale: bool,
}

impl Default for RegistrationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capabilities: vec![
                "staging_pods".to_string(),
                "kind_cluster".to_string(),
                "http_proxy".to_string(),
                "cloudflare_tunnel".to_string(),
                "auto_scaling".to_string(),
            ],
            cpu_available: "4 cores".to_string(),
            memory_available: "8GB".to_string(),
            storage_available: "100GB".to_string(),
            network_ports: vec![8080, 8082, 30000, 32767],
            auto_scale: true,
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The configured agent id, or a generated one if unset.
    pub fn agent_id(&self) -> String {
        match &self.agent.id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => generate_agent_id(),
        }
    }

    /// Fill in the agent id so every component sees the same value.
    pub fn resolve_agent_id(&mut self) -> String {
        let id = self.agent_id();
        self.agent.id = Some(id.clone());
        id
    }

    /// Public tunnel hostname for the given agent.
    pub fn tunnel_hostname(&self, agent_id: &str) -> String {
        self.tunnel
            .hostname
            .clone()
            .unwrap_or_else(|| format!("{agent_id}-agent.trycloudflare.com"))
    }

    /// Check invariants that would otherwise surface as runtime faults.
    /// Ports the agent listens on itself, by config field.
    pub fn listener_ports(&self) -> [(&'static str, u16); 2] {
        [
            ("agent.listen_port", self.agent.listen_port),
            ("proxy.listen_port", self.proxy.listen_port),
        ]
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.agent.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ConfigError::Invalid("agent.id must not be empty".into()));
        }
        if self.control_plane.url.trim().is_empty() {
            return Err(ConfigError::Invalid("control_plane.url must not be empty".into()));
        }
        if self.redirect.port_range_start > self.redirect.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "redirect port range {}-{} is empty",
                self.redirect.port_range_start, self.redirect.port_range_end
            )));
        }
        if self.redirect.port_range_start == 0 {
            return Err(ConfigError::Invalid("redirect port range must start above 0".into()));
        }
        let range = self.redirect.port_range_start..=self.redirect.port_range_end;
        for (field, port) in self.listener_ports() {
            if port != 0 && range.contains(&port) {
                return Err(ConfigError::Invalid(format!(
                    "{field} {port} lies inside redirect port range {}-{}",
                    range.start(),
                    range.end()
                )));
            }
        }
        if self.redirect.forwarder_program.trim().is_empty() {
            return Err(ConfigError::Invalid("redirect.forwarder_program must not be empty".into()));
        }
        if self.tunnel.enabled {
            regex_check(&self.tunnel.url_pattern)?;
        }

        let durations = [
            ("control_plane.request_timeout", &self.control_plane.request_timeout),
            ("control_plane.status_interval", &self.control_plane.status_interval),
            ("cluster.command_timeout", &self.cluster.command_timeout),
            ("reconcile.sync_interval", &self.reconcile.sync_interval),
            ("redirect.startup_grace", &self.redirect.startup_grace),
            ("proxy.request_timeout", &self.proxy.request_timeout),
            ("tunnel.grace_period", &self.tunnel.grace_period),
            ("health.check_interval", &self.health.check_interval),
            ("health.probe_timeout", &self.health.probe_timeout),
        ];
        for (field, value) in durations {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                Some(_) => {
                    return Err(ConfigError::Invalid(format!("{field} must be non-zero")));
                }
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "{field}: invalid duration {value:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn regex_check(pattern: &str) -> ConfigResult<()> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("tunnel.url_pattern: {e}")))
}

/// `staging-agent-<hostname>-<unix-seconds>`.
pub fn generate_agent_id() -> String {
    format!("staging-agent-{}-{}", local_hostname(), epoch_secs())
}

/// Best-effort host name without pulling in a platform crate.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config = AgentConfig::from_toml("").unwrap();
        assert_eq!(config.agent.listen_port, 8082);
        assert_eq!(config.control_plane.url, "http://localhost:8080");
        assert_eq!(config.cluster.name, "staging-cluster");
        assert_eq!(config.cluster.namespace, "staging");
        assert_eq!(config.redirect.port_range_start, 8100);
        assert_eq!(config.redirect.port_range_end, 9000);
        assert_eq!(config.reconcile.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.tunnel.grace_period(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = AgentConfig::from_toml(
            r#"
[agent]
id = "agent-7"

[redirect]
port_range_start = 9100
port_range_end = 9110

[reconcile]
sync_interval = "500ms"
"#,
        )
        .unwrap();
        assert_eq!(config.agent_id(), "agent-7");
        assert_eq!(config.agent.listen_port, 8082);
        assert_eq!(config.redirect.port_range_start, 9100);
        assert_eq!(config.redirect.forwarder_program, "socat");
        assert_eq!(config.reconcile.sync_interval(), Duration::from_millis(500));
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cluster]\nnamespace = \"qa\"").unwrap();
        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster.namespace, "qa");
    }

    #[test]
    fn from_file_missing_is_read_error() {
        let err = AgentConfig::from_file(Path::new("/nonexistent/stagegrid.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn validate_rejects_empty_port_range() {
        let mut config = AgentConfig::default();
        config.redirect.port_range_start = 9000;
        config.redirect.port_range_end = 8080;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn default_listeners_lie_outside_redirect_range() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        let range = config.redirect.port_range_start..=config.redirect.port_range_end;
        for (_, port) in config.listener_ports() {
            assert!(!range.contains(&port), "port {port} overlaps the redirect range");
        }
    }

    #[test]
    fn validate_rejects_listener_inside_redirect_range() {
        let mut config = AgentConfig::default();
        config.redirect.port_range_start = 8080;
        config.redirect.port_range_end = 8081;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("proxy.listen_port 8080"));

        let mut config = AgentConfig::default();
        config.agent.listen_port = 8500;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("agent.listen_port 8500"));

        let mut config = AgentConfig::default();
        config.redirect.port_range_start = 8080;
        config.proxy.listen_port = 0;
        config.agent.listen_port = 0;
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_durations() {
        let mut config = AgentConfig::default();
        config.reconcile.sync_interval = "0s".into();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.health.probe_timeout = "soon".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_identity() {
        let mut config = AgentConfig::default();
        config.agent.id = Some("  ".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn generated_agent_id_shape() {
        let config = AgentConfig::default();
        let id = config.agent_id();
        assert!(id.starts_with("staging-agent-"));
        assert_eq!(config.tunnel_hostname("a"), "a-agent.trycloudflare.com");
    }

    #[test]
    fn resolve_agent_id_is_stable() {
        let mut config = AgentConfig::default();
        let first = config.resolve_agent_id();
        assert_eq!(config.agent_id(), first);
    }
}
