//! stagegridd: the staging agent daemon.
//!
//! # Usage
//!
//! ```text
//! stagegridd run --config stagegrid.toml --control-plane-url http://cp:8080
//! stagegridd config --namespace review   # print the effective config
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};

use stagegrid_core::AgentConfig;
use stagegrid_reconcile::KubectlCluster;
use stagegridd::Agent;

#[derive(Parser)]
#[command(name = "stagegridd", about = "Stagegrid staging agent daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent.
    Run(Overrides),
    /// Print the effective configuration as TOML and exit.
    Config(Overrides),
}

/// Command-line overrides for values in the config file.
#[derive(Args)]
struct Overrides {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent identity; must match the control plane's source id.
    #[arg(long)]
    agent_id: Option<String>,

    /// Control plane base URL.
    #[arg(long)]
    control_plane_url: Option<String>,

    /// Port for the agent API (also the port the tunnel publishes).
    #[arg(long)]
    agent_port: Option<u16>,

    /// Reconciliation interval, e.g. `30s`.
    #[arg(long)]
    sync_interval: Option<String>,

    /// Namespace for mirrored workloads.
    #[arg(long)]
    namespace: Option<String>,

    /// Name of the local kind cluster.
    #[arg(long)]
    kind_cluster: Option<String>,

    /// Do not start a public tunnel.
    #[arg(long)]
    no_tunnel: bool,
}

impl Overrides {
    fn load(self) -> anyhow::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => AgentConfig::default(),
        };

        if let Some(id) = self.agent_id {
            config.agent.id = Some(id);
        }
        if let Some(url) = self.control_plane_url {
            config.control_plane.url = url;
        }
        if let Some(port) = self.agent_port {
            config.agent.listen_port = port;
            config.tunnel.local_port = port;
        }
        if let Some(interval) = self.sync_interval {
            config.reconcile.sync_interval = interval;
        }
        if let Some(ns) = self.namespace {
            config.cluster.namespace = ns;
        }
        if let Some(name) = self.kind_cluster {
            config.cluster.name = name;
        }
        if self.no_tunnel {
            config.tunnel.enabled = false;
        }

        config.validate()?;
        config.resolve_agent_id();
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run(overrides) => run(overrides.load()?).await,
        Command::Config(overrides) => {
            let config = overrides.load()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stagegridd=debug,stagegrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    info!("stagegrid agent starting");

    let host: std::net::IpAddr = config
        .agent
        .listen_host
        .parse()
        .with_context(|| format!("invalid agent.listen_host {:?}", config.agent.listen_host))?;
    let addr = SocketAddr::new(host, config.agent.listen_port);

    // Binding the API port is the one fatal startup step.
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding agent API on {addr}"))?;

    let cluster = Arc::new(KubectlCluster::new(config.cluster.clone()));
    let agent = Arc::new(Agent::new(config, cluster)?);
    info!(
        agent_id = %agent.agent_id,
        control_plane = %agent.config.control_plane.url,
        namespace = %agent.config.cluster.namespace,
        "agent initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    agent.run(listener, shutdown_rx).await
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
