use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sandbox_fleet::config::{HttpConfig, NodeManagerConfig, RuntimeKind, SandboxConfig};
use sandbox_fleet::shutdown::install_shutdown_handler;
use sandbox_fleet::worker::executor::TEARDOWN_BUDGET;
use sandbox_fleet::worker::NodeManager;

/// Slack between a job's teardown and the agent's response deadline.
const WRITE_HEADROOM: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "node-manager")]
#[command(version)]
#[command(about = "Runs leased jobs in container sandboxes on this host")]
struct Args {
    /// Orchestrator base URL
    #[arg(long, env = "FLEET_ORCHESTRATOR_URL", default_value = "http://localhost:8080")]
    orchestrator_url: String,

    /// Pre-shared registration key
    #[arg(long, env = "FLEET_REGISTRATION_PSK", hide_env_values = true)]
    registration_psk: String,

    /// Stable identity of this node
    #[arg(long, env = "FLEET_NODE_SLUG", default_value = "node-01")]
    node_slug: String,

    #[arg(long, env = "FLEET_NODE_NAME", default_value = "")]
    node_name: String,

    /// Comma-separated free-form labels
    #[arg(long, env = "FLEET_NODE_LABELS", value_delimiter = ',')]
    labels: Vec<String>,

    /// Address for the Node Agent endpoint
    #[arg(long, env = "FLEET_NODE_LISTEN_ADDR", default_value = "0.0.0.0:8081")]
    listen: SocketAddr,

    /// Bearer token accepted by the Node Agent endpoint
    #[arg(long, env = "FLEET_WORKER_TOKEN", hide_env_values = true)]
    worker_token: String,

    #[arg(long, env = "FLEET_RUNTIME", value_enum, default_value = "podman")]
    runtime: RuntimeKind,

    /// Path to the runtime binary, when not on PATH
    #[arg(long, env = "FLEET_RUNTIME_BINARY")]
    runtime_binary: Option<String>,

    #[arg(long, env = "FLEET_DEFAULT_IMAGE", default_value = "alpine:latest")]
    default_image: String,

    /// Applied to jobs that request timeout_seconds = 0
    #[arg(long, env = "FLEET_DEFAULT_TIMEOUT_SECS", default_value = "300")]
    default_timeout_secs: u64,

    /// Per-stream cap on captured output
    #[arg(long, env = "FLEET_MAX_OUTPUT_BYTES", default_value = "1048576")]
    max_output_bytes: usize,

    /// Container network for jobs with the `restricted` policy
    #[arg(long, env = "FLEET_RESTRICTED_NETWORK")]
    restricted_network: Option<String>,

    #[arg(long, env = "FLEET_MEMORY_LIMIT", default_value = "256m")]
    memory_limit: String,

    #[arg(long, env = "FLEET_CPU_LIMIT", default_value = "0.5")]
    cpu_limit: String,

    /// Jobs run concurrently by the poll loop
    #[arg(long, env = "FLEET_MAX_CONCURRENCY", default_value = "4")]
    max_concurrency: u32,

    #[arg(long, env = "FLEET_POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    #[arg(long, env = "FLEET_CAPABILITY_INTERVAL_SECS", default_value = "60")]
    capability_interval_secs: u64,

    /// Registration attempts before exiting with an error
    #[arg(long, env = "FLEET_REGISTER_ATTEMPTS", default_value = "3")]
    register_attempts: u32,
}

impl Args {
    fn into_config(self) -> NodeManagerConfig {
        let defaults = NodeManagerConfig::default();
        let default_timeout = Duration::from_secs(self.default_timeout_secs);
        NodeManagerConfig {
            orchestrator_url: self.orchestrator_url,
            registration_psk: self.registration_psk,
            node_name: if self.node_name.is_empty() {
                self.node_slug.clone()
            } else {
                self.node_name
            },
            node_slug: self.node_slug,
            labels: self.labels.into_iter().filter(|l| !l.is_empty()).collect(),
            listen_addr: self.listen,
            worker_api_token: self.worker_token,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(100)),
            capability_interval: Duration::from_secs(self.capability_interval_secs.max(1)),
            max_concurrency: self.max_concurrency.max(1),
            register_attempts: self.register_attempts.max(1),
            sandbox: SandboxConfig {
                runtime: self.runtime,
                runtime_binary: self.runtime_binary,
                default_image: self.default_image,
                default_timeout,
                max_output_bytes: self.max_output_bytes,
                restricted_network: self.restricted_network,
                memory_limit: Some(self.memory_limit).filter(|m| !m.is_empty()),
                cpu_limit: Some(self.cpu_limit).filter(|c| !c.is_empty()),
                ..SandboxConfig::default()
            },
            http: HttpConfig {
                write_timeout: defaults
                    .http
                    .write_timeout
                    .max(default_timeout + TEARDOWN_BUDGET + WRITE_HEADROOM),
                ..HttpConfig::node_agent()
            },
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();
    if config.sandbox.runtime == RuntimeKind::Direct {
        tracing::warn!("Direct runtime: jobs run on the host without isolation");
    }
    tracing::info!(
        slug = %config.node_slug,
        orchestrator = %config.orchestrator_url,
        runtime = %config.sandbox.runtime,
        "Starting node manager"
    );

    let shutdown = install_shutdown_handler()?;
    NodeManager::new(config)?.run(shutdown).await?;
    Ok(())
}
