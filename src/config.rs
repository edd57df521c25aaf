use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;

/// Container runtime used by the sandbox executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RuntimeKind {
    Docker,
    Podman,
    /// Runs the command vector on the host without a container.
    /// Development and tests only: no network isolation.
    Direct,
}

impl RuntimeKind {
    pub fn default_binary(&self) -> Option<&'static str> {
        match self {
            RuntimeKind::Docker => Some("docker"),
            RuntimeKind::Podman => Some("podman"),
            RuntimeKind::Direct => None,
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Podman => write!(f, "podman"),
            RuntimeKind::Direct => write!(f, "direct"),
        }
    }
}

/// Configuration for container-based job execution.
///
/// Every job runs with `--network=none` unless `restricted_network` is set
/// and the job asks for the `restricted` policy.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub runtime: RuntimeKind,
    /// Overrides the runtime's binary name (e.g. an absolute path to podman).
    pub runtime_binary: Option<String>,
    /// Image used when a job does not name one
    pub default_image: String,
    /// Applied when a job asks for `timeout_seconds = 0`
    pub default_timeout: Duration,
    /// Per-stream cap on captured stdout/stderr
    pub max_output_bytes: usize,
    /// Container network that `restricted` jobs may join. `None` keeps every
    /// job on `--network=none`.
    pub restricted_network: Option<String>,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Drop all Linux capabilities and forbid privilege escalation
    pub harden: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Podman,
            runtime_binary: None,
            default_image: crate::protocol::DEFAULT_IMAGE.to_string(),
            default_timeout: Duration::from_secs(300),
            max_output_bytes: 1 << 20,
            restricted_network: None,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
            harden: true,
        }
    }
}

impl SandboxConfig {
    /// Sandbox running commands on the host, used by tests and local development.
    pub fn direct() -> Self {
        Self {
            runtime: RuntimeKind::Direct,
            ..Default::default()
        }
    }

    pub fn runtime_binary(&self) -> Option<&str> {
        self.runtime_binary
            .as_deref()
            .or_else(|| self.runtime.default_binary())
    }
}

/// Transport-level request timeouts and limits.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Upper bound on receiving a request body
    pub read_body_timeout: Duration,
    /// Upper bound on producing a whole response
    pub write_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            read_body_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_body_bytes: 10 << 20,
        }
    }
}

impl HttpConfig {
    /// Node agent defaults: the write timeout has to cover a full default
    /// job run plus teardown.
    pub fn node_agent() -> Self {
        Self {
            write_timeout: Duration::from_secs(330),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: String,
    pub access_token_ttl: TimeDelta,
    pub node_token_ttl: TimeDelta,
    pub registration_psk: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me-in-production".to_string(),
            issuer: "sandbox-fleet".to_string(),
            access_token_ttl: TimeDelta::minutes(15),
            node_token_ttl: TimeDelta::hours(24),
            registration_psk: "default-psk-change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Must exceed the longest job timeout by a safety margin.
    pub lease_ttl: TimeDelta,
    pub reaper_interval: Duration,
    pub max_attempts: u32,
    /// Nodes not seen for this long are marked inactive by the reaper loop.
    pub node_stale_after: TimeDelta,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: TimeDelta::minutes(10),
            reaper_interval: Duration::from_secs(30),
            max_attempts: 3,
            node_stale_after: TimeDelta::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub listen_addr: SocketAddr,
    /// redb file; `None` keeps all state in memory.
    pub store_path: Option<PathBuf>,
    pub store_timeout: Duration,
    pub auth: AuthConfig,
    pub scheduler: SchedulerConfig,
    /// Requests per key per window; 0 disables limiting.
    pub rate_limit: u32,
    pub rate_limit_window: Duration,
    pub http: HttpConfig,
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            store_path: None,
            store_timeout: Duration::from_secs(5),
            auth: AuthConfig::default(),
            scheduler: SchedulerConfig::default(),
            rate_limit: 60,
            rate_limit_window: Duration::from_secs(60),
            http: HttpConfig::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    pub orchestrator_url: String,
    pub registration_psk: String,
    pub node_slug: String,
    pub node_name: String,
    pub labels: Vec<String>,
    pub listen_addr: SocketAddr,
    /// Static bearer accepted by the Node Agent endpoint
    pub worker_api_token: String,
    pub poll_interval: Duration,
    pub capability_interval: Duration,
    pub client_timeout: Duration,
    /// Registration attempts before the node manager gives up
    pub register_attempts: u32,
    pub register_retry: Duration,
    pub ram_mb: u64,
    pub max_concurrency: u32,
    pub sandbox: SandboxConfig,
    pub http: HttpConfig,
    pub shutdown_grace: Duration,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: "http://localhost:8080".to_string(),
            registration_psk: "default-psk-change-me".to_string(),
            node_slug: "node-01".to_string(),
            node_name: "Default Node".to_string(),
            labels: Vec::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            worker_api_token: "phase1-static-token".to_string(),
            poll_interval: Duration::from_secs(1),
            capability_interval: Duration::from_secs(60),
            client_timeout: Duration::from_secs(30),
            register_attempts: 3,
            register_retry: Duration::from_secs(5),
            ram_mb: 0,
            max_concurrency: 4,
            sandbox: SandboxConfig::default(),
            http: HttpConfig::node_agent(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}
