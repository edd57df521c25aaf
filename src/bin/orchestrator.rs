use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sandbox_fleet::config::{AuthConfig, HttpConfig, OrchestratorConfig, SchedulerConfig};
use sandbox_fleet::orchestrator::Orchestrator;
use sandbox_fleet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(version)]
#[command(about = "Accepts tasks and leases their jobs to sandbox nodes")]
struct Args {
    /// Address to serve the HTTP API on
    #[arg(long, env = "FLEET_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// redb database file (state is kept in memory when omitted)
    #[arg(long, env = "FLEET_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Per-operation store deadline in milliseconds
    #[arg(long, env = "FLEET_STORE_TIMEOUT_MS", default_value = "5000")]
    store_timeout_ms: u64,

    /// HMAC secret for user and node tokens
    #[arg(long, env = "FLEET_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Pre-shared key nodes present when registering
    #[arg(long, env = "FLEET_REGISTRATION_PSK", hide_env_values = true)]
    registration_psk: String,

    #[arg(long, env = "FLEET_ACCESS_TOKEN_TTL_SECS", default_value = "900")]
    access_token_ttl_secs: i64,

    #[arg(long, env = "FLEET_NODE_TOKEN_TTL_SECS", default_value = "86400")]
    node_token_ttl_secs: i64,

    /// Lease lifetime; must exceed the longest job timeout
    #[arg(long, env = "FLEET_LEASE_TTL_SECS", default_value = "600")]
    lease_ttl_secs: i64,

    #[arg(long, env = "FLEET_REAPER_INTERVAL_SECS", default_value = "30")]
    reaper_interval_secs: u64,

    /// Lease expiries tolerated before a job is failed
    #[arg(long, env = "FLEET_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    /// Nodes silent this long are marked inactive
    #[arg(long, env = "FLEET_NODE_STALE_SECS", default_value = "300")]
    node_stale_secs: i64,

    /// Requests per user per minute (0 disables)
    #[arg(long, env = "FLEET_RATE_LIMIT", default_value = "60")]
    rate_limit: u32,

    /// Print an access token for the bootstrap admin user and exit
    #[arg(long)]
    print_admin_token: bool,
}

impl Args {
    fn into_config(self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        OrchestratorConfig {
            listen_addr: self.listen,
            store_path: self.store_path,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            auth: AuthConfig {
                jwt_secret: self.jwt_secret,
                registration_psk: self.registration_psk,
                access_token_ttl: TimeDelta::seconds(self.access_token_ttl_secs),
                node_token_ttl: TimeDelta::seconds(self.node_token_ttl_secs),
                ..AuthConfig::default()
            },
            scheduler: SchedulerConfig {
                lease_ttl: TimeDelta::seconds(self.lease_ttl_secs),
                reaper_interval: Duration::from_secs(self.reaper_interval_secs.max(1)),
                max_attempts: self.max_attempts.max(1),
                node_stale_after: TimeDelta::seconds(self.node_stale_secs),
            },
            rate_limit: self.rate_limit,
            http: HttpConfig::default(),
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

    let args = Args::parse();
    let print_admin_token = args.print_admin_token;
    let config = args.into_config();
    if config.auth.jwt_secret.len() < 32 {
        tracing::warn!("JWT secret is shorter than 32 bytes");
    }

    let orchestrator = Orchestrator::open(config)?;
    if print_admin_token {
        let issued = orchestrator.admin_token().await?;
        println!("{}", issued.token);
        eprintln!("expires at {}", issued.expires_at.to_rfc3339());
        return Ok(());
    }

    let shutdown = install_shutdown_handler()?;
    orchestrator.run(shutdown).await?;
    Ok(())
}
