use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::auth::{ensure_admin, IssuedToken, TokenIssuer};
use crate::config::OrchestratorConfig;
use crate::error::{FleetError, Result};
use crate::ratelimit::RateLimiter;
use crate::registry::Registry;
use crate::scheduler::{Reaper, Scheduler};
use crate::server;
use crate::store::{MemoryBackend, Store};
use crate::tasks::TaskService;

/// Composition root for the orchestrator process.
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: AppState,
}

impl Orchestrator {
    /// Opens the store and wires the services. Does not start anything.
    pub fn open(config: OrchestratorConfig) -> Result<Self> {
        let store = match &config.store_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Opening store");
                Store::open(path, config.store_timeout)?
            }
            None => {
                tracing::warn!("No store path configured, state is kept in memory only");
                Store::new(Arc::new(MemoryBackend::new()), config.store_timeout)
            }
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: OrchestratorConfig, store: Store) -> Self {
        let tokens = Arc::new(TokenIssuer::new(&config.auth));
        let scheduler = Scheduler::new(store.clone(), config.scheduler.clone());
        let registry = Registry::new(
            store.clone(),
            tokens.clone(),
            config.auth.registration_psk.clone(),
            config.scheduler.node_stale_after,
        );
        let tasks = TaskService::new(store.clone(), scheduler.clone());
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_limit_window));
        let state = AppState {
            store,
            scheduler,
            registry,
            tasks,
            tokens,
            limiter,
        };
        Self { config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Mints an access token for the bootstrap `admin` user.
    pub async fn admin_token(&self) -> Result<IssuedToken> {
        let now = Utc::now();
        let admin = ensure_admin(&self.state.store, now).await?;
        self.state.tokens.issue_user(&admin, now)
    }

    /// Serves the API and runs the reaper until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        ensure_admin(&self.state.store, Utc::now()).await?;

        let reaper = Reaper::new(self.state.scheduler.clone(), self.state.registry.clone());
        let reaper_shutdown = shutdown.clone();
        let reaper_task = tokio::spawn(async move { reaper.run(reaper_shutdown).await });

        let limiter = self.state.limiter.clone();
        let sweeper_shutdown = shutdown.clone();
        let sweeper_task = tokio::spawn(async move { limiter.run_sweeper(sweeper_shutdown).await });

        let listener = server::bind(self.config.listen_addr).await?;
        let app = api::router(self.state.clone(), &self.config.http);
        let served = server::serve(listener, app, shutdown.clone(), self.config.shutdown_grace).await;

        // The server can also stop on its own error; take the loops down with it.
        shutdown.cancel();
        for (name, task) in [("reaper", reaper_task), ("rate limiter sweeper", sweeper_task)] {
            if let Err(e) = task.await {
                return Err(FleetError::Internal(format!("{name} task: {e}")));
            }
        }
        tracing::info!("Orchestrator stopped");
        served
    }
}
