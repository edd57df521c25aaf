//! Node manager: runs jobs in container sandboxes.
//!
//! # Components
//!
//! - [`SandboxExecutor`]: runs one Job Request under a deadline and output cap
//! - [`agent`]: the Node Agent HTTP endpoint (`POST /v1/worker/jobs:run`)
//! - [`OrchestratorClient`]: registration, leasing, renewal, completion
//! - [`JobPoller`]: lease -> execute -> complete loop
//! - [`heartbeat`]: capability probing and periodic reports
//!
//! # Execution Flow
//!
//! 1. [`NodeManager::run`] registers with the orchestrator using the PSK,
//!    then fetches and acknowledges its configuration
//! 2. [`JobPoller`] leases a job and renews the lease while it runs
//! 3. [`SandboxExecutor::execute`] runs the container and captures output
//! 4. The result is posted back; a 409 means the lease was lost and the
//!    result is dropped

pub mod agent;
pub mod client;
pub mod executor;
pub mod heartbeat;
pub mod poller;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeManagerConfig;
use crate::error::{FleetError, Result};
use crate::protocol::{ConfigAck, NodeConfiguration};
use crate::server;

pub use agent::AgentState;
pub use client::OrchestratorClient;
pub use executor::SandboxExecutor;
pub use heartbeat::{CapabilityCollector, CapabilityReporter};
pub use poller::JobPoller;

/// Composition root for the node manager process.
pub struct NodeManager {
    config: NodeManagerConfig,
    executor: Arc<SandboxExecutor>,
    client: Arc<OrchestratorClient>,
    collector: Arc<CapabilityCollector>,
}

impl NodeManager {
    pub fn new(config: NodeManagerConfig) -> Result<Self> {
        let executor = Arc::new(SandboxExecutor::new(config.sandbox.clone()));
        let client = Arc::new(OrchestratorClient::new(
            config.orchestrator_url.clone(),
            config.registration_psk.clone(),
            config.client_timeout,
        )?);
        let collector = Arc::new(CapabilityCollector::new(config.clone(), executor.clone()));
        Ok(Self {
            config,
            executor,
            client,
            collector,
        })
    }

    /// Registers, then fetches and acknowledges the node configuration.
    ///
    /// Transient registration failures are retried `register_attempts` times;
    /// an invalid PSK or an exhausted budget is returned as the error.
    pub async fn bootstrap(&self, shutdown: &CancellationToken) -> Result<NodeConfiguration> {
        let attempts = self.config.register_attempts.max(1);
        let mut attempt = 1;
        loop {
            let report = self.collector.report(Utc::now()).await;
            match self.client.register(report).await {
                Ok(_) => break,
                Err(e) if !e.is_retryable() || attempt >= attempts => {
                    tracing::error!(error = %e, attempt, "Registration failed");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        retry_in_ms = self.config.register_retry.as_millis() as u64,
                        "Registration failed, retrying"
                    );
                }
            }
            attempt += 1;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(FleetError::Internal("shutdown before registration".to_string()));
                }
                _ = tokio::time::sleep(self.config.register_retry) => {}
            }
        }

        let config = self.client.fetch_config().await?;
        self.client
            .ack_config(&ConfigAck::applied(&config, Utc::now()))
            .await?;
        tracing::info!(
            config_version = %config.config_version,
            lease_ttl_secs = config.lease_ttl_seconds,
            "Configuration applied"
        );
        Ok(config)
    }

    /// Serves the Node Agent and, once registered, polls for leased work.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = server::bind(self.config.listen_addr).await?;
        let app = agent::router(
            AgentState {
                executor: self.executor.clone(),
                worker_token: Arc::from(self.config.worker_api_token.as_str()),
                shutdown: shutdown.clone(),
                write_timeout: self.config.http.write_timeout,
            },
            &self.config.http,
        );
        let http = tokio::spawn(server::serve(
            listener,
            app,
            shutdown.clone(),
            self.config.shutdown_grace,
        ));

        let background = async {
            self.bootstrap(&shutdown).await?;
            let poller = JobPoller::new(
                self.client.clone(),
                self.executor.clone(),
                self.config.poll_interval,
                self.config.max_concurrency as usize,
            );
            let reporter = CapabilityReporter::new(
                self.client.clone(),
                self.collector.clone(),
                self.config.capability_interval,
            );
            tokio::join!(poller.run(shutdown.clone()), reporter.run(shutdown.clone()));
            Ok::<(), FleetError>(())
        };

        let outcome = background.await;
        if let Err(ref e) = outcome {
            tracing::error!(error = %e, "Node manager stopping");
            shutdown.cancel();
        }
        match http.await {
            Ok(served) => served?,
            Err(e) => return Err(FleetError::Internal(format!("http server task: {e}"))),
        }
        outcome
    }
}
