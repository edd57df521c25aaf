use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::client::OrchestratorClient;
use super::executor::SandboxExecutor;
use crate::error::FleetError;
use crate::protocol::{JobResponse, LeaseGrant};

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const COMPLETE_ATTEMPTS: u32 = 3;
const MIN_RENEW_EVERY: Duration = Duration::from_secs(1);

/// Pulls leased jobs from the orchestrator and runs them, up to
/// `max_concurrency` at a time.
pub struct JobPoller {
    client: Arc<OrchestratorClient>,
    executor: Arc<SandboxExecutor>,
    poll_interval: Duration,
    max_concurrency: usize,
}

impl JobPoller {
    pub fn new(
        client: Arc<OrchestratorClient>,
        executor: Arc<SandboxExecutor>,
        poll_interval: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            client,
            executor,
            poll_interval,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Runs until `shutdown` is cancelled, then waits for in-flight jobs to
    /// wind down. Jobs cut short by shutdown are not reported; their leases
    /// expire and the orchestrator requeues them.
    pub async fn run(&self, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut running = JoinSet::new();
        let mut backoff = self.poll_interval;

        loop {
            while running.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let wait = match self.client.lease().await {
                Ok(Some(grant)) => {
                    backoff = self.poll_interval;
                    let client = self.client.clone();
                    let executor = self.executor.clone();
                    let cancel = shutdown.child_token();
                    running.spawn(async move {
                        run_leased(client, executor, grant, cancel).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {
                    backoff = self.poll_interval;
                    self.poll_interval
                }
                Err(e) => {
                    tracing::warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Lease request failed");
                    let wait = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    wait
                }
            };
            drop(permit);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if !running.is_empty() {
            tracing::info!(jobs = running.len(), "Waiting for running jobs to stop");
        }
        while running.join_next().await.is_some() {}
        tracing::info!("Job poller stopped");
    }
}

/// Time between renewals: a third of the remaining lease.
fn renew_every(lease_expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (lease_expires_at - now)
        .to_std()
        .map(|left| left / 3)
        .unwrap_or(MIN_RENEW_EVERY)
        .max(MIN_RENEW_EVERY)
}

async fn run_leased(
    client: Arc<OrchestratorClient>,
    executor: Arc<SandboxExecutor>,
    grant: LeaseGrant,
    cancel: CancellationToken,
) {
    let job = grant.job;
    let lease_id = grant.lease_id;
    tracing::info!(job_id = %job.job_id, task_id = %job.task_id, lease_expires_at = %grant.lease_expires_at, "Leased job");

    if let Err(e) = job.validate() {
        let now = Utc::now();
        let response = JobResponse::synthetic_failure(job.task_id, job.job_id, e.to_string(), now, now);
        report(&client, &lease_id, response).await;
        return;
    }

    let done = CancellationToken::new();
    let renewer = {
        let client = client.clone();
        let lease_id = lease_id.clone();
        let job_id = job.job_id;
        let cancel = cancel.clone();
        let done = done.clone();
        let mut every = renew_every(grant.lease_expires_at, Utc::now());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                match client.renew(job_id, &lease_id).await {
                    Ok(expires) => every = renew_every(expires, Utc::now()),
                    Err(FleetError::LeaseLost { reason, .. }) => {
                        tracing::warn!(job_id = %job_id, reason = %reason, "Lease lost, stopping job");
                        cancel.cancel();
                        break;
                    }
                    Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Lease renewal failed"),
                }
            }
        })
    };

    let response = executor.execute(&job, cancel.clone()).await;
    done.cancel();
    let _ = renewer.await;

    if cancel.is_cancelled() {
        tracing::info!(job_id = %job.job_id, "Job interrupted, result not reported");
        return;
    }
    report(&client, &lease_id, response).await;
}

async fn report(client: &OrchestratorClient, lease_id: &str, response: JobResponse) {
    let job_id = response.job_id;
    let mut delay = Duration::from_millis(500);
    for attempt in 1..=COMPLETE_ATTEMPTS {
        match client.complete(lease_id, response.clone()).await {
            Ok(()) => {
                tracing::info!(job_id = %job_id, status = %response.status, "Result reported");
                return;
            }
            Err(FleetError::LeaseLost { reason, .. }) => {
                tracing::warn!(job_id = %job_id, reason = %reason, "Result discarded, lease no longer held");
                return;
            }
            Err(e) if e.is_retryable() && attempt < COMPLETE_ATTEMPTS => {
                tracing::warn!(job_id = %job_id, error = %e, attempt, "Result report failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Result report failed");
                return;
            }
        }
    }
}
