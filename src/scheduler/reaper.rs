use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Job, JobStatus, Scheduler};
use crate::audit::{AuditEntry, AuditKind};
use crate::error::{FleetError, Result};
use crate::protocol::JobResponse;
use crate::registry::Registry;
use crate::store::{Txn, Versioned};

/// Stderr recorded on a job that expired on its final attempt.
pub const MAX_ATTEMPTS_REASON: &str = "lease_expired_max_attempts";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    /// running -> lease_expired transitions made by this pass
    pub expired: usize,
    pub requeued: usize,
    /// Jobs failed for exhausting their attempts
    pub failed: usize,
    /// Candidates another writer changed first
    pub skipped: usize,
    pub nodes_marked_inactive: usize,
}

impl Scheduler {
    /// One reclamation pass over the lease indices. Safe to run concurrently
    /// from several processes: each transition is a conditional commit, and a
    /// lost commit is skipped rather than retried.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        let mut candidates = self.store.expired_lease_job_ids(now).await?;
        candidates.extend(self.store.lease_expired_job_ids().await?);
        for id in candidates {
            // Indices are hints; the job record decides.
            let Some(job) = self.store.job(id).await? else {
                continue;
            };
            let outcome = match job.value.status {
                JobStatus::Running
                    if job.value.lease_expires_at.is_some_and(|at| at <= now) =>
                {
                    self.reap_one(job, now, &mut report).await
                }
                // Left behind by a reaper that stopped between expiry and requeue.
                JobStatus::LeaseExpired => self.requeue(job, now, &mut report).await,
                _ => Ok(()),
            };
            match outcome {
                Ok(()) => {}
                Err(e @ FleetError::StoreUnavailable(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "Reaper skipped a job");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    async fn reap_one(
        &self,
        current: Versioned<Job>,
        now: DateTime<Utc>,
        report: &mut ReapReport,
    ) -> Result<()> {
        let job = &current.value;
        let detail = json!({ "attempt": job.attempt(), "node_id": job.node_id });

        if job.attempt() >= self.config.max_attempts {
            let mut failed = job.clone();
            let started_at = failed.started_at.unwrap_or(now);
            let result = JobResponse::synthetic_failure(
                job.task_id,
                job.id,
                MAX_ATTEMPTS_REASON,
                started_at,
                now,
            );
            failed.finish(JobStatus::Failed, Some(result), now)?;

            let mut txn = Txn::new();
            txn.update_job(&current, &failed)?;
            txn.audit(&AuditEntry::new(
                AuditKind::LeaseExpired,
                job.id.to_string(),
                detail,
                now,
            ))?;
            txn.audit(&AuditEntry::new(
                AuditKind::JobTerminal,
                job.id.to_string(),
                json!({ "status": JobStatus::Failed, "reason": MAX_ATTEMPTS_REASON }),
                now,
            ))?;
            self.stage_roll_up(&mut txn, &failed, now).await?;

            if self.store.commit(txn).await? {
                tracing::warn!(job_id = %job.id, attempt = job.attempt(), "Lease expired on final attempt, job failed");
                report.failed += 1;
            } else {
                report.skipped += 1;
            }
            return Ok(());
        }

        let mut expired = job.clone();
        expired.expire_lease(now)?;
        let mut txn = Txn::new();
        txn.update_job(&current, &expired)?;
        txn.audit(&AuditEntry::new(
            AuditKind::LeaseExpired,
            job.id.to_string(),
            detail,
            now,
        ))?;
        if !self.store.commit(txn).await? {
            report.skipped += 1;
            return Ok(());
        }
        tracing::info!(job_id = %job.id, node_id = ?job.node_id, attempt = job.attempt(), "Lease expired");
        report.expired += 1;

        match self.store.job(job.id).await? {
            Some(latest) if latest.value.status == JobStatus::LeaseExpired => {
                self.requeue(latest, now, report).await
            }
            _ => Ok(()),
        }
    }

    async fn requeue(
        &self,
        current: Versioned<Job>,
        now: DateTime<Utc>,
        report: &mut ReapReport,
    ) -> Result<()> {
        let mut job = current.value.clone();
        job.requeue(now)?;
        let mut txn = Txn::new();
        txn.update_job(&current, &job)?;
        if self.store.commit(txn).await? {
            tracing::info!(job_id = %job.id, attempt = job.attempt(), "Job requeued");
            report.requeued += 1;
        } else {
            report.skipped += 1;
        }
        Ok(())
    }
}

/// Background loop reclaiming expired leases and marking silent nodes inactive.
pub struct Reaper {
    scheduler: Scheduler,
    registry: Registry,
    interval: Duration,
}

impl Reaper {
    pub fn new(scheduler: Scheduler, registry: Registry) -> Self {
        let interval = scheduler.config().reaper_interval;
        Self {
            scheduler,
            registry,
            interval,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = self.scheduler.reap_expired(now).await?;
        report.nodes_marked_inactive = self.registry.mark_stale_nodes(now).await?;
        Ok(report)
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reaper stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report != ReapReport::default() => {
                            tracing::info!(?report, "Reaper pass");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Reaper pass failed"),
                    }
                }
            }
        }
    }
}
