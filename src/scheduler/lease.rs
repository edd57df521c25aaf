use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use uuid::Uuid;

use super::{Job, JobStatus, Scheduler, MAX_COMMIT_RETRIES};
use crate::audit::{AuditEntry, AuditKind};
use crate::error::{FleetError, Result};
use crate::protocol::{JobResponse, LeaseGrant, PROTOCOL_VERSION};
use crate::store::{Txn, Versioned};
use crate::tasks::TaskStatus;

/// Queued jobs tried per pass before re-reading the queue.
const LEASE_CANDIDATES_PER_PASS: usize = 16;

/// What a node sent back for a leased job.
#[derive(Debug, Clone)]
pub enum Completion {
    Reported(JobResponse),
    /// Body could not be understood; the job fails with this text in stderr.
    Malformed(String),
}

fn new_lease_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn lease_lost(job: &Job, node_id: Uuid) -> FleetError {
    let reason = if job.status != JobStatus::Running {
        format!("job is {}", job.status)
    } else if job.node_id != Some(node_id) {
        "job is leased to another node".to_string()
    } else {
        "lease superseded".to_string()
    };
    FleetError::LeaseLost {
        job_id: job.id,
        reason,
    }
}

impl Scheduler {
    /// Leases the oldest queued job to `node_id`.
    ///
    /// `Ok(None)` means nothing is available for this node right now,
    /// including when the node is not eligible for work.
    pub async fn lease_next(
        &self,
        node_id: Uuid,
        now: DateTime<Utc>,
        ttl: TimeDelta,
    ) -> Result<Option<LeaseGrant>> {
        let node = self
            .store
            .node(node_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("node {node_id}")))?;
        if !node.value.can_lease() {
            tracing::debug!(node_id = %node_id, status = %node.value.status, "Node not eligible for leases");
            return Ok(None);
        }

        for _ in 0..MAX_COMMIT_RETRIES {
            let candidates = self.store.queued_job_ids().await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            let mut contended = false;
            for job_id in candidates.into_iter().take(LEASE_CANDIDATES_PER_PASS) {
                let Some(current) = self.store.job(job_id).await? else {
                    continue;
                };
                if current.value.status != JobStatus::Queued {
                    contended = true;
                    continue;
                }
                if let Some(grant) = self.try_grant(&current, node_id, now, ttl).await? {
                    return Ok(Some(grant));
                }
                tracing::debug!(job_id = %job_id, node_id = %node_id, "Lost lease race, trying next job");
                contended = true;
            }

            if !contended {
                return Ok(None);
            }
        }

        tracing::warn!(node_id = %node_id, "Lease retries exhausted under contention");
        Ok(None)
    }

    async fn try_grant(
        &self,
        current: &Versioned<Job>,
        node_id: Uuid,
        now: DateTime<Utc>,
        ttl: TimeDelta,
    ) -> Result<Option<LeaseGrant>> {
        let mut job = current.value.clone();
        let lease_id = new_lease_id();
        job.grant_lease(node_id, lease_id.clone(), now, ttl)?;

        let mut txn = Txn::new();
        txn.update_job(current, &job)?;
        if let Some(task) = self.store.task(job.task_id).await? {
            if task.value.status == TaskStatus::Pending {
                let mut running = task.value.clone();
                running.status = TaskStatus::Running;
                running.updated_at = now;
                txn.update_task(&task, &running)?;
            }
        }
        txn.audit(&AuditEntry::new(
            AuditKind::LeaseGranted,
            job.id.to_string(),
            json!({ "node_id": node_id, "attempt": job.attempt() }),
            now,
        ))?;

        if !self.store.commit(txn).await? {
            return Ok(None);
        }

        let lease_expires_at = now + ttl;
        tracing::info!(
            job_id = %job.id,
            task_id = %job.task_id,
            node_id = %node_id,
            attempt = job.attempt(),
            lease_expires_at = %lease_expires_at,
            "Lease granted"
        );
        Ok(Some(LeaseGrant {
            lease_id,
            lease_expires_at,
            job: job.to_request(),
        }))
    }

    /// Extends a lease still held by `node_id`. Returns the new expiry.
    pub async fn renew_lease(
        &self,
        job_id: Uuid,
        lease_id: &str,
        node_id: Uuid,
        now: DateTime<Utc>,
        ttl: TimeDelta,
    ) -> Result<DateTime<Utc>> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let current = self
                .store
                .job(job_id)
                .await?
                .ok_or_else(|| FleetError::NotFound(format!("job {job_id}")))?;
            if !current.value.holds_lease(lease_id) || current.value.node_id != Some(node_id) {
                return Err(lease_lost(&current.value, node_id));
            }

            let mut job = current.value.clone();
            let expires = now + ttl;
            job.lease_expires_at = Some(expires);
            job.updated_at = now;

            let mut txn = Txn::new();
            txn.update_job(&current, &job)?;
            if self.store.commit(txn).await? {
                tracing::debug!(job_id = %job_id, lease_expires_at = %expires, "Lease renewed");
                return Ok(expires);
            }
        }
        Err(FleetError::LeaseConflict(job_id))
    }

    /// Records a node's outcome for a leased job and rolls up the task.
    ///
    /// Fails with [`FleetError::LeaseLost`] when the lease was reaped,
    /// cancelled, or superseded; the node's work is then discarded.
    pub async fn complete_lease(
        &self,
        job_id: Uuid,
        lease_id: &str,
        node_id: Uuid,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let current = self
                .store
                .job(job_id)
                .await?
                .ok_or_else(|| FleetError::NotFound(format!("job {job_id}")))?;
            if !current.value.holds_lease(lease_id) || current.value.node_id != Some(node_id) {
                tracing::warn!(job_id = %job_id, node_id = %node_id, status = %current.value.status, "Completion rejected");
                return Err(lease_lost(&current.value, node_id));
            }

            let mut job = current.value.clone();
            let started_at = job.started_at.unwrap_or(now);
            let (status, result) = match checked_response(&job, &completion) {
                Ok(response) => (JobStatus::from_run_status(response.status), response),
                Err(problem) => {
                    tracing::warn!(job_id = %job_id, error = %problem, "Malformed completion");
                    (
                        JobStatus::Failed,
                        JobResponse::synthetic_failure(job.task_id, job.id, problem, started_at, now),
                    )
                }
            };
            let run_status = result.status;
            let exit_code = result.exit_code;
            job.finish(status, Some(result), now)?;

            let mut txn = Txn::new();
            txn.update_job(&current, &job)?;
            txn.audit(&AuditEntry::new(
                AuditKind::JobTerminal,
                job.id.to_string(),
                json!({
                    "status": status,
                    "run_status": run_status,
                    "exit_code": exit_code,
                    "node_id": node_id,
                }),
                now,
            ))?;
            let task = self.stage_roll_up(&mut txn, &job, now).await?;

            if self.store.commit(txn).await? {
                tracing::info!(
                    job_id = %job_id,
                    status = %status,
                    exit_code,
                    task_status = ?task.as_ref().map(|t| t.status),
                    "Job completed"
                );
                return Ok(job);
            }
            tracing::debug!(job_id = %job_id, "Completion commit lost, re-reading");
        }
        Err(FleetError::LeaseConflict(job_id))
    }
}

/// The node's response if it is well-formed for this job.
fn checked_response(job: &Job, completion: &Completion) -> std::result::Result<JobResponse, String> {
    let response = match completion {
        Completion::Reported(r) => r,
        Completion::Malformed(msg) => return Err(format!("malformed completion: {msg}")),
    };
    if response.version != PROTOCOL_VERSION {
        return Err(format!(
            "malformed completion: unsupported version {}",
            response.version
        ));
    }
    if response.job_id != job.id || response.task_id != job.task_id {
        return Err(format!(
            "malformed completion: result is for job {} of task {}",
            response.job_id, response.task_id
        ));
    }
    Ok(response.clone())
}
