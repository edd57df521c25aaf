//! Job lifecycle, leasing, and lease reclamation.
//!
//! There is no in-process queue. Every decision is a conditional commit
//! against the store, so any number of orchestrator instances (and their
//! reapers) can run side by side.
//!
//! - [`lease`]: `lease_next`, `renew_lease`, `complete_lease`
//! - [`reaper`]: expired lease reclamation and node liveness sweep

pub mod job;
pub mod lease;
pub mod reaper;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditKind};
use crate::config::SchedulerConfig;
use crate::error::{FleetError, Result};
use crate::store::{Store, Txn};
use crate::tasks::{roll_up, summarize, Task};

pub use job::{Job, JobPayload, JobStatus};
pub use lease::Completion;
pub use reaper::{ReapReport, Reaper};

/// Bound on re-reading and retrying after a lost conditional commit.
pub(crate) const MAX_COMMIT_RETRIES: usize = 8;

#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Store, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn lease_ttl(&self) -> TimeDelta {
        self.config.lease_ttl
    }

    /// Stages the parent task update implied by `changed` (already staged in
    /// `txn`). Sibling jobs are guarded so two concurrent terminal
    /// transitions cannot both miss each other.
    pub(crate) async fn stage_roll_up(
        &self,
        txn: &mut Txn,
        changed: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let Some(task) = self.store.task(changed.task_id).await? else {
            return Err(FleetError::InvariantViolation(format!(
                "job {} has no task {}",
                changed.id, changed.task_id
            )));
        };
        if task.value.status.is_terminal() {
            return Ok(None);
        }

        let mut statuses = Vec::new();
        for sibling in self.store.task_jobs(changed.task_id).await? {
            if sibling.value.id == changed.id {
                statuses.push(changed.status);
            } else {
                statuses.push(sibling.value.status);
                txn.guard_job(&sibling);
            }
        }

        let next = roll_up(task.value.status, statuses);
        if next == task.value.status {
            return Ok(None);
        }

        let mut updated = task.value.clone();
        updated.status = next;
        updated.updated_at = now;
        if next.is_terminal() {
            updated.summary = Some(summarize(changed.status, changed.result.as_ref()));
            txn.audit(&AuditEntry::new(
                AuditKind::TaskTerminal,
                updated.id.to_string(),
                json!({ "status": next }),
                now,
            ))?;
        }
        txn.update_task(&task, &updated)?;
        Ok(Some(updated))
    }

    /// Cancels every open job of a task and rolls the task up.
    ///
    /// Cancelling an already-cancelled task returns it unchanged.
    pub async fn cancel_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<Task> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let task = self
                .store
                .task(task_id)
                .await?
                .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
            if task.value.status == crate::tasks::TaskStatus::Cancelled {
                return Ok(task.value);
            }
            if task.value.status.is_terminal() {
                return Err(FleetError::Validation(format!(
                    "task {task_id} is already {}",
                    task.value.status
                )));
            }

            let jobs = self.store.task_jobs(task_id).await?;
            if jobs.iter().any(|j| j.value.status == JobStatus::LeaseExpired) {
                // Reaper is between expiry and requeue; read again.
                tokio::task::yield_now().await;
                continue;
            }

            let mut txn = Txn::new();
            let mut statuses = Vec::with_capacity(jobs.len());
            let mut last_cancelled = None;
            for job in &jobs {
                if job.value.status.is_terminal() {
                    txn.guard_job(job);
                    statuses.push(job.value.status);
                    continue;
                }
                let mut cancelled = job.value.clone();
                cancelled.finish(JobStatus::Cancelled, None, now)?;
                txn.update_job(job, &cancelled)?;
                txn.audit(&AuditEntry::new(
                    AuditKind::JobTerminal,
                    cancelled.id.to_string(),
                    json!({ "status": JobStatus::Cancelled, "reason": "task_cancelled" }),
                    now,
                ))?;
                statuses.push(JobStatus::Cancelled);
                last_cancelled = Some(cancelled);
            }

            let mut updated = task.value.clone();
            updated.status = roll_up(task.value.status, statuses);
            if !updated.status.is_terminal() {
                updated.status = crate::tasks::TaskStatus::Cancelled;
            }
            updated.updated_at = now;
            updated.summary = Some(match &last_cancelled {
                Some(job) => summarize(job.status, None),
                None => format!("task {}", updated.status),
            });
            txn.update_task(&task, &updated)?;
            txn.audit(&AuditEntry::new(
                AuditKind::TaskTerminal,
                task_id.to_string(),
                json!({ "status": updated.status }),
                now,
            ))?;

            if self.store.commit(txn).await? {
                tracing::info!(task_id = %task_id, status = %updated.status, "Task cancelled");
                return Ok(updated);
            }
        }
        Err(FleetError::StoreUnavailable(format!(
            "task {task_id} kept changing during cancellation"
        )))
    }
}
