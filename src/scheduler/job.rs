use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::protocol::{JobRequest, JobResponse, RunStatus, SandboxSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    LeaseExpired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The only legal edges of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, LeaseExpired)
                | (LeaseExpired, Queued)
        )
    }

    /// Terminal job status recorded for a node-observed outcome.
    pub fn from_run_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => JobStatus::Completed,
            RunStatus::Failed | RunStatus::Timeout => JobStatus::Failed,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::LeaseExpired => write!(f, "lease_expired"),
        }
    }
}

/// Opaque payload carried to the node, plus the delivery attempt counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub sandbox: SandboxSpec,
    /// 1 on first delivery, incremented on every lease-expiry requeue.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: Uuid,
    pub node_id: Option<Uuid>,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub result: Option<JobResponse>,
    pub lease_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(task_id: Uuid, sandbox: SandboxSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            node_id: None,
            status: JobStatus::Queued,
            payload: JobPayload {
                sandbox,
                attempt: 1,
            },
            result: None,
            lease_id: None,
            lease_expires_at: None,
            started_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.payload.attempt
    }

    /// True iff the job is running under exactly this lease.
    pub fn holds_lease(&self, lease_id: &str) -> bool {
        self.status == JobStatus::Running && self.lease_id.as_deref() == Some(lease_id)
    }

    /// Job Request handed to the leasing node.
    pub fn to_request(&self) -> JobRequest {
        JobRequest::new(self.task_id, self.id, self.payload.sandbox.clone())
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FleetError::InvariantViolation(format!(
                "job {}: illegal transition {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn grant_lease(
        &mut self,
        node_id: Uuid,
        lease_id: String,
        now: DateTime<Utc>,
        ttl: TimeDelta,
    ) -> Result<()> {
        self.transition(JobStatus::Running, now)?;
        self.node_id = Some(node_id);
        self.lease_id = Some(lease_id);
        self.lease_expires_at = Some(now + ttl);
        self.started_at = Some(now);
        Ok(())
    }

    /// Moves a running job to its terminal state with the given result.
    pub fn finish(
        &mut self,
        status: JobStatus,
        result: Option<JobResponse>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(FleetError::InvariantViolation(format!(
                "job {}: {} is not a terminal status",
                self.id, status
            )));
        }
        self.transition(status, now)?;
        self.result = result;
        self.lease_id = None;
        self.lease_expires_at = None;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Reclaims a running job whose lease lapsed. `started_at` is kept.
    pub fn expire_lease(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::LeaseExpired, now)?;
        self.lease_id = None;
        self.lease_expires_at = None;
        Ok(())
    }

    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Queued, now)?;
        self.node_id = None;
        self.started_at = None;
        self.payload.attempt += 1;
        Ok(())
    }

    /// Checks the per-status field invariants. Called on every store write.
    pub fn check_invariants(&self) -> Result<()> {
        let violation = |what: &str| {
            Err(FleetError::InvariantViolation(format!(
                "job {} ({}): {}",
                self.id, self.status, what
            )))
        };
        match self.status {
            JobStatus::Queued => {
                if self.node_id.is_some()
                    || self.lease_id.is_some()
                    || self.lease_expires_at.is_some()
                    || self.started_at.is_some()
                    || self.ended_at.is_some()
                    || self.result.is_some()
                {
                    return violation("queued job carries assignment, lease, or result");
                }
            }
            JobStatus::Running => {
                if self.node_id.is_none()
                    || self.lease_id.is_none()
                    || self.lease_expires_at.is_none()
                    || self.started_at.is_none()
                {
                    return violation("running job is missing its lease");
                }
                if self.ended_at.is_some() {
                    return violation("running job has ended_at");
                }
            }
            JobStatus::LeaseExpired => {
                if self.lease_id.is_some() || self.lease_expires_at.is_some() {
                    return violation("expired job still holds a lease");
                }
                if self.ended_at.is_some() {
                    return violation("expired job has ended_at");
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                if self.ended_at.is_none() {
                    return violation("terminal job has no ended_at");
                }
                if self.lease_id.is_some() || self.lease_expires_at.is_some() {
                    return violation("terminal job still holds a lease");
                }
            }
        }
        if self.payload.attempt == 0 {
            return violation("attempt counter starts at 1");
        }
        Ok(())
    }
}
