use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::protocol::{JobResponse, SandboxSpec};
use crate::scheduler::{Job, JobStatus, Scheduler};
use crate::store::{Store, Txn};

const SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub created_by: Option<Uuid>,
    pub status: TaskStatus,
    pub prompt: String,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(created_by: Option<Uuid>, prompt: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_by,
            status: TaskStatus::Pending,
            prompt: prompt.into(),
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Task status implied by its jobs.
///
/// Any non-terminal job keeps the task `running` (a task that has never had a
/// job leased stays `pending`). Once every job is terminal: any failure makes
/// it `failed`, all completed makes it `completed`, anything else `cancelled`.
pub fn roll_up(current: TaskStatus, jobs: impl IntoIterator<Item = JobStatus>) -> TaskStatus {
    let mut seen = false;
    let mut open = false;
    let mut started = false;
    let mut failed = false;
    let mut all_completed = true;

    for status in jobs {
        seen = true;
        match status {
            JobStatus::Queued => open = true,
            JobStatus::Running | JobStatus::LeaseExpired => {
                open = true;
                started = true;
            }
            JobStatus::Failed => failed = true,
            JobStatus::Completed | JobStatus::Cancelled => {}
        }
        if status != JobStatus::Completed {
            all_completed = false;
        }
    }

    if !seen {
        current
    } else if open {
        if started || current == TaskStatus::Running {
            TaskStatus::Running
        } else {
            current
        }
    } else if failed {
        TaskStatus::Failed
    } else if all_completed {
        TaskStatus::Completed
    } else {
        TaskStatus::Cancelled
    }
}

/// First non-empty output line of a successful job, else `job <status>`.
pub fn summarize(status: JobStatus, result: Option<&JobResponse>) -> String {
    if status == JobStatus::Completed {
        if let Some(r) = result {
            let line = r
                .stdout
                .lines()
                .chain(r.stderr.lines())
                .map(str::trim)
                .find(|l| !l.is_empty());
            if let Some(line) = line {
                return line.chars().take(SUMMARY_MAX_CHARS).collect();
            }
        }
    }
    format!("job {status}")
}

/// Task plus its jobs in creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: Task,
    pub jobs: Vec<Job>,
}

#[derive(Clone)]
pub struct TaskService {
    store: Store,
    scheduler: Scheduler,
}

impl TaskService {
    pub fn new(store: Store, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    /// Persists a pending task and its single queued job in one commit.
    pub async fn create_task(&self, created_by: Option<Uuid>, prompt: &str) -> Result<Task> {
        if prompt.trim().is_empty() {
            return Err(FleetError::Validation("prompt is required".to_string()));
        }

        let now = Utc::now();
        let task = Task::new(created_by, prompt, now);
        let job = Job::new(task.id, SandboxSpec::shell(prompt), now);

        let mut txn = Txn::new();
        txn.insert_task(&task)?.insert_job(&job)?;
        if !self.store.commit(txn).await? {
            return Err(FleetError::Internal(format!(
                "task {} collided with an existing record",
                task.id
            )));
        }

        tracing::info!(task_id = %task.id, job_id = %job.id, "Task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.store
            .task(id)
            .await?
            .map(|v| v.value)
            .ok_or_else(|| FleetError::NotFound(format!("task {id}")))
    }

    pub async fn get_task_result(&self, id: Uuid) -> Result<TaskResult> {
        let task = self.get_task(id).await?;
        let jobs = self
            .store
            .task_jobs(id)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        Ok(TaskResult { task, jobs })
    }

    pub async fn cancel_task(&self, id: Uuid) -> Result<Task> {
        self.scheduler.cancel_task(id, Utc::now()).await
    }
}
