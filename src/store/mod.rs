//! Typed persistence over a [`StorageBackend`].
//!
//! Key layout:
//!
//! | Prefix | Value |
//! |---|---|
//! | `users/{id}`, `user_handles/{handle}` | user record, handle index |
//! | `tasks/{id}` | task |
//! | `jobs/{id}` | job |
//! | `task_jobs/{task_id}/{created}-{job_id}` | per-task job index |
//! | `queue/{created}/{job_id}` | FIFO index of queued jobs |
//! | `nodes/{id}`, `node_slugs/{slug}` | node record, slug index |
//! | `node_capabilities/{node_id}/{received}-{id}` | capability history |
//! | `audit/{at}-{id}` | audit log |
//!
//! Every job write goes through [`Txn::insert_job`] or [`Txn::update_job`],
//! which reject illegal transitions and broken field invariants before
//! anything reaches the backend.

pub mod backend;
pub mod memory;
pub mod redb_store;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::auth::User;
use crate::error::{FleetError, Result};
use crate::registry::{CapabilitySnapshot, Node};
use crate::scheduler::{Job, JobStatus};
use crate::tasks::Task;

pub use backend::{Batch, Expect, StorageBackend, StorageError, VersionedRecord};
pub use memory::MemoryBackend;
pub use redb_store::RedbBackend;

/// A decoded record and the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Zero-padded nanoseconds since the epoch, so key order is time order.
fn ts_key(at: DateTime<Utc>) -> String {
    let nanos = at.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0);
    format!("{nanos:020}")
}

fn job_key(id: Uuid) -> String {
    format!("jobs/{id}")
}

fn queue_key(job: &Job) -> String {
    format!("queue/{}/{}", ts_key(job.created_at), job.id)
}

/// Index entry for a running job, ordered by lease expiry.
fn lease_key(job: &Job) -> Option<String> {
    match (job.status, job.lease_expires_at) {
        (JobStatus::Running, Some(at)) => Some(format!("leases/{}/{}", ts_key(at), job.id)),
        _ => None,
    }
}

fn lease_expired_key(job: &Job) -> Option<String> {
    (job.status == JobStatus::LeaseExpired).then(|| format!("lease_expired/{}", job.id))
}

fn task_key(id: Uuid) -> String {
    format!("tasks/{id}")
}

fn node_key(id: Uuid) -> String {
    format!("nodes/{id}")
}

fn node_slug_key(slug: &str) -> String {
    format!("node_slugs/{slug}")
}

fn user_key(id: Uuid) -> String {
    format!("users/{id}")
}

fn user_handle_key(handle: &str) -> String {
    format!("user_handles/{handle}")
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| FleetError::Internal(format!("encode record: {e}")))
}

fn decode<T: DeserializeOwned>(record: VersionedRecord) -> Result<Versioned<T>> {
    let value = serde_json::from_slice(&record.data).map_err(|e| {
        FleetError::InvariantViolation(format!("undecodable record {}: {e}", record.key))
    })?;
    Ok(Versioned {
        value,
        version: record.version,
    })
}

/// Id stored after the last `/` (and after the last `-` separated timestamp) of an index key.
fn trailing_id(key: &str) -> Option<Uuid> {
    let tail = key.rsplit('/').next()?;
    let id = match tail.split_once('-') {
        Some((ts, rest)) if ts.len() == 20 && ts.bytes().all(|b| b.is_ascii_digit()) => rest,
        _ => tail,
    };
    Uuid::parse_str(id).ok()
}

/// Pending writes for one atomic commit.
#[derive(Debug, Default)]
pub struct Txn {
    batch: Batch,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn insert_job(&mut self, job: &Job) -> Result<&mut Self> {
        if job.status != JobStatus::Queued {
            return Err(FleetError::InvariantViolation(format!(
                "job {} must be created queued, not {}",
                job.id, job.status
            )));
        }
        job.check_invariants()?;
        self.batch
            .put(job_key(job.id), encode(job)?, Expect::Absent)
            .put(
                format!("task_jobs/{}/{}-{}", job.task_id, ts_key(job.created_at), job.id),
                encode(&job.id)?,
                Expect::Absent,
            )
            .put(queue_key(job), encode(&job.id)?, Expect::Absent);
        Ok(self)
    }

    /// Conditional job write: applies only if the job is still at `before.version`.
    pub fn update_job(&mut self, before: &Versioned<Job>, after: &Job) -> Result<&mut Self> {
        let prev = &before.value;
        if prev.id != after.id || prev.task_id != after.task_id {
            return Err(FleetError::InvariantViolation(format!(
                "job {} rewritten as {}",
                prev.id, after.id
            )));
        }
        let same_lease_renewal = prev.status == JobStatus::Running
            && after.status == JobStatus::Running
            && prev.lease_id == after.lease_id
            && prev.node_id == after.node_id;
        if !same_lease_renewal && !prev.status.can_transition_to(after.status) {
            return Err(FleetError::InvariantViolation(format!(
                "job {}: illegal transition {} -> {}",
                prev.id, prev.status, after.status
            )));
        }
        after.check_invariants()?;

        self.batch
            .put(job_key(after.id), encode(after)?, Expect::Version(before.version));
        if prev.status == JobStatus::Queued && after.status != JobStatus::Queued {
            self.batch.delete(queue_key(prev), Expect::Any);
        }
        if prev.status != JobStatus::Queued && after.status == JobStatus::Queued {
            self.batch.put(queue_key(after), encode(&after.id)?, Expect::Absent);
        }
        for (old, new) in [
            (lease_key(prev), lease_key(after)),
            (lease_expired_key(prev), lease_expired_key(after)),
        ] {
            if old == new {
                continue;
            }
            if let Some(key) = old {
                self.batch.delete(key, Expect::Any);
            }
            if let Some(key) = new {
                self.batch.put(key, encode(&after.id)?, Expect::Any);
            }
        }
        Ok(self)
    }

    /// Makes the commit depend on a job it does not write.
    pub fn guard_job(&mut self, job: &Versioned<Job>) -> &mut Self {
        self.batch
            .check(job_key(job.value.id), Expect::Version(job.version));
        self
    }

    pub fn insert_task(&mut self, task: &Task) -> Result<&mut Self> {
        self.batch
            .put(task_key(task.id), encode(task)?, Expect::Absent);
        Ok(self)
    }

    /// A terminal task is never rewritten with a different status.
    pub fn update_task(&mut self, before: &Versioned<Task>, after: &Task) -> Result<&mut Self> {
        if before.value.status.is_terminal() && before.value.status != after.status {
            return Err(FleetError::InvariantViolation(format!(
                "task {} is already {}",
                after.id, before.value.status
            )));
        }
        self.batch.put(
            task_key(after.id),
            encode(after)?,
            Expect::Version(before.version),
        );
        Ok(self)
    }

    pub fn insert_node(&mut self, node: &Node) -> Result<&mut Self> {
        self.batch
            .put(node_key(node.id), encode(node)?, Expect::Absent)
            .put(node_slug_key(&node.slug), encode(&node.id)?, Expect::Absent);
        Ok(self)
    }

    pub fn update_node(&mut self, before: &Versioned<Node>, after: &Node) -> Result<&mut Self> {
        if before.value.id != after.id || before.value.slug != after.slug {
            return Err(FleetError::InvariantViolation(format!(
                "node {} identity changed",
                before.value.id
            )));
        }
        self.batch.put(
            node_key(after.id),
            encode(after)?,
            Expect::Version(before.version),
        );
        Ok(self)
    }

    pub fn append_capability(&mut self, snapshot: &CapabilitySnapshot) -> Result<&mut Self> {
        self.batch.put(
            format!(
                "node_capabilities/{}/{}-{}",
                snapshot.node_id,
                ts_key(snapshot.received_at),
                snapshot.id
            ),
            encode(snapshot)?,
            Expect::Absent,
        );
        Ok(self)
    }

    pub fn insert_user(&mut self, user: &User) -> Result<&mut Self> {
        self.batch
            .put(user_key(user.id), encode(user)?, Expect::Absent)
            .put(user_handle_key(&user.handle), encode(&user.id)?, Expect::Absent);
        Ok(self)
    }

    pub fn audit(&mut self, entry: &AuditEntry) -> Result<&mut Self> {
        self.batch.put(
            format!("audit/{}-{}", ts_key(entry.at), entry.id),
            encode(entry)?,
            Expect::Absent,
        );
        Ok(self)
    }
}

/// Shared, cloneable handle to the store.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
    timeout: Duration,
}

impl Store {
    pub fn new(backend: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Duration::from_secs(5))
    }

    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let backend = RedbBackend::open(path)
            .map_err(|e| FleetError::StoreUnavailable(e.to_string()))?;
        Ok(Self::new(Arc::new(backend), timeout))
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, StorageError>>,
    ) -> Result<std::result::Result<T, String>> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(Ok(value)),
            Ok(Err(StorageError::Conflict { key })) => Ok(Err(key)),
            Ok(Err(StorageError::Backend(msg))) => Err(FleetError::StoreUnavailable(msg)),
            Err(_) => Err(FleetError::StoreUnavailable(format!(
                "store call exceeded {:?}",
                self.timeout
            ))),
        }
    }

    async fn get_record(&self, key: &str) -> Result<Option<VersionedRecord>> {
        self.call(self.backend.get(key))
            .await?
            .map_err(|key| FleetError::Internal(format!("conflict on read of {key}")))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<VersionedRecord>> {
        self.call(self.backend.scan_prefix(prefix))
            .await?
            .map_err(|key| FleetError::Internal(format!("conflict on scan at {key}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        self.get_record(key).await?.map(decode).transpose()
    }

    async fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<Versioned<T>>> {
        self.scan(prefix).await?.into_iter().map(decode).collect()
    }

    async fn id_index(&self, key: &str) -> Result<Option<Uuid>> {
        Ok(self.get_json::<Uuid>(key).await?.map(|v| v.value))
    }

    /// Applies the transaction atomically. `Ok(false)` means a precondition
    /// failed and nothing was written.
    pub async fn commit(&self, txn: Txn) -> Result<bool> {
        if txn.is_empty() {
            return Ok(true);
        }
        match self.call(self.backend.commit(txn.batch)).await? {
            Ok(()) => Ok(true),
            Err(key) => {
                tracing::debug!(key, "Conditional commit lost");
                Ok(false)
            }
        }
    }

    // -- jobs --

    pub async fn job(&self, id: Uuid) -> Result<Option<Versioned<Job>>> {
        self.get_json(&job_key(id)).await
    }

    pub async fn jobs(&self) -> Result<Vec<Versioned<Job>>> {
        self.scan_json("jobs/").await
    }

    /// Queued job ids, oldest first, ties broken by id.
    pub async fn queued_job_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .scan("queue/")
            .await?
            .iter()
            .filter_map(|r| trailing_id(&r.key))
            .collect())
    }

    /// Running jobs whose lease expired at or before `now`, soonest expiry first.
    pub async fn expired_lease_job_ids(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        // `~` sorts after every character of a uuid.
        let end = format!("leases/{}/~", ts_key(now));
        let index = self
            .call(self.backend.scan_range("leases/", &end))
            .await?
            .map_err(|key| FleetError::Internal(format!("conflict on scan at {key}")))?;
        Ok(index.iter().filter_map(|r| trailing_id(&r.key)).collect())
    }

    /// Jobs parked in `lease_expired`, waiting to be requeued.
    pub async fn lease_expired_job_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .scan("lease_expired/")
            .await?
            .iter()
            .filter_map(|r| trailing_id(&r.key))
            .collect())
    }

    /// Jobs of a task in creation order.
    pub async fn task_jobs(&self, task_id: Uuid) -> Result<Vec<Versioned<Job>>> {
        let index = self.scan(&format!("task_jobs/{task_id}/")).await?;
        let mut jobs = Vec::with_capacity(index.len());
        for entry in index {
            let Some(id) = trailing_id(&entry.key) else {
                continue;
            };
            if let Some(job) = self.job(id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| {
            (a.value.created_at, a.value.id).cmp(&(b.value.created_at, b.value.id))
        });
        Ok(jobs)
    }

    // -- tasks --

    pub async fn task(&self, id: Uuid) -> Result<Option<Versioned<Task>>> {
        self.get_json(&task_key(id)).await
    }

    // -- nodes --

    pub async fn node(&self, id: Uuid) -> Result<Option<Versioned<Node>>> {
        self.get_json(&node_key(id)).await
    }

    pub async fn node_by_slug(&self, slug: &str) -> Result<Option<Versioned<Node>>> {
        match self.id_index(&node_slug_key(slug)).await? {
            Some(id) => self.node(id).await,
            None => Ok(None),
        }
    }

    pub async fn nodes(&self) -> Result<Vec<Versioned<Node>>> {
        self.scan_json("nodes/").await
    }

    /// Capability history of a node, oldest first.
    pub async fn capability_history(&self, node_id: Uuid) -> Result<Vec<CapabilitySnapshot>> {
        Ok(self
            .scan_json::<CapabilitySnapshot>(&format!("node_capabilities/{node_id}/"))
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    // -- users --

    pub async fn user(&self, id: Uuid) -> Result<Option<Versioned<User>>> {
        self.get_json(&user_key(id)).await
    }

    pub async fn user_by_handle(&self, handle: &str) -> Result<Option<Versioned<User>>> {
        match self.id_index(&user_handle_key(handle)).await? {
            Some(id) => self.user(id).await,
            None => Ok(None),
        }
    }

    // -- audit --

    pub async fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        Ok(self
            .scan_json::<AuditEntry>("audit/")
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Writes a standalone audit entry, logging instead of failing.
    pub async fn record_audit(&self, entry: AuditEntry) {
        let mut txn = Txn::new();
        let written = match txn.audit(&entry) {
            Ok(_) => self.commit(txn).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(kind = ?entry.kind, error = %e, "Failed to write audit entry");
        }
    }
}
