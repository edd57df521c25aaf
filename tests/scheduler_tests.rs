
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use sandbox_fleet::audit::AuditKind;
use sandbox_fleet::error::FleetError;
use sandbox_fleet::protocol::{RunStatus, SandboxSpec};
use sandbox_fleet::scheduler::{Completion, Job, JobStatus};
use sandbox_fleet::store::Txn;
use sandbox_fleet::tasks::{Task, TaskStatus};
use test_harness::{capability, response_for, Fleet, TEST_PSK};

#[tokio::test]
async fn test_task_runs_to_completion() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;

    let task = fleet.tasks.create_task(None, "echo hello").await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let grant = fleet.lease(node).await.expect("a queued job");
    assert_eq!(grant.job.task_id, task.id);
    assert_eq!(grant.job.sandbox.command, vec!["sh", "-c", "echo hello"]);
    assert_eq!(
        fleet.tasks.get_task(task.id).await.unwrap().status,
        TaskStatus::Running
    );

    let response = response_for(&grant, RunStatus::Completed, 0, "hello\n");
    let job = fleet
        .scheduler
        .complete_lease(
            grant.job.job_id,
            &grant.lease_id,
            node,
            Completion::Reported(response),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.lease_id.is_none());
    assert!(job.ended_at.is_some());

    let result = fleet.tasks.get_task_result(task.id).await.unwrap();
    assert_eq!(result.task.status, TaskStatus::Completed);
    assert_eq!(result.task.summary.as_deref(), Some("hello"));
    assert_eq!(result.jobs.len(), 1);
    assert_eq!(result.jobs[0].result.as_ref().unwrap().stdout, "hello\n");

    let kinds: Vec<AuditKind> = fleet
        .store
        .audit_log()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&AuditKind::LeaseGranted));
    assert!(kinds.contains(&AuditKind::JobTerminal));
    assert!(kinds.contains(&AuditKind::TaskTerminal));
}

#[tokio::test]
async fn test_empty_queue_returns_nothing() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    assert!(fleet.lease(node).await.is_none());
}

#[tokio::test]
async fn test_jobs_are_leased_oldest_first() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;

    let first = fleet.tasks.create_task(None, "echo 1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = fleet.tasks.create_task(None, "echo 2").await.unwrap();

    assert_eq!(fleet.lease(node).await.unwrap().job.task_id, first.id);
    assert_eq!(fleet.lease(node).await.unwrap().job.task_id, second.id);
    assert!(fleet.lease(node).await.is_none());
}

#[tokio::test]
async fn test_fifo_holds_below_a_microsecond() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    let base = Utc::now();

    for _ in 0..20 {
        let older_at = base + TimeDelta::nanoseconds(100);
        let newer_at = base + TimeDelta::nanoseconds(900);
        let older_task = Task::new(None, "echo older", older_at);
        let newer_task = Task::new(None, "echo newer", newer_at);
        let older = Job::new(older_task.id, SandboxSpec::shell("echo older"), older_at);
        let newer = Job::new(newer_task.id, SandboxSpec::shell("echo newer"), newer_at);

        let mut txn = Txn::new();
        txn.insert_task(&newer_task)
            .unwrap()
            .insert_job(&newer)
            .unwrap()
            .insert_task(&older_task)
            .unwrap()
            .insert_job(&older)
            .unwrap();
        assert!(fleet.store.commit(txn).await.unwrap());

        assert_eq!(fleet.lease(node).await.unwrap().job.job_id, older.id);
        assert_eq!(fleet.lease(node).await.unwrap().job.job_id, newer.id);
    }
}

#[tokio::test]
async fn test_ineligible_nodes_get_no_lease() {
    let fleet = Fleet::new();
    fleet.tasks.create_task(None, "echo hi").await.unwrap();

    let unsupported = fleet
        .registry
        .register(TEST_PSK, capability("no-sandbox", false), Utc::now())
        .await
        .unwrap();
    assert!(fleet.lease(unsupported.response.node.id).await.is_none());

    let drained = fleet.active_node("drained").await;
    fleet.registry.drain(drained, Utc::now()).await.unwrap();
    assert!(fleet.lease(drained).await.is_none());

    let unknown = fleet
        .scheduler
        .lease_next(Uuid::new_v4(), Utc::now(), fleet.scheduler.lease_ttl())
        .await;
    assert!(matches!(unknown, Err(FleetError::NotFound(_))));

    // The job is still there for an eligible node.
    let active = fleet.active_node("active").await;
    assert!(fleet.lease(active).await.is_some());
}

#[tokio::test]
async fn test_concurrent_leases_are_exclusive() {
    let fleet = Fleet::new();
    fleet.tasks.create_task(None, "echo once").await.unwrap();

    let mut nodes = Vec::new();
    for i in 0..8 {
        nodes.push(fleet.active_node(&format!("node-{i}")).await);
    }

    let mut handles = Vec::new();
    for node in nodes {
        let scheduler = fleet.scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler
                .lease_next(node, Utc::now(), scheduler.lease_ttl())
                .await
                .unwrap()
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}

#[tokio::test]
async fn test_many_jobs_spread_without_duplicates() {
    let fleet = Fleet::new();
    for i in 0..10 {
        fleet
            .tasks
            .create_task(None, &format!("echo {i}"))
            .await
            .unwrap();
    }
    let a = fleet.active_node("node-a").await;
    let b = fleet.active_node("node-b").await;

    let mut handles = Vec::new();
    for node in [a, b, a, b, a, b, a, b, a, b, a, b] {
        let scheduler = fleet.scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler
                .lease_next(node, Utc::now(), scheduler.lease_ttl())
                .await
                .unwrap()
        }));
    }

    let mut job_ids = Vec::new();
    for handle in handles {
        if let Some(grant) = handle.await.unwrap() {
            job_ids.push(grant.job.job_id);
        }
    }
    let total = job_ids.len();
    job_ids.sort();
    job_ids.dedup();
    assert_eq!(job_ids.len(), total, "a job was leased twice");
    assert!(total <= 10);
}

#[tokio::test]
async fn test_wrong_lease_or_node_is_rejected() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    let other = fleet.active_node("node-b").await;
    fleet.tasks.create_task(None, "echo hi").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();
    let ttl = fleet.scheduler.lease_ttl();

    let renewed = fleet
        .scheduler
        .renew_lease(grant.job.job_id, "not-the-lease", node, Utc::now(), ttl)
        .await;
    assert!(matches!(renewed, Err(FleetError::LeaseLost { .. })));

    let renewed = fleet
        .scheduler
        .renew_lease(grant.job.job_id, &grant.lease_id, other, Utc::now(), ttl)
        .await;
    assert!(matches!(renewed, Err(FleetError::LeaseLost { .. })));

    let response = response_for(&grant, RunStatus::Completed, 0, "");
    let completed = fleet
        .scheduler
        .complete_lease(
            grant.job.job_id,
            "not-the-lease",
            node,
            Completion::Reported(response),
            Utc::now(),
        )
        .await;
    assert!(matches!(completed, Err(FleetError::LeaseLost { .. })));

    let job = fleet.store.job(grant.job.job_id).await.unwrap().unwrap();
    assert_eq!(job.value.status, JobStatus::Running);
}

#[tokio::test]
async fn test_renew_extends_the_lease() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    fleet.tasks.create_task(None, "sleep 1").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();

    let later = test_harness::later(30);
    let expires = fleet
        .scheduler
        .renew_lease(
            grant.job.job_id,
            &grant.lease_id,
            node,
            later,
            fleet.scheduler.lease_ttl(),
        )
        .await
        .unwrap();
    assert!(expires > grant.lease_expires_at);

    let job = fleet.store.job(grant.job.job_id).await.unwrap().unwrap();
    assert_eq!(job.value.lease_expires_at, Some(expires));
}

#[tokio::test]
async fn test_malformed_completion_fails_the_job() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    let task = fleet.tasks.create_task(None, "echo hi").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();

    let job = fleet
        .scheduler
        .complete_lease(
            grant.job.job_id,
            &grant.lease_id,
            node,
            Completion::Malformed("missing field `status`".to_string()),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let result = job.result.unwrap();
    assert_eq!(result.exit_code, -1);
    assert!(result.stderr.contains("missing field `status`"));

    let task = fleet.tasks.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.summary.as_deref(), Some("job failed"));
}

#[tokio::test]
async fn test_result_for_another_job_is_malformed() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    fleet.tasks.create_task(None, "echo hi").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();

    let mut response = response_for(&grant, RunStatus::Completed, 0, "hi");
    response.job_id = Uuid::new_v4();
    let job = fleet
        .scheduler
        .complete_lease(
            grant.job.job_id,
            &grant.lease_id,
            node,
            Completion::Reported(response),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.unwrap().stderr.starts_with("malformed completion"));
}

#[tokio::test]
async fn test_timeout_is_recorded_as_failure() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    let task = fleet.tasks.create_task(None, "sleep 600").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();

    let response = response_for(&grant, RunStatus::Timeout, -1, "");
    let job = fleet
        .scheduler
        .complete_lease(
            grant.job.job_id,
            &grant.lease_id,
            node,
            Completion::Reported(response),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result.unwrap().status, RunStatus::Timeout);
    assert_eq!(
        fleet.tasks.get_task(task.id).await.unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn test_cancelled_task_rejects_late_completion() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    let task = fleet.tasks.create_task(None, "sleep 10").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();

    let cancelled = fleet.tasks.cancel_task(task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let response = response_for(&grant, RunStatus::Completed, 0, "done");
    let late = fleet
        .scheduler
        .complete_lease(
            grant.job.job_id,
            &grant.lease_id,
            node,
            Completion::Reported(response),
            Utc::now(),
        )
        .await;
    assert!(matches!(late, Err(FleetError::LeaseLost { .. })));

    let result = fleet.tasks.get_task_result(task.id).await.unwrap();
    assert_eq!(result.task.status, TaskStatus::Cancelled);
    assert_eq!(result.jobs[0].status, JobStatus::Cancelled);
    assert!(result.jobs[0].result.is_none());
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_final() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    let task = fleet.tasks.create_task(None, "echo hi").await.unwrap();

    let first = fleet.tasks.cancel_task(task.id).await.unwrap();
    let second = fleet.tasks.cancel_task(task.id).await.unwrap();
    assert_eq!(first.status, TaskStatus::Cancelled);
    assert_eq!(second, first);

    // The cancelled job never reaches a node.
    assert!(fleet.lease(node).await.is_none());

    let missing = fleet.tasks.cancel_task(Uuid::new_v4()).await;
    assert!(matches!(missing, Err(FleetError::NotFound(_))));
}

#[tokio::test]
async fn test_completed_task_cannot_be_cancelled() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    let task = fleet.tasks.create_task(None, "true").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();
    fleet
        .scheduler
        .complete_lease(
            grant.job.job_id,
            &grant.lease_id,
            node,
            Completion::Reported(response_for(&grant, RunStatus::Completed, 0, "")),
            Utc::now(),
        )
        .await
        .unwrap();

    let cancel = fleet.tasks.cancel_task(task.id).await;
    assert!(matches!(cancel, Err(FleetError::Validation(_))));
}

#[tokio::test]
async fn test_blank_prompt_is_rejected() {
    let fleet = Fleet::new();
    let created = fleet.tasks.create_task(None, "   ").await;
    assert!(matches!(created, Err(FleetError::Validation(_))));
}
