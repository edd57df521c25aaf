
use chrono::Utc;

use sandbox_fleet::audit::AuditKind;
use sandbox_fleet::error::FleetError;
use sandbox_fleet::protocol::RunStatus;
use sandbox_fleet::registry::NodeStatus;
use sandbox_fleet::scheduler::reaper::MAX_ATTEMPTS_REASON;
use sandbox_fleet::scheduler::{Completion, JobStatus, ReapReport, Reaper};
use sandbox_fleet::store::Txn;
use sandbox_fleet::tasks::TaskStatus;
use test_harness::{later, response_for, Fleet};

#[tokio::test]
async fn test_expired_lease_is_requeued_and_late_result_discarded() {
    let fleet = Fleet::new();
    let first = fleet.active_node("node-a").await;
    let second = fleet.active_node("node-b").await;
    let task = fleet.tasks.create_task(None, "echo hi").await.unwrap();

    let stale = fleet.lease(first).await.unwrap();

    // Nothing has expired yet.
    let report = fleet.scheduler.reap_expired(Utc::now()).await.unwrap();
    assert_eq!(report, ReapReport::default());

    let report = fleet.scheduler.reap_expired(later(120)).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.requeued, 1);

    let job = fleet.store.job(stale.job.job_id).await.unwrap().unwrap().value;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt(), 2);
    assert!(job.node_id.is_none());
    assert_eq!(
        fleet.tasks.get_task(task.id).await.unwrap().status,
        TaskStatus::Running
    );

    let fresh = fleet.lease(second).await.unwrap();
    assert_eq!(fresh.job.job_id, stale.job.job_id);
    assert_ne!(fresh.lease_id, stale.lease_id);

    let late = fleet
        .scheduler
        .complete_lease(
            stale.job.job_id,
            &stale.lease_id,
            first,
            Completion::Reported(response_for(&stale, RunStatus::Completed, 0, "late")),
            Utc::now(),
        )
        .await;
    assert!(matches!(late, Err(FleetError::LeaseLost { .. })));

    let job = fleet
        .scheduler
        .complete_lease(
            fresh.job.job_id,
            &fresh.lease_id,
            second,
            Completion::Reported(response_for(&fresh, RunStatus::Completed, 0, "on time")),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.node_id, Some(second));
    assert_eq!(job.result.unwrap().stdout, "on time");

    let expiries = fleet
        .store
        .audit_log()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditKind::LeaseExpired)
        .count();
    assert_eq!(expiries, 1);
}

#[tokio::test]
async fn test_final_attempt_expiry_fails_the_job() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    let task = fleet.tasks.create_task(None, "sleep 999").await.unwrap();

    for attempt in 1..=3 {
        let grant = fleet.lease(node).await.expect("job should be queued");
        let job = fleet.store.job(grant.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.value.attempt(), attempt);
        fleet.scheduler.reap_expired(later(120)).await.unwrap();
    }

    let result = fleet.tasks.get_task_result(task.id).await.unwrap();
    let job = &result.jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt(), 3);
    let record = job.result.as_ref().unwrap();
    assert_eq!(record.stderr, MAX_ATTEMPTS_REASON);
    assert_eq!(record.exit_code, -1);
    assert_eq!(result.task.status, TaskStatus::Failed);

    assert!(fleet.lease(node).await.is_none());
}

#[tokio::test]
async fn test_concurrent_reapers_do_not_double_requeue() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    fleet.tasks.create_task(None, "echo hi").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();

    let now = later(120);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let scheduler = fleet.scheduler.clone();
        handles.push(tokio::spawn(
            async move { scheduler.reap_expired(now).await.unwrap() },
        ));
    }
    let mut requeued = 0;
    for handle in handles {
        requeued += handle.await.unwrap().requeued;
    }
    assert_eq!(requeued, 1);

    let job = fleet.store.job(grant.job.job_id).await.unwrap().unwrap().value;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt(), 2);
}

#[tokio::test]
async fn test_repeated_passes_at_the_same_instant_change_nothing() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    for i in 0..3 {
        fleet.tasks.create_task(None, &format!("echo {i}")).await.unwrap();
    }
    for _ in 0..2 {
        fleet.lease(node).await.unwrap();
    }

    let now = later(120);
    let first = fleet.scheduler.reap_expired(now).await.unwrap();
    assert_eq!(first.requeued, 2);
    let settled = fleet.store.jobs().await.unwrap();

    for _ in 0..3 {
        let again = fleet.scheduler.reap_expired(now).await.unwrap();
        assert_eq!(again, ReapReport::default());
        assert_eq!(fleet.store.jobs().await.unwrap(), settled);
    }
}

#[tokio::test]
async fn test_stranded_lease_expired_job_is_requeued() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    fleet.tasks.create_task(None, "echo hi").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();

    // A reaper that stopped right after expiring the lease.
    let current = fleet.store.job(grant.job.job_id).await.unwrap().unwrap();
    let mut expired = current.value.clone();
    expired.expire_lease(later(120)).unwrap();
    let mut txn = Txn::new();
    txn.update_job(&current, &expired).unwrap();
    assert!(fleet.store.commit(txn).await.unwrap());
    assert!(fleet.store.expired_lease_job_ids(later(600)).await.unwrap().is_empty());
    assert_eq!(
        fleet.store.lease_expired_job_ids().await.unwrap(),
        vec![grant.job.job_id]
    );

    let report = fleet.scheduler.reap_expired(Utc::now()).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.expired, 0);
    let job = fleet.store.job(grant.job.job_id).await.unwrap().unwrap().value;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt(), 2);
    assert!(fleet.store.lease_expired_job_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_finished_jobs_leave_the_lease_index() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    fleet.tasks.create_task(None, "echo a").await.unwrap();
    fleet.tasks.create_task(None, "echo b").await.unwrap();
    let done = fleet.lease(node).await.unwrap();
    let running = fleet.lease(node).await.unwrap();

    let mut indexed = fleet.store.expired_lease_job_ids(later(120)).await.unwrap();
    indexed.sort();
    let mut expected = vec![done.job.job_id, running.job.job_id];
    expected.sort();
    assert_eq!(indexed, expected);
    // Not expired yet at the current time.
    assert!(fleet.store.expired_lease_job_ids(Utc::now()).await.unwrap().is_empty());

    fleet
        .scheduler
        .complete_lease(
            done.job.job_id,
            &done.lease_id,
            node,
            Completion::Reported(response_for(&done, RunStatus::Completed, 0, "a\n")),
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(
        fleet.store.expired_lease_job_ids(later(120)).await.unwrap(),
        vec![running.job.job_id]
    );
    let report = fleet.scheduler.reap_expired(later(120)).await.unwrap();
    assert_eq!(report.expired, 1);
    let done = fleet.store.job(done.job.job_id).await.unwrap().unwrap().value;
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_renewed_lease_survives_the_reaper() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    fleet.tasks.create_task(None, "sleep 90").await.unwrap();
    let grant = fleet.lease(node).await.unwrap();

    fleet
        .scheduler
        .renew_lease(
            grant.job.job_id,
            &grant.lease_id,
            node,
            later(50),
            fleet.scheduler.lease_ttl(),
        )
        .await
        .unwrap();

    let report = fleet.scheduler.reap_expired(later(90)).await.unwrap();
    assert_eq!(report.expired, 0);
    let job = fleet.store.job(grant.job.job_id).await.unwrap().unwrap().value;
    assert!(job.holds_lease(&grant.lease_id));
}

#[tokio::test]
async fn test_silent_node_goes_inactive_and_touch_revives_it() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    fleet.tasks.create_task(None, "echo hi").await.unwrap();

    let reaper = Reaper::new(fleet.scheduler.clone(), fleet.registry.clone());
    let report = reaper.tick(later(600)).await.unwrap();
    assert_eq!(report.nodes_marked_inactive, 1);

    let stored = fleet.store.node(node).await.unwrap().unwrap().value;
    assert_eq!(stored.status, NodeStatus::Inactive);
    assert!(fleet.lease(node).await.is_none());

    let revived = fleet.registry.touch(node, later(601)).await.unwrap();
    assert_eq!(revived.status, NodeStatus::Active);
    assert!(fleet.lease(node).await.is_some());
}

#[tokio::test]
async fn test_drained_node_is_not_marked_inactive() {
    let fleet = Fleet::new();
    let node = fleet.active_node("node-a").await;
    fleet.registry.drain(node, Utc::now()).await.unwrap();

    let marked = fleet.registry.mark_stale_nodes(later(600)).await.unwrap();
    assert_eq!(marked, 0);
    let stored = fleet.store.node(node).await.unwrap().unwrap().value;
    assert_eq!(stored.status, NodeStatus::Drained);
}

#[tokio::test]
async fn test_reaper_loop_stops_on_shutdown() {
    let fleet = Fleet::new();
    let reaper = Reaper::new(fleet.scheduler.clone(), fleet.registry.clone());
    let shutdown = tokio_util::sync::CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { reaper.run(token).await });

    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("reaper should stop")
        .unwrap();
}
