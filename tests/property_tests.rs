use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sandbox_fleet::config::SandboxConfig;

use sandbox_fleet::protocol::{
    CapabilityNode, CapabilityReport, Compute, JobRequest, Platform, SandboxSpec, SandboxSupport,
};
use sandbox_fleet::registry::{content_hash, fingerprint};
use sandbox_fleet::scheduler::{Job, JobStatus};
use sandbox_fleet::tasks::{roll_up, TaskStatus};
use sandbox_fleet::worker::SandboxExecutor;

fn job_status() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
        Just(JobStatus::Queued),
        Just(JobStatus::Running),
        Just(JobStatus::Completed),
        Just(JobStatus::Failed),
        Just(JobStatus::Cancelled),
        Just(JobStatus::LeaseExpired),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    Grant,
    Complete,
    Fail,
    Cancel,
    Expire,
    Requeue,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Grant),
        Just(Op::Complete),
        Just(Op::Fail),
        Just(Op::Cancel),
        Just(Op::Expire),
        Just(Op::Requeue),
    ]
}

fn report(slug: String, cores: u32, ram: u64, labels: Vec<String>, at: DateTime<Utc>) -> CapabilityReport {
    CapabilityReport {
        version: 1,
        reported_at: at,
        node: CapabilityNode {
            node_slug: slug,
            name: String::new(),
            labels,
        },
        platform: Platform {
            os: "linux".to_string(),
            arch: "aarch64".to_string(),
            distro: None,
        },
        compute: Compute {
            cpu_cores: cores,
            ram_mb: ram,
        },
        sandbox: Some(SandboxSupport {
            supported: true,
            features: vec!["timeout".to_string()],
            max_concurrency: 1,
        }),
    }
}

/// Rebuilds every object with its keys inserted in reverse order.
fn reversed(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().rev() {
                out.insert(k.clone(), reversed(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(reversed).collect()),
        other => other.clone(),
    }
}

proptest! {
    #[test]
    fn test_task_is_terminal_only_when_every_job_is(statuses in prop::collection::vec(job_status(), 1..8)) {
        let next = roll_up(TaskStatus::Running, statuses.clone());
        let all_terminal = statuses.iter().all(|s| s.is_terminal());
        prop_assert_eq!(next.is_terminal(), all_terminal);
        if all_terminal {
            let expected = if statuses.contains(&JobStatus::Failed) {
                TaskStatus::Failed
            } else if statuses.iter().all(|s| *s == JobStatus::Completed) {
                TaskStatus::Completed
            } else {
                TaskStatus::Cancelled
            };
            prop_assert_eq!(next, expected);
        }
    }

    #[test]
    fn test_job_invariants_hold_across_any_operation_sequence(ops in prop::collection::vec(op(), 0..24)) {
        let now = Utc::now();
        let mut job = Job::new(Uuid::new_v4(), SandboxSpec::shell("true"), now);
        let mut leases = 0u32;

        for op in ops {
            let before = job.clone();
            let applied = match op {
                Op::Grant => {
                    leases += 1;
                    job.grant_lease(Uuid::new_v4(), format!("lease-{leases}"), now, TimeDelta::seconds(30))
                }
                Op::Complete => job.finish(JobStatus::Completed, None, now),
                Op::Fail => job.finish(JobStatus::Failed, None, now),
                Op::Cancel => job.finish(JobStatus::Cancelled, None, now),
                Op::Expire => job.expire_lease(now),
                Op::Requeue => job.requeue(now),
            };
            match applied {
                Ok(()) => {
                    prop_assert!(before.status.can_transition_to(job.status));
                    prop_assert!(job.check_invariants().is_ok());
                }
                Err(_) => prop_assert_eq!(job.status, before.status),
            }
            prop_assert!(job.attempt() >= before.attempt());
            if before.status.is_terminal() {
                prop_assert_eq!(job.status, before.status);
            }
        }
    }

    #[test]
    fn test_capability_hash_ignores_timestamp_and_key_order(
        slug in "[a-z][a-z0-9-]{0,15}",
        cores in 1u32..256,
        ram in 1u64..1_000_000,
        labels in prop::collection::vec("[a-z]{1,8}", 0..4),
        skew in 1i64..1_000_000,
    ) {
        let at = Utc::now();
        let first = report(slug.clone(), cores, ram, labels.clone(), at);
        let later = report(slug, cores, ram, labels, at + TimeDelta::seconds(skew));

        let (body, hash) = fingerprint(&first).unwrap();
        let (_, later_hash) = fingerprint(&later).unwrap();
        prop_assert_eq!(&hash, &later_hash);
        prop_assert_eq!(content_hash(&reversed(&body)), hash.clone());
        prop_assert!(hash.starts_with("sha256:"));
        prop_assert_eq!(hash.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_capability_hash_tracks_content(cores in 1u32..256, bump in 1u32..64) {
        let at = Utc::now();
        let (_, a) = fingerprint(&report("n".into(), cores, 1024, vec![], at)).unwrap();
        let (_, b) = fingerprint(&report("n".into(), cores + bump, 1024, vec![], at)).unwrap();
        prop_assert_ne!(a, b);
    }
}

proptest! {
    // Each case spawns a process; keep the count low.
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_output_is_capped_at_the_configured_bytes(written in 0usize..4096, cap in 1usize..2048) {
        let executor = SandboxExecutor::new(SandboxConfig {
            max_output_bytes: cap,
            ..SandboxConfig::direct()
        });
        let request = JobRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            SandboxSpec::shell(&format!("head -c {written} /dev/zero | tr '\\0' x")),
        );
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = runtime.block_on(executor.execute(&request, CancellationToken::new()));

        prop_assert_eq!(result.stdout.len(), written.min(cap));
        prop_assert!(result.stdout.bytes().all(|b| b == b'x'));
        prop_assert_eq!(result.truncated.stdout, written > cap);
        prop_assert!(!result.truncated.stderr);
    }
}
