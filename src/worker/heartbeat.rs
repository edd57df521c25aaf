use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::client::OrchestratorClient;
use super::executor::SandboxExecutor;
use crate::config::NodeManagerConfig;
use crate::protocol::{
    CapabilityNode, CapabilityReport, Compute, Platform, SandboxSupport, PROTOCOL_VERSION,
};

/// Describes this node: identity, platform, compute, and sandbox support.
pub struct CapabilityCollector {
    config: NodeManagerConfig,
    executor: Arc<SandboxExecutor>,
}

impl CapabilityCollector {
    pub fn new(config: NodeManagerConfig, executor: Arc<SandboxExecutor>) -> Self {
        Self { config, executor }
    }

    pub async fn report(&self, now: DateTime<Utc>) -> CapabilityReport {
        let ready = match self.executor.readiness().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Sandbox runtime unavailable, reporting unsupported");
                false
            }
        };
        let sandbox = self.executor.config();
        let mut features = vec![
            format!("runtime:{}", sandbox.runtime),
            "network:none".to_string(),
            "timeout".to_string(),
            "output_cap".to_string(),
        ];
        if sandbox.restricted_network.is_some() {
            features.push("network:restricted".to_string());
        }

        CapabilityReport {
            version: PROTOCOL_VERSION,
            reported_at: now,
            node: CapabilityNode {
                node_slug: self.config.node_slug.clone(),
                name: self.config.node_name.clone(),
                labels: self.config.labels.clone(),
            },
            platform: Platform {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
                distro: os_release_name(),
            },
            compute: Compute {
                cpu_cores: std::thread::available_parallelism()
                    .map(|n| n.get() as u32)
                    .unwrap_or(1),
                ram_mb: if self.config.ram_mb > 0 {
                    self.config.ram_mb
                } else {
                    total_memory_mb().unwrap_or(0)
                },
            },
            sandbox: Some(SandboxSupport {
                supported: ready,
                features,
                max_concurrency: self.config.max_concurrency,
            }),
        }
    }
}

/// `PRETTY_NAME` from /etc/os-release, when present.
fn os_release_name() -> Option<String> {
    let text = std::fs::read_to_string("/etc/os-release").ok()?;
    text.lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim_matches('"').to_string())
}

fn total_memory_mb() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let kb: u64 = text
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))?
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kb / 1024)
}

/// Periodically re-sends the capability report so the orchestrator sees
/// the node as alive and notices changes.
pub struct CapabilityReporter {
    client: Arc<OrchestratorClient>,
    collector: Arc<CapabilityCollector>,
    interval: Duration,
}

impl CapabilityReporter {
    pub fn new(client: Arc<OrchestratorClient>, collector: Arc<CapabilityCollector>, interval: Duration) -> Self {
        Self {
            client,
            collector,
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; registration already reported.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.collector.report(Utc::now()).await;
                    if let Err(e) = self.client.report_capability(report).await {
                        tracing::warn!(error = %e, "Capability report failed");
                    }
                }
            }
        }
    }
}
