//! Wire contracts exchanged between the orchestrator and node managers.
//!
//! All bodies are JSON. `version = 1` is the only accepted protocol version.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::registry::NodeStatus;

pub const PROTOCOL_VERSION: u32 = 1;

/// Image used when a sandbox spec leaves `image` empty.
pub const DEFAULT_IMAGE: &str = "alpine:latest";

/// Network access requested for a sandbox.
///
/// Anything other than `restricted` deserializes as `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NetworkPolicy {
    #[default]
    None,
    Restricted,
}

impl From<String> for NetworkPolicy {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("restricted") {
            NetworkPolicy::Restricted
        } else {
            NetworkPolicy::None
        }
    }
}

impl From<NetworkPolicy> for String {
    fn from(value: NetworkPolicy) -> Self {
        value.to_string()
    }
}

impl fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkPolicy::None => write!(f, "none"),
            NetworkPolicy::Restricted => write!(f, "restricted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// 0 means "use the node's configured default".
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub network_policy: NetworkPolicy,
}

impl SandboxSpec {
    /// Wraps a shell snippet as `sh -c <script>` in the default image.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script.into()],
            env: BTreeMap::new(),
            timeout_seconds: 0,
            network_policy: NetworkPolicy::None,
        }
    }

    pub fn image_or_default(&self) -> &str {
        if self.image.trim().is_empty() {
            DEFAULT_IMAGE
        } else {
            &self.image
        }
    }
}

/// Job Request sent to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub version: u32,
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub sandbox: SandboxSpec,
}

impl JobRequest {
    pub fn new(task_id: Uuid, job_id: Uuid, sandbox: SandboxSpec) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            task_id,
            job_id,
            sandbox,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(FleetError::Validation(format!(
                "unsupported version {}",
                self.version
            )));
        }
        match self.sandbox.command.first() {
            None => Err(FleetError::Validation(
                "sandbox.command is required".to_string(),
            )),
            Some(program) if program.trim().is_empty() => Err(FleetError::Validation(
                "sandbox.command[0] must not be empty".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Outcome observed by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Timeout,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncated {
    pub stdout: bool,
    pub stderr: bool,
}

/// Exit code reserved for failures that never produced a process exit status.
pub const NON_PROCESS_EXIT_CODE: i32 = -1;

/// Job Response returned by a node, also stored as the job's result record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    pub version: u32,
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub truncated: Truncated,
}

impl JobResponse {
    /// Synthetic failure record for outcomes that never reached a process.
    pub fn synthetic_failure(
        task_id: Uuid,
        job_id: Uuid,
        stderr: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            task_id,
            job_id,
            status: RunStatus::Failed,
            exit_code: NON_PROCESS_EXIT_CODE,
            stdout: String::new(),
            stderr: stderr.into(),
            started_at,
            ended_at,
            truncated: Truncated::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

// -- Capability reporting --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityNode {
    pub node_slug: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compute {
    pub cpu_cores: u32,
    pub ram_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSupport {
    pub supported: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(default)]
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub version: u32,
    pub reported_at: DateTime<Utc>,
    pub node: CapabilityNode,
    pub platform: Platform,
    pub compute: Compute,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSupport>,
}

impl CapabilityReport {
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(FleetError::Validation(format!(
                "unsupported capability version {}",
                self.version
            )));
        }
        if self.node.node_slug.trim().is_empty() {
            return Err(FleetError::Validation(
                "capability.node.node_slug is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sandbox_supported(&self) -> bool {
        self.sandbox.as_ref().is_some_and(|s| s.supported)
    }
}

// -- Registration --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub psk: String,
    pub capability: CapabilityReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: Uuid,
    pub slug: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAuth {
    pub node_jwt: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigInfo {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub node: NodeSummary,
    pub auth: NodeAuth,
    pub config: NodeConfigInfo,
}

// -- Node configuration --

/// Configuration served to a registered node at `GET /v1/nodes/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfiguration {
    pub version: u32,
    pub config_version: String,
    pub issued_at: DateTime<Utc>,
    pub node_slug: String,
    /// Lease lifetime the node should pace renewals against.
    pub lease_ttl_seconds: u64,
    pub endpoints: NodeEndpoints,
}

/// Orchestrator paths, relative to the base URL the node registered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoints {
    pub capability: String,
    pub lease: String,
    pub config: String,
}

impl NodeConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(FleetError::Validation(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigAckStatus {
    Applied,
    Failed,
}

/// A node's answer to a configuration, sent to `POST /v1/nodes/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAck {
    pub version: u32,
    pub node_slug: String,
    pub config_version: String,
    #[serde(default)]
    pub ack_at: Option<DateTime<Utc>>,
    pub status: ConfigAckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConfigAck {
    pub fn applied(config: &NodeConfiguration, now: DateTime<Utc>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            node_slug: config.node_slug.clone(),
            config_version: config.config_version.clone(),
            ack_at: Some(now),
            status: ConfigAckStatus::Applied,
            error: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(FleetError::Validation(format!(
                "unsupported config ack version {}",
                self.version
            )));
        }
        if self.config_version.trim().is_empty() {
            return Err(FleetError::Validation("config_version is required".to_string()));
        }
        Ok(())
    }
}

// -- Leasing --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub lease_id: String,
    pub lease_expires_at: DateTime<Utc>,
    pub job: JobRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    pub lease_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewResponse {
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub lease_id: String,
    pub result: JobResponse,
}
