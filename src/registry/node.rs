use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::ConfigAckStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Known, but has not declared sandbox support.
    Registered,
    Active,
    /// Not seen within the stale window.
    Inactive,
    /// Operator removed it from scheduling.
    Drained,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Registered => write!(f, "registered"),
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Inactive => write!(f, "inactive"),
            NodeStatus::Drained => write!(f, "drained"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    pub status: NodeStatus,
    /// `sha256:<hex>` of the latest capability body
    pub capability_hash: Option<String>,
    /// Whether the latest capability report declared sandbox support
    #[serde(default)]
    pub sandbox_supported: bool,
    pub config_version: Option<String>,
    /// Latest configuration acknowledgement from the node
    #[serde(default)]
    pub config_ack: Option<ConfigAckRecord>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_capability_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(slug: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            slug: slug.into(),
            name: String::new(),
            status: NodeStatus::Registered,
            capability_hash: None,
            sandbox_supported: false,
            config_version: None,
            config_ack: None,
            last_seen_at: None,
            last_capability_at: None,
            labels: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Only active nodes receive leases.
    pub fn can_lease(&self) -> bool {
        self.status == NodeStatus::Active
    }

    /// The node applied the configuration it is currently assigned.
    pub fn config_applied(&self) -> bool {
        match (&self.config_ack, &self.config_version) {
            (Some(ack), Some(version)) => {
                ack.status == ConfigAckStatus::Applied && &ack.config_version == version
            }
            _ => false,
        }
    }

    /// Leasable and running the current configuration.
    pub fn is_dispatchable(&self) -> bool {
        self.can_lease() && self.config_applied()
    }

    /// Status a node returns to once it is seen again.
    pub fn revived_status(&self) -> NodeStatus {
        if self.sandbox_supported {
            NodeStatus::Active
        } else {
            NodeStatus::Registered
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAckRecord {
    pub config_version: String,
    pub status: ConfigAckStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One capability report as received. Never mutated after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub id: Uuid,
    pub node_id: Uuid,
    pub reported_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub hash: String,
    pub body: Value,
}
