use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Append-only audit record. Written in the same commit as the change it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    /// Job, node, or principal the entry is about.
    pub subject: String,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    LeaseGranted,
    LeaseExpired,
    JobTerminal,
    TaskTerminal,
    NodeRegistered,
    NodeDrained,
    CapabilityChanged,
    ConfigAcknowledged,
    AuthFailure,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, subject: impl Into<String>, detail: Value, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at,
            kind,
            subject: subject.into(),
            detail,
        }
    }
}
