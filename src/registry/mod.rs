//! Node registration, capability reconciliation, and liveness.

pub mod capability;
pub mod node;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditKind};
use crate::auth::{psk_matches, TokenIssuer};
use crate::error::{FleetError, Result};
use crate::protocol::{
    CapabilityReport, ConfigAck, ConfigAckStatus, NodeAuth, NodeConfigInfo, NodeConfiguration,
    NodeEndpoints, NodeSummary, RegistrationResponse, PROTOCOL_VERSION,
};
use crate::scheduler::MAX_COMMIT_RETRIES;
use crate::store::{Store, Txn, Versioned};

pub use capability::{content_hash, fingerprint, reconcile, Reconciliation};
pub use node::{CapabilitySnapshot, ConfigAckRecord, Node, NodeStatus};

/// Config version handed to newly registered nodes.
pub const NODE_CONFIG_VERSION: &str = "1";

/// Minimum spacing between `last_seen_at` writes for a healthy node.
const TOUCH_INTERVAL: TimeDelta = TimeDelta::seconds(15);

#[derive(Debug, Clone)]
pub struct Registration {
    pub response: RegistrationResponse,
    /// A new node record was created (as opposed to re-registration).
    pub created: bool,
}

#[derive(Clone)]
pub struct Registry {
    store: Store,
    tokens: Arc<TokenIssuer>,
    psk: String,
    stale_after: TimeDelta,
}

impl Registry {
    pub fn new(store: Store, tokens: Arc<TokenIssuer>, psk: String, stale_after: TimeDelta) -> Self {
        Self {
            store,
            tokens,
            psk,
            stale_after,
        }
    }

    /// Verifies the PSK, creates or reuses the node by slug, records the
    /// capability snapshot, and issues a fresh node token.
    pub async fn register(
        &self,
        psk: &str,
        report: CapabilityReport,
        now: DateTime<Utc>,
    ) -> Result<Registration> {
        if !psk_matches(psk, &self.psk) {
            tracing::warn!(slug = %report.node.node_slug, "Registration with invalid PSK");
            self.store
                .record_audit(AuditEntry::new(
                    AuditKind::AuthFailure,
                    report.node.node_slug.clone(),
                    json!({ "reason": "invalid registration key" }),
                    now,
                ))
                .await;
            return Err(FleetError::Unauthorized("invalid registration key".to_string()));
        }
        report.validate()?;
        let (body, hash) = fingerprint(&report)?;
        let slug = report.node.node_slug.trim().to_string();

        for _ in 0..MAX_COMMIT_RETRIES {
            let existing = self.store.node_by_slug(&slug).await?;
            let created = existing.is_none();
            let mut node = match &existing {
                Some(v) => v.value.clone(),
                None => {
                    let mut fresh = Node::new(slug.clone(), now);
                    fresh.config_version = Some(NODE_CONFIG_VERSION.to_string());
                    fresh
                }
            };
            let recon = reconcile(&mut node, &report, &hash, now);

            let mut txn = Txn::new();
            match &existing {
                Some(before) => txn.update_node(before, &node)?,
                None => txn.insert_node(&node)?,
            };
            self.stage_capability(&mut txn, &node, &report, body.clone(), &hash, &recon, now)?;
            if created {
                txn.audit(&AuditEntry::new(
                    AuditKind::NodeRegistered,
                    node.id.to_string(),
                    json!({ "slug": node.slug }),
                    now,
                ))?;
            }

            if !self.store.commit(txn).await? {
                tracing::debug!(slug = %slug, "Registration raced, retrying");
                continue;
            }

            let issued = self.tokens.issue_node(node.id, &node.slug, now)?;
            tracing::info!(
                node_id = %node.id,
                slug = %node.slug,
                status = %node.status,
                created,
                capability_hash = %hash,
                "Node registered"
            );
            return Ok(Registration {
                response: RegistrationResponse {
                    node: NodeSummary {
                        id: node.id,
                        slug: node.slug.clone(),
                        status: node.status,
                    },
                    auth: NodeAuth {
                        node_jwt: issued.token,
                        expires_at: issued.expires_at,
                    },
                    config: NodeConfigInfo {
                        version: node
                            .config_version
                            .clone()
                            .unwrap_or_else(|| NODE_CONFIG_VERSION.to_string()),
                    },
                },
                created,
            });
        }
        Err(FleetError::StoreUnavailable(format!(
            "node {slug} kept changing during registration"
        )))
    }

    /// Records a capability report from an authenticated node.
    pub async fn report_capability(
        &self,
        node_id: Uuid,
        report: CapabilityReport,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        report.validate()?;
        let (body, hash) = fingerprint(&report)?;

        for _ in 0..MAX_COMMIT_RETRIES {
            let before = self.load(node_id).await?;
            if before.value.slug != report.node.node_slug.trim() {
                return Err(FleetError::Validation(format!(
                    "capability is for {}, token is for {}",
                    report.node.node_slug, before.value.slug
                )));
            }
            let mut node = before.value.clone();
            let recon = reconcile(&mut node, &report, &hash, now);

            let mut txn = Txn::new();
            txn.update_node(&before, &node)?;
            self.stage_capability(&mut txn, &node, &report, body.clone(), &hash, &recon, now)?;
            if self.store.commit(txn).await? {
                if recon.changed {
                    tracing::info!(node_id = %node_id, capability_hash = %hash, "Node capability changed");
                }
                return Ok(node);
            }
        }
        Err(FleetError::StoreUnavailable(format!(
            "node {node_id} kept changing during capability report"
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_capability(
        &self,
        txn: &mut Txn,
        node: &Node,
        report: &CapabilityReport,
        body: serde_json::Value,
        hash: &str,
        recon: &Reconciliation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        txn.append_capability(&CapabilitySnapshot {
            id: Uuid::new_v4(),
            node_id: node.id,
            reported_at: report.reported_at,
            received_at: now,
            hash: hash.to_string(),
            body,
        })?;
        if recon.changed {
            txn.audit(&AuditEntry::new(
                AuditKind::CapabilityChanged,
                node.id.to_string(),
                json!({ "previous": recon.previous_hash, "current": hash }),
                now,
            ))?;
        }
        Ok(())
    }

    async fn load(&self, node_id: Uuid) -> Result<Versioned<Node>> {
        self.store
            .node(node_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("node {node_id}")))
    }

    /// Configuration for an authenticated node.
    pub async fn node_config(
        &self,
        node_id: Uuid,
        lease_ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<NodeConfiguration> {
        let node = self.load(node_id).await?.value;
        Ok(NodeConfiguration {
            version: PROTOCOL_VERSION,
            config_version: node
                .config_version
                .unwrap_or_else(|| NODE_CONFIG_VERSION.to_string()),
            issued_at: now,
            node_slug: node.slug,
            lease_ttl_seconds: lease_ttl.num_seconds().max(1).unsigned_abs(),
            endpoints: NodeEndpoints {
                capability: "/v1/nodes/capability".to_string(),
                lease: "/v1/nodes/jobs:lease".to_string(),
                config: "/v1/nodes/config".to_string(),
            },
        })
    }

    /// Records a node's acknowledgement of its configuration.
    pub async fn acknowledge_config(
        &self,
        node_id: Uuid,
        ack: ConfigAck,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        ack.validate()?;
        for _ in 0..MAX_COMMIT_RETRIES {
            let before = self.load(node_id).await?;
            if before.value.slug != ack.node_slug.trim() {
                return Err(FleetError::Validation(format!(
                    "ack is for {}, token is for {}",
                    ack.node_slug, before.value.slug
                )));
            }
            let current = before
                .value
                .config_version
                .clone()
                .unwrap_or_else(|| NODE_CONFIG_VERSION.to_string());
            if ack.config_version != current {
                return Err(FleetError::Validation(format!(
                    "ack for config {}, current is {current}",
                    ack.config_version
                )));
            }

            let mut node = before.value.clone();
            node.config_version = Some(current);
            node.config_ack = Some(ConfigAckRecord {
                config_version: ack.config_version.clone(),
                status: ack.status,
                at: ack.ack_at.unwrap_or(now),
                error: ack.error.clone(),
            });
            node.updated_at = now;

            let mut txn = Txn::new();
            txn.update_node(&before, &node)?;
            txn.audit(&AuditEntry::new(
                AuditKind::ConfigAcknowledged,
                node_id.to_string(),
                json!({ "config_version": ack.config_version, "status": ack.status }),
                now,
            ))?;
            if self.store.commit(txn).await? {
                match ack.status {
                    ConfigAckStatus::Applied => tracing::info!(
                        node_id = %node_id,
                        config_version = %ack.config_version,
                        "Node applied configuration"
                    ),
                    ConfigAckStatus::Failed => tracing::warn!(
                        node_id = %node_id,
                        config_version = %ack.config_version,
                        error = ?ack.error,
                        "Node failed to apply configuration"
                    ),
                }
                return Ok(node);
            }
        }
        Err(FleetError::StoreUnavailable(format!(
            "node {node_id} kept changing during config ack"
        )))
    }

    /// Nodes that can take work right now.
    pub async fn dispatchable_nodes(&self) -> Result<usize> {
        Ok(self
            .store
            .nodes()
            .await?
            .iter()
            .filter(|n| n.value.is_dispatchable())
            .count())
    }

    /// Notes that an authenticated node called in. Revives inactive nodes.
    pub async fn touch(&self, node_id: Uuid, now: DateTime<Utc>) -> Result<Node> {
        let before = self.load(node_id).await?;
        let due = before
            .value
            .last_seen_at
            .is_none_or(|seen| now - seen >= TOUCH_INTERVAL);
        if before.value.status != NodeStatus::Inactive && !due {
            return Ok(before.value);
        }

        let mut node = before.value.clone();
        node.last_seen_at = Some(now);
        node.updated_at = now;
        if node.status == NodeStatus::Inactive {
            node.status = node.revived_status();
        }
        let mut txn = Txn::new();
        txn.update_node(&before, &node)?;
        if self.store.commit(txn).await? {
            if before.value.status == NodeStatus::Inactive {
                tracing::info!(node_id = %node_id, status = %node.status, "Node reactivated");
            }
            Ok(node)
        } else {
            // Someone else updated the node concurrently; their write is at least as fresh.
            Ok(self.load(node_id).await?.value)
        }
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .store
            .nodes()
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        nodes.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(nodes)
    }

    /// Removes a node from scheduling. Running leases are left to finish or expire.
    pub async fn drain(&self, node_id: Uuid, now: DateTime<Utc>) -> Result<Node> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let before = self.load(node_id).await?;
            if before.value.status == NodeStatus::Drained {
                return Ok(before.value);
            }
            let mut node = before.value.clone();
            node.status = NodeStatus::Drained;
            node.updated_at = now;

            let mut txn = Txn::new();
            txn.update_node(&before, &node)?;
            txn.audit(&AuditEntry::new(
                AuditKind::NodeDrained,
                node_id.to_string(),
                json!({ "previous": before.value.status }),
                now,
            ))?;
            if self.store.commit(txn).await? {
                tracing::info!(node_id = %node_id, slug = %node.slug, "Node drained");
                return Ok(node);
            }
        }
        Err(FleetError::StoreUnavailable(format!(
            "node {node_id} kept changing during drain"
        )))
    }

    /// Marks nodes silent for longer than the stale window as inactive.
    pub async fn mark_stale_nodes(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut marked = 0;
        for before in self.store.nodes().await? {
            let node = &before.value;
            if !matches!(node.status, NodeStatus::Active | NodeStatus::Registered) {
                continue;
            }
            let seen = node.last_seen_at.unwrap_or(node.created_at);
            if now - seen < self.stale_after {
                continue;
            }

            let mut stale = node.clone();
            stale.status = NodeStatus::Inactive;
            stale.updated_at = now;
            let mut txn = Txn::new();
            txn.update_node(&before, &stale)?;
            if self.store.commit(txn).await? {
                tracing::warn!(node_id = %node.id, slug = %node.slug, last_seen = %seen, "Node marked inactive");
                marked += 1;
            }
        }
        Ok(marked)
    }
}
