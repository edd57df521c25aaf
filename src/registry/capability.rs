use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::node::{Node, NodeStatus};
use crate::error::{FleetError, Result};
use crate::protocol::CapabilityReport;

/// Serialises `value` with object keys sorted at every depth and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// `sha256:<hex>` over the canonical form of `body` minus `reported_at`.
pub fn content_hash(body: &Value) -> String {
    let mut hashed = body.clone();
    if let Value::Object(map) = &mut hashed {
        map.remove("reported_at");
    }
    let digest = Sha256::digest(canonical_json(&hashed).as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// JSON body of a report and its fingerprint.
pub fn fingerprint(report: &CapabilityReport) -> Result<(Value, String)> {
    let body = serde_json::to_value(report)
        .map_err(|e| FleetError::Internal(format!("encode capability: {e}")))?;
    let hash = content_hash(&body);
    Ok((body, hash))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The fingerprint differs from a previously stored one.
    pub changed: bool,
    pub previous_hash: Option<String>,
    pub status_before: NodeStatus,
}

/// Folds a capability report into the node record.
///
/// Sandbox support moves `registered` nodes to `active` (and takes it away
/// again when withdrawn); `inactive` nodes are revived; `drained` is sticky.
pub fn reconcile(
    node: &mut Node,
    report: &CapabilityReport,
    hash: &str,
    now: DateTime<Utc>,
) -> Reconciliation {
    let status_before = node.status;
    let previous_hash = node.capability_hash.replace(hash.to_string());
    let changed = previous_hash.as_deref().is_some_and(|prev| prev != hash);

    node.sandbox_supported = report.sandbox_supported();
    if !report.node.name.is_empty() {
        node.name = report.node.name.clone();
    }
    node.labels = report.node.labels.clone();
    node.last_capability_at = Some(now);
    node.last_seen_at = Some(now);
    node.updated_at = now;

    node.status = match node.status {
        NodeStatus::Drained => NodeStatus::Drained,
        NodeStatus::Registered | NodeStatus::Active | NodeStatus::Inactive => {
            node.revived_status()
        }
    };

    Reconciliation {
        changed,
        previous_hash,
        status_before,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_form_sorts_nested_keys() {
        let a: Value = serde_json::from_str(r#"{ "b": 1, "a": { "y": [1, {"d": 2, "c": 3}], "x": null } }"#).unwrap();
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"x":null,"y":[1,{"c":3,"d":2}]},"b":1}"#
        );
    }

    #[test]
    fn hash_ignores_whitespace_key_order_and_reported_at() {
        let a: Value = serde_json::from_str(
            r#"{"version":1,"reported_at":"2026-01-01T00:00:00Z","node":{"node_slug":"n1"},"compute":{"cpu_cores":4,"ram_mb":1024}}"#,
        )
        .unwrap();
        let b: Value = serde_json::from_str(
            r#"{
                "compute": { "ram_mb": 1024, "cpu_cores": 4 },
                "node": { "node_slug": "n1" },
                "reported_at": "2026-06-30T12:00:00Z",
                "version": 1
            }"#,
        )
        .unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert!(content_hash(&a).starts_with("sha256:"));
        assert_eq!(content_hash(&a).len(), "sha256:".len() + 64);

        let c = json!({"version": 1, "node": {"node_slug": "n2"}, "compute": {"cpu_cores": 4, "ram_mb": 1024}});
        assert_ne!(content_hash(&a), content_hash(&c));
    }
}
