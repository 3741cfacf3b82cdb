//! Rolled-up state of a raw object and its owner links.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub state: String,
    pub error: bool,
    pub transitioning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `metadata.ownerReferences` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

pub type Owners = SmallVec<[OwnerRef; 2]>;

const ERROR_WHEN_TRUE: &[&str] = &["Failed", "Degraded", "Stalled"];
const READY_TYPES: &[&str] = &["Ready", "Available", "Established"];

fn text<'a>(v: &'a Value, field: &str) -> Option<&'a str> { v.get(field).and_then(Value::as_str) }

pub fn summarize(raw: &Value) -> Summary {
    let meta = raw.get("metadata");
    if meta.and_then(|m| m.get("deletionTimestamp")).map_or(false, |v| !v.is_null()) {
        return Summary { state: "removing".into(), error: false, transitioning: true, message: None };
    }
    let status = raw.get("status");
    let mut summary = Summary { state: "active".into(), ..Default::default() };

    if let Some(phase) = status.and_then(|s| text(s, "phase")) {
        summary.state = phase.to_lowercase();
        match phase {
            "Failed" => summary.error = true,
            "Pending" | "Terminating" => summary.transitioning = true,
            _ => {}
        }
    }

    let conditions = status.and_then(|s| s.get("conditions")).and_then(Value::as_array);
    for cond in conditions.into_iter().flatten() {
        let (Some(kind), Some(value)) = (text(cond, "type"), text(cond, "status")) else { continue };
        let message = text(cond, "message").filter(|m| !m.is_empty()).map(str::to_string);
        if ERROR_WHEN_TRUE.contains(&kind) && value == "True" {
            summary.error = true;
            summary.state = "error".into();
            summary.message = message.or(summary.message);
        } else if READY_TYPES.contains(&kind) && value == "False" && !summary.error {
            summary.transitioning = true;
            if summary.state == "active" {
                summary.state = "in-progress".into();
            }
            summary.message = message.or(summary.message);
        }
    }
    summary
}

pub fn owners(raw: &Value) -> Owners {
    raw.get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|o| {
            Some(OwnerRef {
                api_version: text(o, "apiVersion")?.to_string(),
                kind: text(o, "kind")?.to_string(),
                name: text(o, "name")?.to_string(),
                uid: text(o, "uid").unwrap_or_default().to_string(),
                controller: o.get("controller").and_then(Value::as_bool).unwrap_or(false),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phases_and_conditions_roll_up() {
        assert_eq!(summarize(&json!({"metadata": {"name": "a"}})).state, "active");

        let pending = summarize(&json!({"status": {"phase": "Pending"}}));
        assert_eq!(pending.state, "pending");
        assert!(pending.transitioning);

        let failing = summarize(&json!({"status": {"conditions": [
            {"type": "Available", "status": "False", "message": "0/3 replicas"},
            {"type": "Degraded", "status": "True", "message": "crashloop"}
        ]}}));
        assert!(failing.error);
        assert_eq!(failing.state, "error");
        assert_eq!(failing.message.as_deref(), Some("crashloop"));

        let rolling = summarize(&json!({"status": {"conditions": [{"type": "Ready", "status": "False", "message": "waiting"}]}}));
        assert_eq!(rolling.state, "in-progress");
        assert!(rolling.transitioning && !rolling.error);
    }

    #[test]
    fn deletion_wins() {
        let s = summarize(&json!({"metadata": {"deletionTimestamp": "2024-01-01T00:00:00Z"}, "status": {"phase": "Running"}}));
        assert_eq!(s.state, "removing");
    }

    #[test]
    fn owner_references_are_parsed() {
        let o = owners(&json!({"metadata": {"ownerReferences": [
            {"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "web-1", "uid": "u1", "controller": true},
            {"kind": "Broken"}
        ]}}));
        assert_eq!(o.len(), 1);
        assert_eq!(o[0].name, "web-1");
        assert!(o[0].controller);
    }
}
