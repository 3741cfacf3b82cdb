//! Gantry kubehub: the contract with the backing control plane (get/list/create/update/
//! delete/apply/watch by resource, plus discovery), its kube-rs implementation and an
//! in-memory double used by tests.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::stream::BoxStream;
use gantry_core::{Delta, DeltaKind, Gvk, Identity, ListOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod kube_backend;
pub mod mock;

pub use kube_backend::KubeBackend;
pub use mock::MockBackend;

/// A resource kind served by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name (`pods`, `deployments`), the unit RBAC rules talk about.
    pub plural: String,
    pub namespaced: bool,
    /// Verbs the control plane supports for this resource.
    pub verbs: Vec<String>,
}

impl DiscoveredResource {
    pub fn gvk(&self) -> Gvk { Gvk::new(self.group.clone(), self.version.clone(), self.kind.clone()) }

    pub fn gvk_key(&self) -> String { self.gvk().key() }

    pub fn type_name(&self) -> String { self.gvk().type_name() }

    pub fn supports(&self, verb: &str) -> bool { self.verbs.iter().any(|v| v == verb || v == "*") }
}

/// Whose privileges a backend call runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Impersonation {
    /// The gateway's own service identity.
    Admin,
    /// The calling identity, via impersonation headers.
    User(Identity),
}

impl Impersonation {
    pub fn label(&self) -> &str {
        match self {
            Impersonation::Admin => "(admin)",
            Impersonation::User(id) => &id.name,
        }
    }
}

/// Failure reported by the control plane. Callers map `Status` codes to their own
/// error kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("{code} {reason}: {message}")]
    Status { code: u16, reason: String, message: String },
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("malformed backend data: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn status(code: u16, reason: &str, message: impl Into<String>) -> Self {
        BackendError::Status { code, reason: reason.to_string(), message: message.into() }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self { Self::status(404, "NotFound", format!("{} not found", what)) }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One page of a list call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawList {
    pub items: Vec<Value>,
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// Progress marker carrying the latest resource version.
    Bookmark(String),
}

impl RawEvent {
    pub fn object(&self) -> Option<&Value> {
        match self {
            RawEvent::Added(o) | RawEvent::Modified(o) | RawEvent::Deleted(o) => Some(o),
            RawEvent::Bookmark(_) => None,
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        match self {
            RawEvent::Bookmark(rv) => Some(rv.as_str()),
            other => other.object().and_then(|o| gantry_core::meta_str(o, "resourceVersion")),
        }
    }
}

pub type RawEventStream = BoxStream<'static, BackendResult<RawEvent>>;

/// Backing control-plane client.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Enumerate the resource kinds currently served.
    async fn discover(&self) -> BackendResult<Vec<DiscoveredResource>>;

    async fn server_version(&self) -> BackendResult<String>;

    async fn get(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> BackendResult<Value>;

    async fn list(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, opts: &ListOptions) -> BackendResult<RawList>;

    async fn create(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, obj: Value) -> BackendResult<Value>;

    async fn update(
        &self,
        who: &Impersonation,
        res: &DiscoveredResource,
        namespace: Option<&str>,
        name: &str,
        obj: Value,
    ) -> BackendResult<Value>;

    /// Returns the object when the control plane still reports it (e.g. pending finalizers).
    async fn delete(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> BackendResult<Option<Value>>;

    /// Server-side apply.
    async fn apply(
        &self,
        who: &Impersonation,
        res: &DiscoveredResource,
        namespace: Option<&str>,
        name: &str,
        obj: Value,
        field_manager: &str,
    ) -> BackendResult<Value>;

    /// Start a watch; `opts.resource_version` is the resumption point.
    async fn watch(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, opts: &ListOptions) -> BackendResult<RawEventStream>;
}

/// Find a discovered resource by GVK key (`v1/Pod`, `apps/v1/Deployment`).
pub fn find_resource<'a>(resources: &'a [DiscoveredResource], gvk_key: &str) -> Result<&'a DiscoveredResource> {
    let gvk = Gvk::parse_key(gvk_key).ok_or_else(|| anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", gvk_key))?;
    resources
        .iter()
        .find(|r| r.group == gvk.group && r.version == gvk.version && r.kind == gvk.kind)
        .ok_or_else(|| anyhow!("GVK not found: {}", gvk_key))
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_uid(uid_str: &str) -> Result<gantry_core::Uid> {
    let u = uuid::Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Normalize a raw backend object into a [`Delta`].
pub fn delta_from(raw: &Value, kind: DeltaKind) -> Result<Delta> {
    let uid_str = gantry_core::meta_str(raw, "uid").ok_or_else(|| anyhow!("object missing metadata.uid"))?;
    let uid = to_uid(uid_str)?;
    let mut raw = raw.clone();
    strip_managed_fields(&mut raw);
    Ok(Delta { uid, kind, raw })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_strip_managed_fields() {
        let raw = serde_json::json!({
            "metadata": {
                "name": "a",
                "uid": "7f0e3b8e-0000-4000-8000-000000000001",
                "managedFields": [{"manager": "kubectl"}]
            }
        });
        let d = delta_from(&raw, DeltaKind::Applied).unwrap();
        assert!(d.raw["metadata"].get("managedFields").is_none());
        assert_eq!(d.uid[0], 0x7f);
        assert!(delta_from(&serde_json::json!({"metadata": {"name": "a"}}), DeltaKind::Applied).is_err());
    }

    #[test]
    fn find_resource_by_key() {
        let rs = vec![mock::resource("apps", "v1", "Deployment", "deployments", true)];
        assert_eq!(find_resource(&rs, "apps/v1/Deployment").unwrap().plural, "deployments");
        assert!(find_resource(&rs, "v1/Pod").is_err());
        assert!(find_resource(&rs, "bogus").is_err());
    }
}
