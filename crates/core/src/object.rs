use serde::{Deserialize, Serialize};

use crate::meta_str;

/// Generic envelope around a backend or synthetic object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiObject {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub object: serde_json::Value,
}

impl ApiObject {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>, object: serde_json::Value) -> Self {
        Self { id: id.into(), type_name: type_name.into(), object }
    }

    /// Wraps a raw object, deriving `id` from `metadata.namespace` and `metadata.name`.
    pub fn from_raw(type_name: impl Into<String>, raw: serde_json::Value) -> Self {
        let id = match (meta_str(&raw, "namespace"), meta_str(&raw, "name")) {
            (Some(ns), Some(name)) if !ns.is_empty() => format!("{}/{}", ns, name),
            (_, Some(name)) => name.to_string(),
            _ => String::new(),
        };
        Self { id, type_name: type_name.into(), object: raw }
    }

    pub fn namespace(&self) -> Option<&str> { meta_str(&self.object, "namespace").filter(|s| !s.is_empty()) }

    pub fn name(&self) -> Option<&str> { meta_str(&self.object, "name") }

    pub fn resource_version(&self) -> Option<&str> { meta_str(&self.object, "resourceVersion") }
}

/// Splits an object id into `(namespace, name)`.
pub fn split_id(id: &str) -> (Option<&str>, &str) {
    match id.split_once('/') {
        Some((ns, name)) if !ns.is_empty() => (Some(ns), name),
        Some((_, name)) => (None, name),
        None => (None, id),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiObjectList {
    pub objects: Vec<ApiObject>,
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl ApiObjectList {
    pub fn len(&self) -> usize { self.objects.len() }

    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Error,
}

/// One entry on a watch feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEvent {
    #[serde(rename = "name")]
    pub kind: EventKind,
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ApiObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiEvent {
    pub fn from_object(kind: EventKind, object: ApiObject) -> Self {
        Self { kind, resource_type: object.type_name.clone(), id: object.id.clone(), object: Some(object), error: None }
    }

    pub fn created(object: ApiObject) -> Self { Self::from_object(EventKind::Created, object) }

    pub fn updated(object: ApiObject) -> Self { Self::from_object(EventKind::Updated, object) }

    pub fn deleted(object: ApiObject) -> Self { Self::from_object(EventKind::Deleted, object) }

    pub fn error(resource_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: EventKind::Error, resource_type: resource_type.into(), id: String::new(), object: None, error: Some(message.into()) }
    }
}

/// Server-side list options passed through to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
}

/// Filter and starting point of a requested watch stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSpec {
    pub resource_type: String,
    pub namespace: Option<String>,
    /// Restricts the stream to a single object name.
    pub name: Option<String>,
    pub label_selector: Option<String>,
    pub resource_version: Option<String>,
}

impl WatchSpec {
    pub fn for_type(resource_type: impl Into<String>) -> Self {
        Self { resource_type: resource_type.into(), ..Default::default() }
    }

    /// List options equivalent to this spec (name becomes a field selector).
    pub fn list_options(&self) -> ListOptions {
        ListOptions {
            label_selector: self.label_selector.clone(),
            field_selector: self.name.as_ref().map(|n| format!("metadata.name={}", n)),
            limit: None,
            continue_token: None,
            resource_version: self.resource_version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_namespace_and_name() {
        let o = ApiObject::from_raw("pod", serde_json::json!({"metadata": {"name": "a", "namespace": "ns1"}}));
        assert_eq!(o.id, "ns1/a");
        assert_eq!(o.namespace(), Some("ns1"));
        let n = ApiObject::from_raw("node", serde_json::json!({"metadata": {"name": "n1"}}));
        assert_eq!(n.id, "n1");
        assert_eq!(split_id("ns1/a"), (Some("ns1"), "a"));
        assert_eq!(split_id("n1"), (None, "n1"));
    }

    #[test]
    fn events_serialize_with_wire_names() {
        let o = ApiObject::new("count", "count", serde_json::json!({}));
        let v = serde_json::to_value(ApiEvent::created(o)).unwrap();
        assert_eq!(v["name"], "created");
        assert_eq!(v["resourceType"], "count");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn watch_name_becomes_field_selector() {
        let spec = WatchSpec { name: Some("web".into()), ..WatchSpec::for_type("pod") };
        assert_eq!(spec.list_options().field_selector.as_deref(), Some("metadata.name=web"));
    }
}
