//! Table columns for schemas: the defaults every kind gets, plus CRD
//! `additionalPrinterColumns`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Dotted path with optional `[index]` segments, e.g. `spec.dnsNames[0]`.
    pub field: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Column {
    pub fn new(name: &str, field: &str, type_name: &str) -> Self {
        Self { name: name.to_string(), field: field.to_string(), type_name: type_name.to_string(), description: None }
    }

    /// Render the column for `raw` as a scalar string.
    pub fn extract(&self, raw: &Value) -> Option<String> {
        match lookup(raw, &self.field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// One row of cells for `columns`; missing values render empty.
    pub fn row(columns: &[Column], raw: &Value) -> SmallVec<[String; 8]> {
        columns.iter().map(|c| c.extract(raw).unwrap_or_default()).collect()
    }
}

pub fn default_columns(namespaced: bool) -> Vec<Column> {
    let mut cols = Vec::with_capacity(3);
    if namespaced {
        cols.push(Column::new("Namespace", "metadata.namespace", "string"));
    }
    cols.push(Column::new("Name", "metadata.name", "string"));
    cols.push(Column::new("Created", "metadata.creationTimestamp", "date"));
    cols
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('.') {
        let (key, idx) = match seg.find('[') {
            Some(brk) => {
                let idx: usize = seg.get(brk + 1..seg.len() - 1)?.parse().ok()?;
                (&seg[..brk], Some(idx))
            }
            None => (seg, None),
        };
        cur = cur.as_object()?.get(key)?;
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
    }
    Some(cur)
}

/// Accepts simple JSON paths (`.spec.foo.bar[0]`) and returns them without the
/// leading dot. Filters, wildcards and nested indexes are rejected.
pub fn normalize_json_path(jp: &str) -> Option<String> {
    if jp.contains('?') || jp.contains('*') {
        return None;
    }
    let s = jp.strip_prefix('.').unwrap_or(jp);
    if s.is_empty() {
        return None;
    }
    for seg in s.split('.') {
        let (key, index) = match seg.find('[') {
            Some(open) => (&seg[..open], Some(&seg[open..])),
            None => (seg, None),
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
        if let Some(index) = index {
            let digits = index.strip_prefix('[')?.strip_suffix(']')?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
        }
    }
    Some(s.to_string())
}

fn columns_of(cols: &Value) -> Vec<Column> {
    cols.as_array()
        .into_iter()
        .flatten()
        .filter_map(|c| {
            let name = c.get("name")?.as_str().filter(|n| !n.is_empty())?;
            let field = normalize_json_path(c.get("jsonPath")?.as_str()?)?;
            Some(Column {
                name: name.to_string(),
                field,
                type_name: c.get("type").and_then(Value::as_str).unwrap_or("string").to_string(),
                description: c.get("description").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect()
}

/// Printer columns declared by CustomResourceDefinitions, keyed by GVK key
/// (`group/version/Kind`) for every served version.
pub fn crd_columns(crds: &[Value]) -> HashMap<String, Vec<Column>> {
    let mut out = HashMap::new();
    for crd in crds {
        let Some(spec) = crd.get("spec") else { continue };
        let group = spec.get("group").and_then(Value::as_str).unwrap_or_default();
        let kind = spec.get("names").and_then(|n| n.get("kind")).and_then(Value::as_str).unwrap_or_default();
        if group.is_empty() || kind.is_empty() {
            continue;
        }
        // v1beta1 CRDs carried one top-level column list for all versions
        let legacy = spec.get("additionalPrinterColumns").map(columns_of).unwrap_or_default();
        for ver in spec.get("versions").and_then(Value::as_array).into_iter().flatten() {
            if ver.get("served").and_then(Value::as_bool) == Some(false) {
                continue;
            }
            let Some(name) = ver.get("name").and_then(Value::as_str) else { continue };
            let mut cols = ver.get("additionalPrinterColumns").map(columns_of).unwrap_or_default();
            if cols.is_empty() {
                cols = legacy.clone();
            }
            if !cols.is_empty() {
                out.insert(format!("{}/{}/{}", group, name, kind), cols);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_json_path_accepts_simple_paths() {
        assert_eq!(normalize_json_path(".spec.foo"), Some("spec.foo".to_string()));
        assert_eq!(normalize_json_path("spec.dnsNames[0]"), Some("spec.dnsNames[0]".to_string()));
        assert!(normalize_json_path("").is_none());
        assert!(normalize_json_path("spec.*").is_none());
        assert!(normalize_json_path("spec.foo[0][1]").is_none());
        assert!(normalize_json_path(".status.conditions[?(@.type==\"Ready\")].status").is_none());
    }

    #[test]
    fn crd_columns_per_served_version() {
        let crd = serde_json::json!({
            "spec": {
                "group": "cert-manager.io",
                "names": {"kind": "Certificate"},
                "versions": [
                    {"name": "v1", "served": true, "additionalPrinterColumns": [
                        {"name": "Secret", "type": "string", "jsonPath": ".spec.secretName"},
                        {"name": "Ready", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"},
                        {"name": "DNS", "type": "string", "jsonPath": ".spec.dnsNames[0]"}
                    ]},
                    {"name": "v1alpha1", "served": false}
                ]
            }
        });
        let cols = crd_columns(&[crd]);
        assert_eq!(cols.len(), 1);
        let v1 = &cols["cert-manager.io/v1/Certificate"];
        assert_eq!(v1.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["Secret", "DNS"]);

        let obj = serde_json::json!({"spec": {"secretName": "tls", "dnsNames": ["a.example.com"]}});
        assert_eq!(Column::row(v1, &obj).to_vec(), vec!["tls".to_string(), "a.example.com".to_string()]);
    }

    #[test]
    fn default_columns_depend_on_scope() {
        assert_eq!(default_columns(true)[0].name, "Namespace");
        assert_eq!(default_columns(false)[0].name, "Name");
        let obj = serde_json::json!({"metadata": {"name": "a", "namespace": "ns1"}});
        assert_eq!(Column::row(&default_columns(true), &obj).to_vec(), vec!["ns1".to_string(), "a".to_string(), String::new()]);
    }
}
