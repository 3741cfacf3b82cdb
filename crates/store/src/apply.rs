use std::sync::Arc;

use gantry_core::{meta_str, ApiObject, GatewayError, GatewayResult, Gvk, Verb};
use gantry_kubehub::{Backend, Impersonation};
use gantry_schema::{ActionHandler, ApiRequest, ResourceSchema};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::{map_backend_error, resource_of};

pub const FIELD_MANAGER: &str = "gantry";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyInput {
    yaml: String,
    #[serde(default)]
    default_namespace: Option<String>,
}

/// The cluster `apply` action: server-side applies every document of a multi-document
/// YAML payload as the caller.
pub struct ApplyAction {
    backend: Arc<dyn Backend>,
}

impl ApplyAction {
    pub fn new(backend: Arc<dyn Backend>) -> Self { Self { backend } }
}

/// Non-empty documents of a YAML stream, as JSON values.
pub fn parse_documents(yaml: &str) -> GatewayResult<Vec<Value>> {
    let mut docs = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = Value::deserialize(doc).map_err(|e| GatewayError::Invalid(format!("document {}: {}", idx, e)))?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

#[async_trait::async_trait]
impl ActionHandler for ApplyAction {
    async fn run(&self, req: &ApiRequest, _schema: &ResourceSchema, input: Value) -> GatewayResult<Value> {
        let input: ApplyInput = match input {
            Value::String(yaml) => ApplyInput { yaml, ..Default::default() },
            other => serde_json::from_value(other).map_err(|e| GatewayError::Invalid(format!("apply input: {}", e)))?,
        };
        let docs = parse_documents(&input.yaml)?;
        let who = Impersonation::User(req.identity().clone());

        // Resolve every document first so a refused kind applies nothing.
        let mut plan = Vec::with_capacity(docs.len());
        for doc in docs {
            let api_version = doc.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
            let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
            if api_version.is_empty() || kind.is_empty() {
                return Err(GatewayError::Invalid("every document needs apiVersion and kind".into()));
            }
            let type_name = Gvk::from_api_version(api_version, kind).type_name();
            let schema = req
                .view
                .lookup(&type_name)
                .filter(|s| s.gvk.is_some())
                .ok_or_else(|| GatewayError::forbidden(format!("{} cannot apply {}", req.identity(), type_name)))?;
            let name = meta_str(&doc, "name").filter(|n| !n.is_empty()).map(str::to_string);
            let name = name.ok_or_else(|| GatewayError::Invalid(format!("{} without metadata.name", type_name)))?;
            let namespace = if schema.namespaced {
                meta_str(&doc, "namespace")
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .or_else(|| input.default_namespace.clone())
                    .or_else(|| Some("default".to_string()))
            } else {
                None
            };
            if !req.access().grants(Verb::Patch, &schema.group, &schema.plural, namespace.as_deref(), Some(&name)) {
                return Err(GatewayError::forbidden(format!("{} cannot patch {} {}", req.identity(), type_name, name)));
            }
            plan.push((Arc::clone(schema), namespace, name, doc));
        }

        let mut applied = Vec::with_capacity(plan.len());
        for (schema, namespace, name, doc) in plan {
            req.check_cancelled()?;
            let res = resource_of(&schema)?;
            let raw = self
                .backend
                .apply(&who, &res, namespace.as_deref(), &name, doc, FIELD_MANAGER)
                .await
                .map_err(map_backend_error)?;
            applied.push(ApiObject::from_raw(schema.id.clone(), raw));
        }
        info!(identity = %req.identity(), documents = applied.len(), "apply: done");
        metrics::counter!("apply_documents_total", applied.len() as u64);
        Ok(serde_json::json!({ "objects": applied }))
    }
}
