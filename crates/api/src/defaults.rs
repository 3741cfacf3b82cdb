//! Schemas and templates every gateway starts with.

use std::sync::Arc;

use gantry_core::{ApiObject, GatewayResult, Verb};
use gantry_kubehub::Backend;
use gantry_schema::{ActionHandler, ApiRequest, Formatter, Method, ResourceSchema, Template};
use gantry_store::{
    AggregateStore, ApiGroupSource, ApplyAction, LocalClusterSource, PreferenceStore, ProxyStore, SyntheticStore, APIGROUP_TYPE, CLUSTER_GROUP,
    CLUSTER_TYPE, COUNT_TYPE, PREFERENCE_TYPE,
};
use gantry_summary::SummaryHandle;
use serde_json::{json, Value};

/// Cluster objects managed by an external multi-cluster manager, when its CRD is installed.
pub const MANAGED_CLUSTER_TYPE: &str = "management.cattle.io.cluster";

/// Drops the release payload Helm 2 stores in its configmaps and secrets; it is large
/// and of no use to API clients.
pub struct DropHelmData;

impl Formatter for DropHelmData {
    fn format(&self, _req: &ApiRequest, object: &mut ApiObject) {
        let labels = &object.object["metadata"]["labels"];
        let helm = labels.get("owner").and_then(Value::as_str) == Some("helm")
            || labels.get("OWNER").and_then(Value::as_str) == Some("TILLER");
        if !helm {
            return;
        }
        if let Some(data) = object.object.get_mut("data").and_then(Value::as_object_mut) {
            data.remove("release");
        }
    }
}

/// Sets `metadata.state.name` to the status a pod listing would show
/// (`crashLoopBackOff`, `terminating`, `init:0/1`...) instead of the summarized phase.
pub struct PodState;

impl Formatter for PodState {
    fn format(&self, _req: &ApiRequest, object: &mut ApiObject) {
        let Some(status) = pod_status(&object.object) else { return };
        let Some(meta) = object.object.get_mut("metadata").and_then(Value::as_object_mut) else { return };
        let state = meta.entry("state").or_insert_with(|| json!({"error": false, "transitioning": false, "message": ""}));
        if let Some(state) = state.as_object_mut() {
            state.insert("name".into(), Value::String(lower_first(&status)));
        }
    }
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |v, k| v.get(*k)).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Pod status as listings show it: the most specific container reason wins over
/// the phase, pending init containers are reported as `Init:<done>/<total>`.
fn pod_status(pod: &Value) -> Option<String> {
    let status = pod.get("status")?;
    let mut reason = str_at(status, &["reason"]).or_else(|| str_at(status, &["phase"]))?.to_string();

    let empty = Vec::new();
    let inits = status.get("initContainerStatuses").and_then(Value::as_array).unwrap_or(&empty);
    let mut initializing = false;
    for (i, c) in inits.iter().enumerate() {
        if c.pointer("/state/terminated/exitCode").and_then(Value::as_i64) == Some(0) {
            continue;
        }
        initializing = true;
        reason = if let Some(r) = str_at(c, &["state", "terminated", "reason"]) {
            format!("Init:{}", r)
        } else if let Some(code) = c.pointer("/state/terminated/exitCode").and_then(Value::as_i64) {
            format!("Init:ExitCode:{}", code)
        } else if let Some(r) = str_at(c, &["state", "waiting", "reason"]).filter(|r| *r != "PodInitializing") {
            format!("Init:{}", r)
        } else {
            format!("Init:{}/{}", i, inits.len())
        };
        break;
    }

    if !initializing {
        let containers = status.get("containerStatuses").and_then(Value::as_array).unwrap_or(&empty);
        for c in containers.iter().rev() {
            if let Some(r) = str_at(c, &["state", "waiting", "reason"]).or_else(|| str_at(c, &["state", "terminated", "reason"])) {
                reason = r.to_string();
            } else if let Some(code) = c.pointer("/state/terminated/exitCode").and_then(Value::as_i64) {
                reason = match c.pointer("/state/terminated/signal").and_then(Value::as_i64).filter(|s| *s != 0) {
                    Some(signal) => format!("Signal:{}", signal),
                    None => format!("ExitCode:{}", code),
                };
            }
        }
    }

    if str_at(pod, &["metadata", "deletionTimestamp"]).is_some() {
        reason = if reason == "NodeLost" { "Unknown".into() } else { "Terminating".into() };
    }
    Some(reason)
}

/// Gives a schema the cluster `apply` action unless it already has one.
pub fn add_apply(schema: &mut ResourceSchema, handler: &Arc<dyn ActionHandler>) {
    schema.actions.entry("apply".into()).or_insert_with(|| Arc::clone(handler));
}

/// The `local` cluster (watchable by everyone, carrying the `apply` action), the
/// `count` aggregate, the served API groups and every caller's own `userpreference`.
pub async fn default_schemas(backend: &Arc<dyn Backend>, summary: SummaryHandle) -> GatewayResult<Vec<ResourceSchema>> {
    let local = LocalClusterSource::capture(backend.as_ref()).await?;
    let cluster = ResourceSchema::new(CLUSTER_TYPE, CLUSTER_GROUP, "clusters", false)
        .with_methods([Method::Get], [Method::Get])
        .with_static_access([Verb::Watch])
        .with_store(Arc::new(SyntheticStore::new(Arc::new(local))))
        .with_action("apply", Arc::new(ApplyAction::new(Arc::clone(backend))));
    let counts = ResourceSchema::new(COUNT_TYPE, "", "counts", false)
        .with_methods([Method::Get], [Method::Get])
        .with_static_access([Verb::Get, Verb::List, Verb::Watch])
        .with_store(Arc::new(AggregateStore::new(summary)));
    let preferences = ResourceSchema::new(PREFERENCE_TYPE, "", "userpreferences", false)
        .with_methods([Method::Get], [Method::Get, Method::Put, Method::Delete])
        .with_static_access([Verb::Get, Verb::List, Verb::Update, Verb::Delete])
        .with_store(Arc::new(PreferenceStore::new()));
    let groups = ResourceSchema::new(APIGROUP_TYPE, "", "apigroups", false)
        .with_methods([Method::Get], [Method::Get])
        .with_static_access([Verb::Get, Verb::List])
        .with_store(Arc::new(SyntheticStore::new(Arc::new(ApiGroupSource::new(Arc::clone(backend))))));
    Ok(vec![cluster, counts, groups, preferences])
}

/// The proxy store for every schema without one, the Helm payload filter, pod status
/// and `apply` on managed clusters.
pub fn default_templates(backend: &Arc<dyn Backend>, summary: SummaryHandle) -> Vec<Template> {
    let proxy = ProxyStore::new(Arc::clone(backend)).with_summary(summary);
    let apply: Arc<dyn ActionHandler> = Arc::new(ApplyAction::new(Arc::clone(backend)));
    vec![
        Template::for_all().with_store(Arc::new(proxy)),
        Template::for_id("configmap").with_formatter(Arc::new(DropHelmData)),
        Template::for_id("secret").with_formatter(Arc::new(DropHelmData)),
        Template::for_id("pod").with_formatter(Arc::new(PodState)),
        Template::for_id(MANAGED_CLUSTER_TYPE).with_customize(move |schema| add_apply(schema, &apply)),
    ]
}
