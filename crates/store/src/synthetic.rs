use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::{split_id, ApiEvent, ApiObject, ApiObjectList, GatewayError, GatewayResult, WatchSpec};
use gantry_kubehub::Backend;
use gantry_schema::{ApiRequest, ResourceSchema, Store};
use gantry_watch::{once_then_idle, Multiplexer, WatchFeed};
use serde_json::json;
use tracing::info;

use crate::map_backend_error;

pub const CLUSTER_GROUP: &str = "management.gantry.io";
pub const CLUSTER_TYPE: &str = "management.gantry.io.cluster";
pub const LOCAL_CLUSTER: &str = "local";

/// Locally constructed objects served without a backend round trip.
#[async_trait::async_trait]
pub trait SyntheticSource: Send + Sync {
    async fn objects(&self, req: &ApiRequest, schema: &ResourceSchema) -> GatewayResult<Vec<ApiObject>>;
}

pub struct SyntheticStore {
    source: Arc<dyn SyntheticSource>,
}

impl SyntheticStore {
    pub fn new(source: Arc<dyn SyntheticSource>) -> Self { Self { source } }

    async fn visible(&self, req: &ApiRequest, schema: &ResourceSchema) -> GatewayResult<Vec<ApiObject>> {
        req.check_cancelled()?;
        let mut objects = self.source.objects(req, schema).await?;
        if let Some(ns) = req.namespace.as_deref().filter(|_| schema.namespaced) {
            objects.retain(|o| o.namespace() == Some(ns));
        }
        for obj in &mut objects {
            schema.format(req, obj);
        }
        Ok(objects)
    }
}

#[async_trait::async_trait]
impl Store for SyntheticStore {
    async fn by_id(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        let (_, name) = split_id(id);
        self.visible(req, schema)
            .await?
            .into_iter()
            .find(|o| o.id == id || o.name() == Some(name))
            .ok_or_else(|| GatewayError::not_found(format!("{} {}", schema.id, id)))
    }

    async fn list(&self, req: &ApiRequest, schema: &ResourceSchema) -> GatewayResult<ApiObjectList> {
        Ok(ApiObjectList { objects: self.visible(req, schema).await?, ..Default::default() })
    }

    /// One `created` per current object, then silence until the request is cancelled.
    async fn watch(&self, req: &ApiRequest, schema: &ResourceSchema, spec: &WatchSpec) -> GatewayResult<WatchFeed> {
        let events: Vec<ApiEvent> = self
            .visible(req, schema)
            .await?
            .into_iter()
            .filter(|o| spec.name.as_deref().map_or(true, |n| o.name() == Some(n)))
            .map(ApiEvent::created)
            .collect();
        let mut mux = Multiplexer::new(&req.cancel, schema.id.clone());
        mux.add_source(once_then_idle(events));
        Ok(mux.start())
    }
}

/// The singleton `local` cluster: the control plane the gateway runs against.
pub struct LocalClusterSource {
    version: String,
}

impl LocalClusterSource {
    pub fn new(version: impl Into<String>) -> Self { Self { version: version.into() } }

    /// Ask the backend for its version once; it is not refreshed afterwards.
    pub async fn capture(backend: &dyn Backend) -> GatewayResult<Self> {
        let version = backend.server_version().await.map_err(map_backend_error)?;
        info!(version = %version, "synthetic: local cluster registered");
        Ok(Self::new(version))
    }

    pub fn version(&self) -> &str { &self.version }

    pub fn object(&self) -> ApiObject {
        ApiObject::new(
            CLUSTER_TYPE,
            LOCAL_CLUSTER,
            json!({
                "apiVersion": format!("{}/v3", CLUSTER_GROUP),
                "kind": "Cluster",
                "metadata": { "name": LOCAL_CLUSTER },
                "spec": { "displayName": "Local Cluster", "internal": true },
                "status": {
                    "driver": "local",
                    "ready": true,
                    "version": { "gitVersion": self.version },
                },
            }),
        )
    }
}

#[async_trait::async_trait]
impl SyntheticSource for LocalClusterSource {
    async fn objects(&self, _req: &ApiRequest, _schema: &ResourceSchema) -> GatewayResult<Vec<ApiObject>> { Ok(vec![self.object()]) }
}

pub const APIGROUP_TYPE: &str = "apigroup";

/// API groups the control plane currently serves, asked for on every request.
/// The core group is reported as `core`.
pub struct ApiGroupSource {
    backend: Arc<dyn Backend>,
}

impl ApiGroupSource {
    pub fn new(backend: Arc<dyn Backend>) -> Self { Self { backend } }
}

#[async_trait::async_trait]
impl SyntheticSource for ApiGroupSource {
    async fn objects(&self, _req: &ApiRequest, _schema: &ResourceSchema) -> GatewayResult<Vec<ApiObject>> {
        let resources = self.backend.discover().await.map_err(map_backend_error)?;
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for res in &resources {
            let versions = groups.entry(res.group.as_str()).or_default();
            if !versions.contains(&res.version.as_str()) {
                versions.push(res.version.as_str());
            }
        }
        Ok(groups
            .into_iter()
            .map(|(group, versions)| {
                let name = if group.is_empty() { "core" } else { group };
                let group_version = |v: &str| if group.is_empty() { v.to_string() } else { format!("{}/{}", group, v) };
                let listed: Vec<_> = versions.iter().map(|v| json!({ "groupVersion": group_version(*v), "version": *v })).collect();
                ApiObject::new(
                    APIGROUP_TYPE,
                    name,
                    json!({
                        "metadata": { "name": name },
                        "versions": listed,
                        "preferredVersion": listed.first().cloned().unwrap_or_default(),
                    }),
                )
            })
            .collect())
    }
}
