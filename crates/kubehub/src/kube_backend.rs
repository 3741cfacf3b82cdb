use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context;
use futures::StreamExt;
use gantry_core::{Identity, ListOptions};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client, Config,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::{Backend, BackendError, BackendResult, DiscoveredResource, Impersonation, RawEvent, RawEventStream, RawList};

/// Impersonated clients kept around; the map is cleared when it grows past this.
const MAX_CACHED_CLIENTS: usize = 256;

/// [`Backend`] over a real cluster through kube-rs dynamic objects.
pub struct KubeBackend {
    config: Config,
    admin: Client,
    clients: Mutex<HashMap<Identity, Client>>,
}

impl KubeBackend {
    /// Build from the ambient kubeconfig / in-cluster configuration.
    pub async fn try_default() -> anyhow::Result<Self> {
        let config = Config::infer().await.context("inferring kube config")?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let admin = Client::try_from(config.clone()).context("building admin kube client")?;
        Ok(Self { config, admin, clients: Mutex::new(HashMap::new()) })
    }

    pub fn admin_client(&self) -> Client { self.admin.clone() }

    fn client(&self, who: &Impersonation) -> BackendResult<Client> {
        let identity = match who {
            Impersonation::Admin => return Ok(self.admin.clone()),
            Impersonation::User(identity) => identity,
        };
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = clients.get(identity) {
            return Ok(c.clone());
        }
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(identity.name.clone());
        config.auth_info.impersonate_groups = if identity.groups.is_empty() { None } else { Some(identity.groups.clone()) };
        let client = Client::try_from(config).map_err(map_kube_err)?;
        if clients.len() >= MAX_CACHED_CLIENTS {
            clients.clear();
        }
        clients.insert(identity.clone(), client.clone());
        Ok(client)
    }

    fn api(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>) -> BackendResult<Api<DynamicObject>> {
        let client = self.client(who)?;
        let ar = api_resource(res);
        Ok(match (res.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        })
    }

    fn scoped_api(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>) -> BackendResult<Api<DynamicObject>> {
        if res.namespaced && namespace.is_none() {
            return Err(BackendError::status(422, "Invalid", format!("namespace required for namespaced kind {}", res.kind)));
        }
        self.api(who, res, namespace)
    }
}

fn api_resource(res: &DiscoveredResource) -> ApiResource {
    ApiResource {
        group: res.group.clone(),
        version: res.version.clone(),
        api_version: res.gvk().api_version(),
        kind: res.kind.clone(),
        plural: res.plural.clone(),
    }
}

fn map_kube_err(e: kube::Error) -> BackendError {
    match e {
        kube::Error::Api(resp) => BackendError::Status { code: resp.code, reason: resp.reason, message: resp.message },
        kube::Error::SerdeError(e) => BackendError::Decode(e.to_string()),
        other => BackendError::Unreachable(other.to_string()),
    }
}

fn to_json(obj: &DynamicObject) -> BackendResult<Value> { serde_json::to_value(obj).map_err(|e| BackendError::Decode(e.to_string())) }

fn from_json(obj: Value) -> BackendResult<DynamicObject> {
    serde_json::from_value(obj).map_err(|e| BackendError::status(422, "Invalid", format!("object is not a valid resource: {}", e)))
}

fn list_params(opts: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = opts.label_selector.as_deref() {
        lp = lp.labels(l);
    }
    if let Some(f) = opts.field_selector.as_deref() {
        lp = lp.fields(f);
    }
    if let Some(n) = opts.limit {
        lp = lp.limit(n);
    }
    if let Some(c) = opts.continue_token.as_deref() {
        lp = lp.continue_token(c);
    }
    lp
}

fn watch_params(opts: &ListOptions) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(l) = opts.label_selector.as_deref() {
        wp = wp.labels(l);
    }
    if let Some(f) = opts.field_selector.as_deref() {
        wp = wp.fields(f);
    }
    wp
}

#[async_trait::async_trait]
impl Backend for KubeBackend {
    async fn discover(&self) -> BackendResult<Vec<DiscoveredResource>> {
        let t0 = Instant::now();
        let discovery = Discovery::new(self.admin.clone()).run().await.map_err(map_kube_err)?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                out.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    verbs: caps.operations.clone(),
                });
            }
        }
        // Stable-ish order
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        info!(count = out.len(), took_ms = %t0.elapsed().as_millis(), "kubehub: discovery done");
        Ok(out)
    }

    async fn server_version(&self) -> BackendResult<String> {
        let info = self.admin.apiserver_version().await.map_err(map_kube_err)?;
        Ok(info.git_version)
    }

    async fn get(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> BackendResult<Value> {
        let api = self.scoped_api(who, res, namespace)?;
        let obj = api.get(name).await.map_err(map_kube_err)?;
        to_json(&obj)
    }

    async fn list(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, opts: &ListOptions) -> BackendResult<RawList> {
        let api = self.api(who, res, namespace)?;
        let list = api.list(&list_params(opts)).await.map_err(map_kube_err)?;
        let items = list.items.iter().map(to_json).collect::<BackendResult<Vec<_>>>()?;
        debug!(gvk = %res.gvk_key(), ns = ?namespace, who = %who.label(), count = items.len(), "kubehub: list");
        Ok(RawList {
            items,
            continue_token: list.metadata.continue_.filter(|c| !c.is_empty()),
            resource_version: list.metadata.resource_version,
        })
    }

    async fn create(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, obj: Value) -> BackendResult<Value> {
        let api = self.scoped_api(who, res, namespace)?;
        let created = api.create(&PostParams::default(), &from_json(obj)?).await.map_err(map_kube_err)?;
        to_json(&created)
    }

    async fn update(
        &self,
        who: &Impersonation,
        res: &DiscoveredResource,
        namespace: Option<&str>,
        name: &str,
        obj: Value,
    ) -> BackendResult<Value> {
        let api = self.scoped_api(who, res, namespace)?;
        let replaced = api.replace(name, &PostParams::default(), &from_json(obj)?).await.map_err(map_kube_err)?;
        to_json(&replaced)
    }

    async fn delete(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> BackendResult<Option<Value>> {
        let api = self.scoped_api(who, res, namespace)?;
        let outcome = api.delete(name, &DeleteParams::default()).await.map_err(map_kube_err)?;
        outcome.left().map(|o| to_json(&o)).transpose()
    }

    async fn apply(
        &self,
        who: &Impersonation,
        res: &DiscoveredResource,
        namespace: Option<&str>,
        name: &str,
        obj: Value,
        field_manager: &str,
    ) -> BackendResult<Value> {
        let api = self.scoped_api(who, res, namespace)?;
        let pp = PatchParams::apply(field_manager).force();
        let applied = api.patch(name, &pp, &Patch::Apply(&obj)).await.map_err(map_kube_err)?;
        to_json(&applied)
    }

    async fn watch(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, opts: &ListOptions) -> BackendResult<RawEventStream> {
        let api = self.api(who, res, namespace)?;
        let version = opts.resource_version.clone().unwrap_or_else(|| "0".to_string());
        let stream = api.watch(&watch_params(opts), &version).await.map_err(map_kube_err)?;
        debug!(gvk = %res.gvk_key(), ns = ?namespace, who = %who.label(), version = %version, "kubehub: watch started");
        let mapped = stream.map(|item| match item {
            Ok(WatchEvent::Added(o)) => to_json(&o).map(RawEvent::Added),
            Ok(WatchEvent::Modified(o)) => to_json(&o).map(RawEvent::Modified),
            Ok(WatchEvent::Deleted(o)) => to_json(&o).map(RawEvent::Deleted),
            Ok(WatchEvent::Bookmark(b)) => Ok(RawEvent::Bookmark(b.metadata.resource_version)),
            Ok(WatchEvent::Error(resp)) => Err(BackendError::Status { code: resp.code, reason: resp.reason, message: resp.message }),
            Err(e) => Err(map_kube_err(e)),
        });
        Ok(mapped.boxed())
    }
}
