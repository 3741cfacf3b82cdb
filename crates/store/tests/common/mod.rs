#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_access::{AccessSetLookup, BindingSource, PolicyRule, ScopedRule};
use gantry_core::Identity;
use gantry_kubehub::mock::resource;
use gantry_kubehub::{DiscoveredResource, MockBackend};
use gantry_schema::{ApiRequest, Registry, ResourceSchema, SchemaFactory, Template};
use gantry_store::ProxyStore;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Rules(Mutex<HashMap<String, Vec<ScopedRule>>>);

impl Rules {
    pub fn grant(&self, user: &str, rule: ScopedRule) { self.0.lock().unwrap().entry(user.to_string()).or_default().push(rule); }
}

#[async_trait::async_trait]
impl BindingSource for Rules {
    async fn rules_for(&self, identity: &Identity) -> anyhow::Result<Vec<ScopedRule>> {
        Ok(self.0.lock().unwrap().get(&identity.name).cloned().unwrap_or_default())
    }
}

pub fn pods() -> DiscoveredResource { resource("", "v1", "Pod", "pods", true) }

pub fn configmaps() -> DiscoveredResource { resource("", "v1", "ConfigMap", "configmaps", true) }

pub fn nodes() -> DiscoveredResource { resource("", "v1", "Node", "nodes", false) }

pub fn pod(ns: &str, name: &str) -> serde_json::Value { serde_json::json!({"metadata": {"name": name, "namespace": ns}}) }

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub rules: Arc<Rules>,
    pub registry: Arc<Registry>,
    pub factory: SchemaFactory,
}

/// Pods, configmaps and nodes served by a [`ProxyStore`]; `admin` holds every verb.
pub fn harness() -> Harness { harness_with(|backend| ProxyStore::new(backend)) }

pub fn harness_with(proxy: impl FnOnce(Arc<MockBackend>) -> ProxyStore) -> Harness {
    let resources = vec![pods(), configmaps(), nodes()];
    let backend = Arc::new(MockBackend::with_resources(resources.clone()));
    let rules = Arc::new(Rules::default());
    rules.grant("admin", ScopedRule::cluster(PolicyRule::new(["*"], ["*"], ["*"])));
    let lookup = Arc::new(AccessSetLookup::new(rules.clone(), Duration::from_secs(60)));
    let registry = Arc::new(Registry::new());
    registry.replace_discovered(resources.iter().map(ResourceSchema::from_discovered).collect());
    let factory = SchemaFactory::new(Arc::clone(&registry), lookup);
    factory.add_template(Template::for_all().with_store(Arc::new(proxy(Arc::clone(&backend)))));
    Harness { backend, rules, registry, factory }
}

impl Harness {
    pub async fn request(&self, user: &str) -> ApiRequest {
        let view = self.factory.for_identity(&Identity::user(user)).await.unwrap();
        ApiRequest::new(view, CancellationToken::new())
    }

    pub fn seed(&self, res: &DiscoveredResource, objects: &[(&str, &str)]) {
        for (ns, name) in objects {
            self.backend.upsert(res, pod(ns, name));
        }
    }
}
