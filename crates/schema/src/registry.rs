use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{Formatter, ResourceSchema, Store};

/// Immutable catalog published by the [`Registry`].
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub revision: u64,
    schemas: BTreeMap<String, Arc<ResourceSchema>>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&Arc<ResourceSchema>> { self.schemas.get(id) }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceSchema>> { self.schemas.values() }

    pub fn ids(&self) -> impl Iterator<Item = &str> { self.schemas.keys().map(String::as_str) }

    pub fn len(&self) -> usize { self.schemas.len() }

    pub fn is_empty(&self) -> bool { self.schemas.is_empty() }
}

#[derive(Default)]
struct Sources {
    registered: BTreeMap<String, Arc<ResourceSchema>>,
    discovered: BTreeMap<String, Arc<ResourceSchema>>,
    revision: u64,
}

impl Sources {
    fn merged(&self) -> BTreeMap<String, Arc<ResourceSchema>> {
        let mut all = self.discovered.clone();
        // Registered schemas win over discovered ones with the same id
        all.extend(self.registered.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
        all
    }
}

/// Process-wide schema catalog. Writers serialize on a mutex and publish whole
/// snapshots; readers never observe a partial update.
pub struct Registry {
    sources: Mutex<Sources>,
    current: ArcSwap<RegistrySnapshot>,
    revision_tx: watch::Sender<u64>,
}

impl Default for Registry {
    fn default() -> Self { Self::new() }
}

impl Registry {
    pub fn new() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self { sources: Mutex::new(Sources::default()), current: ArcSwap::from_pointee(RegistrySnapshot::default()), revision_tx }
    }

    /// Add or replace a schema by id.
    pub fn register(&self, schema: ResourceSchema) -> u64 {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        let id = schema.id.clone();
        let replaced = sources.registered.insert(id.clone(), Arc::new(schema)).is_some();
        let revision = self.publish(&mut sources);
        debug!(schema = %id, replaced, revision, "registry: register");
        revision
    }

    /// Replace the whole discovered set at once.
    pub fn replace_discovered(&self, schemas: Vec<ResourceSchema>) -> u64 {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        let before = sources.discovered.len();
        sources.discovered = schemas.into_iter().map(|s| (s.id.clone(), Arc::new(s))).collect();
        let count = sources.discovered.len();
        let revision = self.publish(&mut sources);
        info!(before, count, revision, "registry: discovered schemas replaced");
        revision
    }

    fn publish(&self, sources: &mut Sources) -> u64 {
        sources.revision += 1;
        let snapshot = RegistrySnapshot { revision: sources.revision, schemas: sources.merged() };
        self.current.store(Arc::new(snapshot));
        self.revision_tx.send_replace(sources.revision);
        metrics::gauge!("registry_schemas", self.current.load().len() as f64);
        sources.revision
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> { self.current.load_full() }

    pub fn revision(&self) -> u64 { self.current.load().revision }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.revision_tx.subscribe() }
}

pub type Customizer = Arc<dyn Fn(&mut ResourceSchema) + Send + Sync>;

/// Customization applied to copies of matching schemas when a view is built.
/// A template without an id applies to every schema.
#[derive(Clone, Default)]
pub struct Template {
    pub id: Option<String>,
    pub customize: Option<Customizer>,
    pub formatter: Option<Arc<dyn Formatter>>,
    /// Store for schemas that do not carry their own.
    pub store: Option<Arc<dyn Store>>,
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("customize", &self.customize.is_some())
            .field("formatter", &self.formatter.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl Template {
    pub fn for_id(id: impl Into<String>) -> Self { Self { id: Some(id.into()), ..Default::default() } }

    pub fn for_all() -> Self { Self::default() }

    pub fn with_customize(mut self, f: impl Fn(&mut ResourceSchema) + Send + Sync + 'static) -> Self {
        self.customize = Some(Arc::new(f));
        self
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn matches(&self, schema_id: &str) -> bool { self.id.as_deref().map_or(true, |id| id == schema_id) }

    pub fn apply(&self, schema: &mut ResourceSchema) {
        if let Some(store) = &self.store {
            if schema.store.is_none() {
                schema.store = Some(Arc::clone(store));
            }
        }
        if let Some(formatter) = &self.formatter {
            schema.formatters.push(Arc::clone(formatter));
        }
        if let Some(customize) = &self.customize {
            customize(schema);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_by_id() {
        let reg = Registry::new();
        reg.register(ResourceSchema::new("widget", "x.io", "widgets", true));
        let r2 = reg.register(ResourceSchema::new("widget", "x.io", "widgets", false));
        let snap = reg.snapshot();
        assert_eq!(snap.revision, r2);
        assert_eq!(snap.len(), 1);
        assert!(!snap.get("widget").unwrap().namespaced);
    }

    #[test]
    fn registered_schemas_override_discovered() {
        let reg = Registry::new();
        reg.register(ResourceSchema::new("pod", "", "pods", false));
        reg.replace_discovered(vec![ResourceSchema::new("pod", "", "pods", true), ResourceSchema::new("secret", "", "secrets", true)]);
        let snap = reg.snapshot();
        assert_eq!(snap.ids().collect::<Vec<_>>(), vec!["pod", "secret"]);
        assert!(!snap.get("pod").unwrap().namespaced);

        reg.replace_discovered(vec![]);
        assert_eq!(reg.snapshot().ids().collect::<Vec<_>>(), vec!["pod"]);
    }

    #[test]
    fn old_snapshots_stay_intact() {
        let reg = Registry::new();
        reg.register(ResourceSchema::new("a", "", "as", true));
        let before = reg.snapshot();
        let mut rx = reg.subscribe();
        reg.register(ResourceSchema::new("b", "", "bs", true));
        assert_eq!(before.len(), 1);
        assert_eq!(reg.snapshot().len(), 2);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 2);
    }

    #[test]
    fn templates_match_by_id_or_all() {
        let mut s = ResourceSchema::new("configmap", "", "configmaps", true);
        assert!(!Template::for_id("secret").matches(&s.id));
        let t = Template::for_id("configmap").with_customize(|s| s.columns.clear());
        assert!(t.matches("configmap"));
        t.apply(&mut s);
        assert!(s.columns.is_empty());
        assert!(Template::for_all().matches("anything"));
    }
}
