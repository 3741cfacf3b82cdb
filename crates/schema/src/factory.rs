use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use gantry_access::{AccessSet, AccessSetLookup};
use gantry_core::{GatewayResult, Identity, Verb};
use tracing::debug;

use crate::{Registry, RegistrySnapshot, ResourceSchema, Template};

pub const DEFAULT_VIEW_CACHE: usize = 1024;

/// The schemas one identity may use, with effective methods and templates applied.
#[derive(Debug)]
pub struct SchemaView {
    identity: Identity,
    access: Arc<AccessSet>,
    revision: u64,
    schemas: BTreeMap<String, Arc<ResourceSchema>>,
}

impl SchemaView {
    /// Case-insensitive lookup by type name or plural id (`pods`, `apps.deployments`).
    pub fn lookup(&self, name: &str) -> Option<&Arc<ResourceSchema>> {
        let name = name.to_lowercase();
        self.schemas.get(&name).or_else(|| self.schemas.values().find(|s| s.plural_id() == name))
    }

    pub fn identity(&self) -> &Identity { &self.identity }

    pub fn access(&self) -> &AccessSet { &self.access }

    pub fn access_arc(&self) -> &Arc<AccessSet> { &self.access }

    /// Registry revision the view was built from.
    pub fn revision(&self) -> u64 { self.revision }

    pub fn ids(&self) -> impl Iterator<Item = &str> { self.schemas.keys().map(String::as_str) }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceSchema>> { self.schemas.values() }

    pub fn len(&self) -> usize { self.schemas.len() }

    pub fn is_empty(&self) -> bool { self.schemas.is_empty() }
}

struct CachedView {
    access: Arc<AccessSet>,
    registry_revision: u64,
    template_revision: u64,
    view: Arc<SchemaView>,
}

/// Builds per-identity [`SchemaView`]s from the registry and the access lookup.
pub struct SchemaFactory {
    registry: Arc<Registry>,
    lookup: Arc<AccessSetLookup>,
    templates: RwLock<Vec<Arc<Template>>>,
    template_revision: AtomicU64,
    views: Mutex<HashMap<Identity, CachedView>>,
    max_views: usize,
}

impl SchemaFactory {
    pub fn new(registry: Arc<Registry>, lookup: Arc<AccessSetLookup>) -> Self {
        Self {
            registry,
            lookup,
            templates: RwLock::new(Vec::new()),
            template_revision: AtomicU64::new(0),
            views: Mutex::new(HashMap::new()),
            max_views: DEFAULT_VIEW_CACHE,
        }
    }

    pub fn with_view_cache(mut self, max_views: usize) -> Self {
        self.max_views = max_views.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> { &self.registry }

    pub fn lookup(&self) -> &Arc<AccessSetLookup> { &self.lookup }

    /// Templates apply in the order they were added.
    pub fn add_template(&self, template: Template) {
        self.templates.write().unwrap_or_else(|e| e.into_inner()).push(Arc::new(template));
        self.template_revision.fetch_add(1, Ordering::AcqRel);
    }

    pub fn template_count(&self) -> usize { self.templates.read().unwrap_or_else(|e| e.into_inner()).len() }

    /// The identity's view. Fails only when its access set cannot be computed.
    pub async fn for_identity(&self, identity: &Identity) -> GatewayResult<Arc<SchemaView>> {
        let access = self.lookup.compute(identity).await?;
        let snapshot = self.registry.snapshot();
        let template_revision = self.template_revision.load(Ordering::Acquire);
        {
            let views = self.views.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = views.get(identity) {
                if Arc::ptr_eq(&cached.access, &access)
                    && cached.registry_revision == snapshot.revision
                    && cached.template_revision == template_revision
                {
                    metrics::increment_counter!("schema_views_total", "result" => "hit");
                    return Ok(Arc::clone(&cached.view));
                }
            }
        }
        metrics::increment_counter!("schema_views_total", "result" => "miss");
        let view = Arc::new(self.build(identity, Arc::clone(&access), &snapshot));
        let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
        if views.len() >= self.max_views && !views.contains_key(identity) {
            views.clear();
        }
        views.insert(identity.clone(), CachedView { access, registry_revision: snapshot.revision, template_revision, view: Arc::clone(&view) });
        Ok(view)
    }

    /// Build a view for an explicit access set, bypassing lookup and cache.
    pub fn view_for(&self, identity: &Identity, access: Arc<AccessSet>) -> Arc<SchemaView> {
        Arc::new(self.build(identity, access, &self.registry.snapshot()))
    }

    /// A view with no schemas at all, static access included. Used when the caller's
    /// access set cannot be computed.
    pub fn deny_all(&self, identity: &Identity) -> Arc<SchemaView> {
        Arc::new(SchemaView {
            identity: identity.clone(),
            access: Arc::new(AccessSet::empty()),
            revision: self.registry.revision(),
            schemas: BTreeMap::new(),
        })
    }

    fn build(&self, identity: &Identity, access: Arc<AccessSet>, snapshot: &RegistrySnapshot) -> SchemaView {
        let t0 = Instant::now();
        let templates: Vec<Arc<Template>> = self.templates.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut schemas = BTreeMap::new();
        for shared in snapshot.iter() {
            let mut granted: BTreeSet<Verb> = access.verbs_for(&shared.group, &shared.plural);
            granted.extend(shared.static_access.iter().copied());
            if granted.is_empty() {
                continue;
            }
            let mut schema = ResourceSchema::clone(shared);
            schema.allowed_verbs = granted;
            for t in templates.iter() {
                if t.matches(&schema.id) {
                    t.apply(&mut schema);
                }
            }
            schemas.insert(schema.id.to_lowercase(), Arc::new(schema));
        }
        debug!(
            identity = %identity,
            visible = schemas.len(),
            total = snapshot.len(),
            took_us = %t0.elapsed().as_micros(),
            "schema: view built"
        );
        SchemaView { identity: identity.clone(), access, revision: snapshot.revision, schemas }
    }
}
