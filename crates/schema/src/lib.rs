//! Gantry schema: the resource schemas the gateway serves, the store contract every
//! schema is backed by, the process-wide registry and the per-identity views built
//! from it.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use gantry_access::AccessSet;
use gantry_core::{ApiObject, ApiObjectList, GatewayError, GatewayResult, Gvk, Identity, ListOptions, Verb, WatchSpec};
use gantry_kubehub::DiscoveredResource;
use gantry_watch::WatchFeed;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

mod columns;
mod factory;
mod registry;

pub use columns::{crd_columns, default_columns, normalize_json_path, Column};
pub use factory::{SchemaFactory, SchemaView, DEFAULT_VIEW_CACHE};
pub use registry::{Registry, RegistrySnapshot, Template};

/// HTTP methods a schema answers on its collection or resource URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Which URL a verb is served on, and with which method.
pub fn method_for(verb: Verb) -> (bool, Method) {
    match verb {
        Verb::List | Verb::Watch => (true, Method::Get),
        Verb::Create => (true, Method::Post),
        Verb::Get => (false, Method::Get),
        Verb::Update => (false, Method::Put),
        Verb::Patch => (false, Method::Patch),
        Verb::Delete => (false, Method::Delete),
    }
}

/// Uniform read/write/watch contract. Operations a store does not support answer
/// `MethodNotAllowed`.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn by_id(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        let _ = (req, id);
        Err(GatewayError::MethodNotAllowed(format!("get on {}", schema.id)))
    }

    async fn list(&self, req: &ApiRequest, schema: &ResourceSchema) -> GatewayResult<ApiObjectList> {
        let _ = req;
        Err(GatewayError::MethodNotAllowed(format!("list on {}", schema.id)))
    }

    async fn create(&self, req: &ApiRequest, schema: &ResourceSchema, data: Value) -> GatewayResult<ApiObject> {
        let _ = (req, data);
        Err(GatewayError::MethodNotAllowed(format!("create on {}", schema.id)))
    }

    async fn update(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str, data: Value) -> GatewayResult<ApiObject> {
        let _ = (req, id, data);
        Err(GatewayError::MethodNotAllowed(format!("update on {}", schema.id)))
    }

    async fn delete(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        let _ = (req, id);
        Err(GatewayError::MethodNotAllowed(format!("delete on {}", schema.id)))
    }

    async fn watch(&self, req: &ApiRequest, schema: &ResourceSchema, spec: &WatchSpec) -> GatewayResult<WatchFeed> {
        let _ = (req, spec);
        Err(GatewayError::MethodNotAllowed(format!("watch on {}", schema.id)))
    }
}

/// Named operation attached to a schema, beyond CRUD.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, req: &ApiRequest, schema: &ResourceSchema, input: Value) -> GatewayResult<Value>;
}

/// Rewrites objects on their way out.
pub trait Formatter: Send + Sync {
    fn format(&self, req: &ApiRequest, object: &mut ApiObject);
}

/// One servable resource type. Published schemas are shared through `Arc` and never
/// mutated; views and templates work on copies.
#[derive(Clone)]
pub struct ResourceSchema {
    /// Type name: `pod`, `apps.deployment`.
    pub id: String,
    pub gvk: Option<Gvk>,
    /// API group and plural resource, the coordinates access rules are written in.
    pub group: String,
    pub plural: String,
    pub namespaced: bool,
    pub collection_methods: BTreeSet<Method>,
    pub resource_methods: BTreeSet<Method>,
    /// Verbs granted to every caller regardless of bindings.
    pub static_access: BTreeSet<Verb>,
    /// Verbs the current caller holds; filled in per view.
    pub allowed_verbs: BTreeSet<Verb>,
    pub store: Option<Arc<dyn Store>>,
    pub actions: BTreeMap<String, Arc<dyn ActionHandler>>,
    pub formatters: Vec<Arc<dyn Formatter>>,
    pub columns: Vec<Column>,
}

impl fmt::Debug for ResourceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSchema")
            .field("id", &self.id)
            .field("gvk", &self.gvk)
            .field("plural", &self.plural)
            .field("namespaced", &self.namespaced)
            .field("collection_methods", &self.collection_methods)
            .field("resource_methods", &self.resource_methods)
            .field("allowed_verbs", &self.allowed_verbs)
            .field("store", &self.store.is_some())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceSchema {
    pub fn new(id: impl Into<String>, group: impl Into<String>, plural: impl Into<String>, namespaced: bool) -> Self {
        Self {
            id: id.into(),
            gvk: None,
            group: group.into(),
            plural: plural.into(),
            namespaced,
            collection_methods: BTreeSet::new(),
            resource_methods: BTreeSet::new(),
            static_access: BTreeSet::new(),
            allowed_verbs: BTreeSet::new(),
            store: None,
            actions: BTreeMap::new(),
            formatters: Vec::new(),
            columns: default_columns(namespaced),
        }
    }

    /// Schema for a discovered backend kind; methods follow the verbs the control
    /// plane advertises.
    pub fn from_discovered(res: &DiscoveredResource) -> Self {
        let mut schema = Self::new(res.type_name(), res.group.clone(), res.plural.clone(), res.namespaced);
        schema.gvk = Some(res.gvk());
        for verb in Verb::ALL {
            if res.supports(verb.as_str()) {
                schema.declare(verb);
            }
        }
        schema
    }

    pub fn with_gvk(mut self, gvk: Gvk) -> Self {
        self.gvk = Some(gvk);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_methods(mut self, collection: impl IntoIterator<Item = Method>, resource: impl IntoIterator<Item = Method>) -> Self {
        self.collection_methods = collection.into_iter().collect();
        self.resource_methods = resource.into_iter().collect();
        self
    }

    pub fn with_static_access(mut self, verbs: impl IntoIterator<Item = Verb>) -> Self {
        self.static_access.extend(verbs);
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.actions.insert(name.into(), handler);
        self
    }

    /// Declare that the store serves `verb`.
    pub fn declare(&mut self, verb: Verb) {
        match method_for(verb) {
            (true, m) => self.collection_methods.insert(m),
            (false, m) => self.resource_methods.insert(m),
        };
    }

    pub fn declares(&self, verb: Verb) -> bool {
        match method_for(verb) {
            (true, m) => self.collection_methods.contains(&m),
            (false, m) => self.resource_methods.contains(&m),
        }
    }

    pub fn permits(&self, verb: Verb) -> bool { self.allowed_verbs.contains(&verb) }

    /// Declared methods the caller may actually use.
    pub fn effective_methods(&self) -> (BTreeSet<Method>, BTreeSet<Method>) {
        let mut collection = BTreeSet::new();
        let mut resource = BTreeSet::new();
        for verb in self.allowed_verbs.iter().copied().filter(|v| self.declares(*v)) {
            match method_for(verb) {
                (true, m) => collection.insert(m),
                (false, m) => resource.insert(m),
            };
        }
        (collection, resource)
    }

    /// Plural identifier: `pods`, `apps.deployments`.
    pub fn plural_id(&self) -> String {
        if self.group.is_empty() {
            self.plural.to_lowercase()
        } else {
            format!("{}.{}", self.group, self.plural).to_lowercase()
        }
    }

    pub fn format(&self, req: &ApiRequest, object: &mut ApiObject) {
        for f in &self.formatters {
            f.format(req, object);
        }
    }
}

/// One API call as seen by a store: the caller's view, the namespace scope and the
/// request's cancellation signal.
#[derive(Clone)]
pub struct ApiRequest {
    pub view: Arc<SchemaView>,
    /// `None` is every namespace the caller may see.
    pub namespace: Option<String>,
    pub options: ListOptions,
    pub cancel: CancellationToken,
}

impl ApiRequest {
    pub fn new(view: Arc<SchemaView>, cancel: CancellationToken) -> Self {
        Self { view, namespace: None, options: ListOptions::default(), cancel }
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    pub fn with_options(mut self, options: ListOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identity(&self) -> &Identity { self.view.identity() }

    pub fn access(&self) -> &AccessSet { self.view.access() }

    pub fn check_cancelled(&self) -> GatewayResult<()> {
        if self.cancel.is_cancelled() {
            Err(GatewayError::Cancelled)
        } else {
            Ok(())
        }
    }
}
