//! Gantry API: the gateway front door.
//!
//! [`GatewayApi`] is what a routing layer (or the CLI) talks to. [`Gateway`] is the
//! in-process implementation: it owns the registry, the per-identity schema factory,
//! the summary cache and the discovery refresh, and dispatches every call to the store
//! of the schema it addresses.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use gantry_access::{AccessSetLookup, BindingSource};
use gantry_core::{ApiObject, ApiObjectList, GatewayError, GatewayResult, Identity, ListOptions, Verb, WatchSpec};
use gantry_kubehub::{find_resource, Backend, DiscoveredResource, Impersonation};
use gantry_schema::{crd_columns, ApiRequest, Column, Registry, ResourceSchema, SchemaFactory, SchemaView, Store};
use gantry_store::map_backend_error;
use gantry_summary::SummaryCache;
use gantry_watch::WatchFeed;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod config;
mod defaults;
mod routes;

pub use config::{GatewayConfig, DEFAULT_TRACK};
pub use defaults::{add_apply, default_schemas, default_templates, DropHelmData, PodState, MANAGED_CLUSTER_TYPE};
pub use routes::{Route, RouteParams};

const CRD_KEY: &str = "apiextensions.k8s.io/v1/CustomResourceDefinition";

/// One call into the gateway: who is asking, in which namespace, with which list
/// options, and the signal that ends the call.
#[derive(Debug, Clone)]
pub struct Call {
    pub identity: Identity,
    /// `None` addresses every namespace the caller may see.
    pub namespace: Option<String>,
    pub options: ListOptions,
    pub cancel: CancellationToken,
}

impl Call {
    pub fn new(identity: Identity) -> Self {
        Self { identity, namespace: None, options: ListOptions::default(), cancel: CancellationToken::new() }
    }

    pub fn in_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    pub fn with_options(mut self, options: ListOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The call narrowed to what a resolved route addresses.
    pub fn for_route(&self, route: &Route) -> Self { self.clone().in_namespace(route.namespace.clone().or_else(|| self.namespace.clone())) }
}

/// Uniform CRUD-plus-watch surface over every schema the caller can see.
#[async_trait::async_trait]
pub trait GatewayApi: Send + Sync {
    /// The caller's schema view. When the access set cannot be computed the caller
    /// gets an empty view, not an error.
    async fn resolve(&self, identity: &Identity) -> GatewayResult<Arc<SchemaView>>;

    /// Fetch one object by id (`namespace/name` or `name`).
    async fn by_id(&self, call: &Call, type_name: &str, id: &str) -> GatewayResult<ApiObject>;

    async fn list(&self, call: &Call, type_name: &str) -> GatewayResult<ApiObjectList>;

    async fn create(&self, call: &Call, type_name: &str, data: Value) -> GatewayResult<ApiObject>;

    async fn update(&self, call: &Call, type_name: &str, id: &str, data: Value) -> GatewayResult<ApiObject>;

    async fn delete(&self, call: &Call, type_name: &str, id: &str) -> GatewayResult<ApiObject>;

    /// Open an event feed for `spec.resource_type`. The feed lives until the call's
    /// cancellation fires or the feed is dropped.
    async fn watch(&self, call: &Call, spec: WatchSpec) -> GatewayResult<WatchFeed>;

    /// Run a named action attached to a schema.
    async fn action(&self, call: &Call, type_name: &str, action: &str, input: Value) -> GatewayResult<Value>;

    /// Rediscover backend kinds and republish the registry. Returns the new registry
    /// revision.
    async fn refresh_discovery(&self) -> GatewayResult<u64>;
}

/// In-process gateway over a [`Backend`].
pub struct Gateway {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
    factory: SchemaFactory,
    summary: SummaryCache,
    config: GatewayConfig,
    discovered: Mutex<Option<(Vec<DiscoveredResource>, HashMap<String, Vec<Column>>)>>,
}

impl Gateway {
    /// Register default schemas and templates, run a first discovery and start
    /// tracking the configured kinds. Must be called inside a tokio runtime.
    pub async fn start(backend: Arc<dyn Backend>, bindings: Arc<dyn BindingSource>, config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        let t0 = Instant::now();
        let lookup = Arc::new(AccessSetLookup::new(bindings, config.access_ttl));
        let registry = Arc::new(Registry::new());
        let factory = SchemaFactory::new(Arc::clone(&registry), lookup).with_view_cache(config.view_cache);
        let summary = SummaryCache::new(Arc::clone(&backend), config.summary());
        for schema in default_schemas(&backend, summary.handle()).await? {
            registry.register(schema);
        }
        for template in default_templates(&backend, summary.handle()) {
            factory.add_template(template);
        }
        let gateway = Arc::new(Self { backend, registry, factory, summary, config, discovered: Mutex::new(None) });
        let revision = gateway.refresh_discovery().await?;
        info!(revision, schemas = gateway.registry.snapshot().len(), took_ms = %t0.elapsed().as_millis(), "api: gateway started");
        Ok(gateway)
    }

    pub fn registry(&self) -> &Arc<Registry> { &self.registry }

    pub fn factory(&self) -> &SchemaFactory { &self.factory }

    pub fn lookup(&self) -> &Arc<AccessSetLookup> { self.factory.lookup() }

    pub fn summary(&self) -> &SummaryCache { &self.summary }

    pub fn config(&self) -> &GatewayConfig { &self.config }

    /// Refresh discovery every `refresh_interval` until `cancel` fires. Failures keep
    /// the previous schemas.
    pub fn spawn_refresh(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(gateway.config.refresh_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately; start() already refreshed
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if let Err(e) = gateway.refresh_discovery().await {
                    warn!(error = %e, "api: discovery refresh failed; keeping previous schemas");
                    metrics::increment_counter!("gateway_discovery_failures_total");
                }
            }
            debug!("api: discovery refresh stopped");
        })
    }

    /// Resolve the schema a call addresses and check the verb against it.
    /// `MethodNotAllowed` means the schema does not offer the verb; `Forbidden` means
    /// the caller may not use it.
    async fn dispatch(&self, call: &Call, type_name: &str, verb: Verb) -> GatewayResult<(ApiRequest, Arc<ResourceSchema>, Arc<dyn Store>)> {
        let view = self.resolve(&call.identity).await?;
        let Some(schema) = view.lookup(type_name).cloned() else {
            return Err(self.unknown_type(type_name));
        };
        if !schema.declares(verb) {
            return Err(GatewayError::MethodNotAllowed(format!("{} on {}", verb, schema.id)));
        }
        if !schema.permits(verb) {
            return Err(GatewayError::forbidden(format!("{} may not {} {}", call.identity, verb, schema.id)));
        }
        let store = schema.store.clone().ok_or_else(|| GatewayError::MethodNotAllowed(format!("{} has no store", schema.id)))?;
        let req = ApiRequest::new(view, call.cancel.clone()).with_namespace(call.namespace.clone()).with_options(call.options.clone());
        req.check_cancelled()?;
        Ok((req, schema, store))
    }

    /// Types hidden from the caller are forbidden; types nobody serves are not found.
    fn unknown_type(&self, type_name: &str) -> GatewayError {
        let wanted = type_name.to_lowercase();
        let snapshot = self.registry.snapshot();
        if snapshot.iter().any(|s| s.id.to_lowercase() == wanted || s.plural_id() == wanted) {
            GatewayError::forbidden(format!("type {}", type_name))
        } else {
            GatewayError::not_found(format!("type {}", type_name))
        }
    }

    /// Printer columns from CRDs. Failures only cost the custom columns.
    async fn crd_columns(&self, resources: &[DiscoveredResource]) -> HashMap<String, Vec<Column>> {
        let Ok(crd) = find_resource(resources, CRD_KEY) else { return HashMap::new() };
        let mut items = Vec::new();
        let mut opts = ListOptions { limit: Some(500), ..Default::default() };
        loop {
            match self.backend.list(&Impersonation::Admin, crd, None, &opts).await {
                Ok(page) => {
                    items.extend(page.items);
                    match page.continue_token {
                        Some(token) => opts.continue_token = Some(token),
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "api: listing CRDs failed; default columns only");
                    return HashMap::new();
                }
            }
        }
        crd_columns(&items)
    }

    /// Track configured kinds that are served, forget kinds that went away.
    async fn sync_tracking(&self, resources: &[DiscoveredResource]) {
        let mut wanted = BTreeSet::new();
        for res in resources {
            let key = res.gvk_key();
            if self.config.tracks(&key, &res.type_name()) && res.supports("list") && res.supports("watch") {
                self.summary.track(res.clone());
                wanted.insert(key);
            }
        }
        for key in self.summary.tracked() {
            if !wanted.contains(&key) {
                info!(gvk = %key, "api: kind no longer served; untracking");
                self.summary.untrack(&key).await;
            }
        }
    }
}

fn record<T>(op: &'static str, type_name: &str, t0: Instant, res: &GatewayResult<T>) {
    metrics::histogram!("gateway_request_seconds", t0.elapsed().as_secs_f64(), "op" => op);
    match res {
        Ok(_) => debug!(op, type_name, took_ms = %t0.elapsed().as_millis(), "api: ok"),
        Err(e) => {
            metrics::increment_counter!("gateway_errors_total", "op" => op, "kind" => e.kind());
            debug!(op, type_name, error = %e, took_ms = %t0.elapsed().as_millis(), "api: failed");
        }
    }
}

#[async_trait::async_trait]
impl GatewayApi for Gateway {
    async fn resolve(&self, identity: &Identity) -> GatewayResult<Arc<SchemaView>> {
        match self.factory.for_identity(identity).await {
            Err(GatewayError::AuthorizationUnavailable(msg)) => {
                warn!(identity = %identity, error = %msg, "api: access set unavailable; denying all");
                metrics::increment_counter!("gateway_authorization_unavailable_total");
                Ok(self.factory.deny_all(identity))
            }
            other => other,
        }
    }

    async fn by_id(&self, call: &Call, type_name: &str, id: &str) -> GatewayResult<ApiObject> {
        let t0 = Instant::now();
        let res = async {
            let (req, schema, store) = self.dispatch(call, type_name, Verb::Get).await?;
            store.by_id(&req, &schema, id).await
        }
        .await;
        record("get", type_name, t0, &res);
        res
    }

    async fn list(&self, call: &Call, type_name: &str) -> GatewayResult<ApiObjectList> {
        let t0 = Instant::now();
        let res = async {
            let (req, schema, store) = self.dispatch(call, type_name, Verb::List).await?;
            store.list(&req, &schema).await
        }
        .await;
        record("list", type_name, t0, &res);
        res
    }

    async fn create(&self, call: &Call, type_name: &str, data: Value) -> GatewayResult<ApiObject> {
        let t0 = Instant::now();
        let res = async {
            let (req, schema, store) = self.dispatch(call, type_name, Verb::Create).await?;
            store.create(&req, &schema, data).await
        }
        .await;
        record("create", type_name, t0, &res);
        res
    }

    async fn update(&self, call: &Call, type_name: &str, id: &str, data: Value) -> GatewayResult<ApiObject> {
        let t0 = Instant::now();
        let res = async {
            let (req, schema, store) = self.dispatch(call, type_name, Verb::Update).await?;
            store.update(&req, &schema, id, data).await
        }
        .await;
        record("update", type_name, t0, &res);
        res
    }

    async fn delete(&self, call: &Call, type_name: &str, id: &str) -> GatewayResult<ApiObject> {
        let t0 = Instant::now();
        let res = async {
            let (req, schema, store) = self.dispatch(call, type_name, Verb::Delete).await?;
            store.delete(&req, &schema, id).await
        }
        .await;
        record("delete", type_name, t0, &res);
        res
    }

    async fn watch(&self, call: &Call, spec: WatchSpec) -> GatewayResult<WatchFeed> {
        let t0 = Instant::now();
        let call = call.clone().in_namespace(spec.namespace.clone().or_else(|| call.namespace.clone()));
        let res = async {
            let (req, schema, store) = self.dispatch(&call, &spec.resource_type, Verb::Watch).await?;
            store.watch(&req, &schema, &spec).await
        }
        .await;
        record("watch", &spec.resource_type, t0, &res);
        if res.is_ok() {
            metrics::increment_counter!("gateway_watches_total");
        }
        res
    }

    async fn action(&self, call: &Call, type_name: &str, action: &str, input: Value) -> GatewayResult<Value> {
        let t0 = Instant::now();
        let res = async {
            let view = self.resolve(&call.identity).await?;
            let Some(schema) = view.lookup(type_name).cloned() else {
                return Err(self.unknown_type(type_name));
            };
            let handler = schema
                .actions
                .get(action)
                .cloned()
                .ok_or_else(|| GatewayError::not_found(format!("action {} on {}", action, schema.id)))?;
            let req = ApiRequest::new(view, call.cancel.clone()).with_namespace(call.namespace.clone());
            req.check_cancelled()?;
            handler.run(&req, &schema, input).await
        }
        .await;
        record("action", type_name, t0, &res);
        res
    }

    async fn refresh_discovery(&self) -> GatewayResult<u64> {
        let t0 = Instant::now();
        let resources = self.backend.discover().await.map_err(map_backend_error)?;
        let columns = self.crd_columns(&resources).await;
        let unchanged = {
            let last = self.discovered.lock().unwrap_or_else(|e| e.into_inner());
            last.as_ref().map_or(false, |(r, c)| *r == resources && *c == columns)
        };
        let revision = if unchanged {
            self.registry.revision()
        } else {
            let schemas = resources
                .iter()
                .map(|res| {
                    let mut schema = ResourceSchema::from_discovered(res);
                    if let Some(cols) = columns.get(&res.gvk_key()) {
                        schema.columns = cols.clone();
                    }
                    schema
                })
                .collect();
            let revision = self.registry.replace_discovered(schemas);
            *self.discovered.lock().unwrap_or_else(|e| e.into_inner()) = Some((resources.clone(), columns));
            revision
        };
        self.sync_tracking(&resources).await;
        metrics::increment_counter!("gateway_discovery_refreshes_total", "changed" => if unchanged { "false" } else { "true" });
        info!(kinds = resources.len(), revision, changed = !unchanged, took_ms = %t0.elapsed().as_millis(), "api: discovery refreshed");
        Ok(revision)
    }
}
