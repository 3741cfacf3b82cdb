use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use gantry_access::Partition;
use gantry_core::{split_id, ApiEvent, ApiObject, ApiObjectList, GatewayError, GatewayResult, ListOptions, Verb, WatchSpec};
use gantry_kubehub::{Backend, DiscoveredResource, Impersonation, RawEvent, RawEventStream, RawList};
use gantry_schema::{ApiRequest, ResourceSchema, Store};
use gantry_summary::{ObjectKey, SummaryHandle};
use gantry_watch::{Multiplexer, WatchFeed};
use serde_json::Value;
use tracing::debug;

use crate::{map_backend_error, resource_of};

/// Clean backend watch ends in a row, without any event between them, before a
/// source gives up.
const MAX_IDLE_RESUMES: u32 = 5;

/// Forwards every operation to the control plane with the caller's privileges.
/// One instance serves every discovered schema.
pub struct ProxyStore {
    backend: Arc<dyn Backend>,
    summary: Option<SummaryHandle>,
}

impl ProxyStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self { Self { backend, summary: None } }

    /// Decorate objects with `metadata.state` and `metadata.relationships`.
    pub fn with_summary(mut self, summary: SummaryHandle) -> Self {
        self.summary = Some(summary);
        self
    }

    fn wrap(&self, req: &ApiRequest, schema: &ResourceSchema, raw: Value) -> ApiObject {
        wrap(self.summary.as_ref(), req, schema, raw)
    }

    async fn list_partition(
        &self,
        req: &ApiRequest,
        res: &DiscoveredResource,
        part: &Partition,
        limit: Option<u32>,
        continue_token: Option<String>,
    ) -> GatewayResult<RawList> {
        let namespace = part.namespace.as_deref();
        let call = async {
            match &part.names {
                None => {
                    let opts = ListOptions { limit, continue_token, ..req.options.clone() };
                    self.backend.list(&Impersonation::User(req.identity().clone()), res, namespace, &opts).await
                }
                // Listing is never granted per name, so read as the gateway and keep
                // only the granted names.
                Some(names) => {
                    let opts = ListOptions { limit: None, continue_token: None, ..req.options.clone() };
                    let mut page = self.backend.list(&Impersonation::Admin, res, namespace, &opts).await?;
                    page.items.retain(|o| gantry_core::meta_str(o, "name").map_or(false, |n| names.contains(n)));
                    page.continue_token = None;
                    Ok(page)
                }
            }
        };
        tokio::select! {
            biased;
            _ = req.cancel.cancelled() => Err(GatewayError::Cancelled),
            page = call => page.map_err(map_backend_error),
        }
    }
}

fn wrap(summary: Option<&SummaryHandle>, req: &ApiRequest, schema: &ResourceSchema, raw: Value) -> ApiObject {
    let mut obj = ApiObject::from_raw(schema.id.clone(), raw);
    if let (Some(summary), Some(gvk)) = (summary, schema.gvk.as_ref()) {
        let snap = summary.current();
        let key = ObjectKey::new(gvk.key(), obj.namespace(), obj.name().unwrap_or_default());
        if let Some(entry) = snap.get(&key) {
            let relationships = serde_json::to_value(snap.relationships(&key)).unwrap_or(Value::Null);
            if let Some(meta) = obj.object.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert(
                    "state".into(),
                    serde_json::json!({
                        "name": entry.summary.state,
                        "error": entry.summary.error,
                        "transitioning": entry.summary.transitioning,
                        "message": entry.summary.message.clone().unwrap_or_default(),
                    }),
                );
                meta.insert("relationships".into(), relationships);
            }
        }
    }
    schema.format(req, &mut obj);
    obj
}

fn authorize(req: &ApiRequest, schema: &ResourceSchema, verb: Verb, namespace: Option<&str>, name: Option<&str>) -> GatewayResult<()> {
    if req.access().grants(verb, &schema.group, &schema.plural, namespace, name) {
        return Ok(());
    }
    metrics::increment_counter!("proxy_denied_total", "verb" => verb.as_str());
    let target = match (namespace, name) {
        (Some(ns), Some(n)) => format!("{}/{}", ns, n),
        (None, Some(n)) => n.to_string(),
        (Some(ns), None) => format!("in namespace {}", ns),
        (None, None) => "at cluster scope".to_string(),
    };
    Err(GatewayError::forbidden(format!("{} cannot {} {} {}", req.identity(), verb.as_str(), schema.id, target)))
}

/// `(namespace, name)` addressed by `id`; namespaced kinds fall back to the request's
/// namespace.
fn object_scope<'a>(req: &'a ApiRequest, schema: &ResourceSchema, id: &'a str) -> GatewayResult<(Option<&'a str>, &'a str)> {
    let (namespace, name) = split_id(id);
    if name.is_empty() {
        return Err(GatewayError::Invalid(format!("empty {} id", schema.id)));
    }
    if !schema.namespaced {
        return Ok((None, name));
    }
    let namespace = namespace
        .or(req.namespace.as_deref())
        .ok_or_else(|| GatewayError::Invalid(format!("{} {} needs a namespace", schema.id, id)))?;
    Ok((Some(namespace), name))
}

/// Visible slices of a collection. Namespaced grants never reach cluster-scoped kinds.
fn partitions(req: &ApiRequest, schema: &ResourceSchema, verb: Verb, namespace: Option<&str>) -> Vec<Partition> {
    let namespace = if schema.namespaced { namespace } else { None };
    let mut parts = req.access().partitions(verb, &schema.group, &schema.plural, namespace);
    if !schema.namespaced {
        parts.retain(|p| p.namespace.is_none());
    }
    parts
}

fn encode_cursor(parts: usize, index: usize, inner: Option<String>) -> String {
    if parts == 1 {
        inner.unwrap_or_default()
    } else {
        format!("{}:{}", index, inner.unwrap_or_default())
    }
}

fn decode_cursor(parts: usize, token: Option<&str>) -> GatewayResult<(usize, Option<String>)> {
    let Some(token) = token.filter(|t| !t.is_empty()) else { return Ok((0, None)) };
    if parts == 1 {
        return Ok((0, Some(token.to_string())));
    }
    let (index, inner) = token.split_once(':').ok_or_else(|| GatewayError::Invalid(format!("malformed continue token {:?}", token)))?;
    let index: usize = index.parse().map_err(|_| GatewayError::Invalid(format!("malformed continue token {:?}", token)))?;
    Ok((index, Some(inner.to_string()).filter(|s| !s.is_empty())))
}

fn observe<T>(op: &'static str, t0: Instant, result: GatewayResult<T>) -> GatewayResult<T> {
    metrics::histogram!("proxy_request_seconds", t0.elapsed().as_secs_f64(), "op" => op);
    if let Err(e) = &result {
        metrics::counter!("proxy_errors_total", 1u64, "op" => op, "kind" => e.kind());
        debug!(op, error = %e, "proxy: request failed");
    }
    result
}

impl ProxyStore {
    async fn get_object(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        req.check_cancelled()?;
        let res = resource_of(schema)?;
        let (namespace, name) = object_scope(req, schema, id)?;
        authorize(req, schema, Verb::Get, namespace, Some(name))?;
        let who = Impersonation::User(req.identity().clone());
        let raw = tokio::select! {
            biased;
            _ = req.cancel.cancelled() => return Err(GatewayError::Cancelled),
            raw = self.backend.get(&who, &res, namespace, name) => raw.map_err(map_backend_error)?,
        };
        Ok(self.wrap(req, schema, raw))
    }

    async fn list_objects(&self, req: &ApiRequest, schema: &ResourceSchema) -> GatewayResult<ApiObjectList> {
        let t0 = Instant::now();
        req.check_cancelled()?;
        let res = resource_of(schema)?;
        let parts = partitions(req, schema, Verb::List, req.namespace.as_deref());
        if parts.is_empty() {
            // Nothing visible: an explicit namespace is denied, "all namespaces" is just empty.
            if schema.namespaced && req.namespace.is_some() {
                authorize(req, schema, Verb::List, req.namespace.as_deref(), None)?;
            }
            return Ok(ApiObjectList::default());
        }
        let (start, mut inner) = decode_cursor(parts.len(), req.options.continue_token.as_deref())?;
        // Zero means no limit, as on the Kubernetes API.
        let mut remaining = req.options.limit.filter(|n| *n > 0);
        let mut out = ApiObjectList::default();
        let mut seen = HashSet::new();
        for (index, part) in parts.iter().enumerate().skip(start) {
            let page = self.list_partition(req, &res, part, remaining, inner.take()).await?;
            if out.revision.is_none() {
                out.revision = page.resource_version.clone();
            }
            let fetched = page.items.len() as u32;
            for raw in page.items {
                let obj = self.wrap(req, schema, raw);
                // Partitions overlap when wildcard and named grants coexist
                if seen.insert(obj.id.clone()) {
                    out.objects.push(obj);
                }
            }
            if let Some(r) = remaining.as_mut() {
                *r = r.saturating_sub(fetched);
            }
            if let Some(token) = page.continue_token.filter(|t| !t.is_empty()) {
                out.continue_token = Some(encode_cursor(parts.len(), index, Some(token)));
                break;
            }
            if remaining == Some(0) {
                if index + 1 < parts.len() {
                    out.continue_token = Some(encode_cursor(parts.len(), index + 1, None));
                }
                break;
            }
        }
        debug!(
            schema = %schema.id,
            identity = %req.identity(),
            partitions = parts.len(),
            items = out.len(),
            took_ms = %t0.elapsed().as_millis(),
            "proxy: list"
        );
        Ok(out)
    }

    async fn create_object(&self, req: &ApiRequest, schema: &ResourceSchema, data: Value) -> GatewayResult<ApiObject> {
        req.check_cancelled()?;
        let res = resource_of(schema)?;
        let namespace = if schema.namespaced {
            let ns = gantry_core::meta_str(&data, "namespace").filter(|s| !s.is_empty()).or(req.namespace.as_deref());
            Some(ns.ok_or_else(|| GatewayError::Invalid(format!("{} needs a namespace", schema.id)))?.to_string())
        } else {
            None
        };
        authorize(req, schema, Verb::Create, namespace.as_deref(), None)?;
        let who = Impersonation::User(req.identity().clone());
        let raw = self.backend.create(&who, &res, namespace.as_deref(), data).await.map_err(map_backend_error)?;
        Ok(self.wrap(req, schema, raw))
    }

    async fn update_object(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str, mut data: Value) -> GatewayResult<ApiObject> {
        req.check_cancelled()?;
        let res = resource_of(schema)?;
        let (namespace, name) = object_scope(req, schema, id)?;
        authorize(req, schema, Verb::Update, namespace, Some(name))?;
        if let Some(meta) = data.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("name".into(), Value::String(name.to_string()));
            if let Some(ns) = namespace {
                meta.insert("namespace".into(), Value::String(ns.to_string()));
            }
        }
        let who = Impersonation::User(req.identity().clone());
        let raw = self.backend.update(&who, &res, namespace, name, data).await.map_err(map_backend_error)?;
        Ok(self.wrap(req, schema, raw))
    }

    async fn delete_object(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        req.check_cancelled()?;
        let res = resource_of(schema)?;
        let (namespace, name) = object_scope(req, schema, id)?;
        authorize(req, schema, Verb::Delete, namespace, Some(name))?;
        let who = Impersonation::User(req.identity().clone());
        let gone = self.backend.delete(&who, &res, namespace, name).await.map_err(map_backend_error)?;
        Ok(match gone {
            Some(raw) => self.wrap(req, schema, raw),
            None => {
                let mut meta = serde_json::json!({ "name": name });
                if let Some(ns) = namespace {
                    meta["namespace"] = Value::String(ns.to_string());
                }
                ApiObject::from_raw(schema.id.clone(), serde_json::json!({ "metadata": meta }))
            }
        })
    }
}

#[async_trait::async_trait]
impl Store for ProxyStore {
    async fn by_id(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        let t0 = Instant::now();
        observe("get", t0, self.get_object(req, schema, id).await)
    }

    async fn list(&self, req: &ApiRequest, schema: &ResourceSchema) -> GatewayResult<ApiObjectList> {
        let t0 = Instant::now();
        observe("list", t0, self.list_objects(req, schema).await)
    }

    async fn create(&self, req: &ApiRequest, schema: &ResourceSchema, data: Value) -> GatewayResult<ApiObject> {
        let t0 = Instant::now();
        observe("create", t0, self.create_object(req, schema, data).await)
    }

    async fn update(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str, data: Value) -> GatewayResult<ApiObject> {
        let t0 = Instant::now();
        observe("update", t0, self.update_object(req, schema, id, data).await)
    }

    async fn delete(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        let t0 = Instant::now();
        observe("delete", t0, self.delete_object(req, schema, id).await)
    }

    async fn watch(&self, req: &ApiRequest, schema: &ResourceSchema, spec: &WatchSpec) -> GatewayResult<WatchFeed> {
        req.check_cancelled()?;
        let res = resource_of(schema)?;
        let namespace = spec.namespace.as_deref().filter(|s| !s.is_empty()).or(req.namespace.as_deref());
        let parts = partitions(req, schema, Verb::Watch, namespace);
        if parts.is_empty() {
            authorize(req, schema, Verb::Watch, namespace, None)?;
        }
        let shared = Arc::new(schema.clone());
        let mut mux = Multiplexer::new(&req.cancel, schema.id.clone());
        for part in parts {
            let who = match part.names {
                None => Impersonation::User(req.identity().clone()),
                Some(_) => Impersonation::Admin,
            };
            let opts = spec.list_options();
            let stream = self.backend.watch(&who, &res, part.namespace.as_deref(), &opts).await.map_err(map_backend_error)?;
            let source = WatchSource {
                backend: Arc::clone(&self.backend),
                summary: self.summary.clone(),
                req: req.clone(),
                schema: Arc::clone(&shared),
                res: res.clone(),
                who,
                namespace: part.namespace,
                names: part.names,
                last_rv: opts.resource_version.clone(),
                opts,
                stream: Some(stream),
                idle_resumes: 0,
            };
            mux.add_source(source.into_stream());
        }
        debug!(schema = %schema.id, identity = %req.identity(), sources = mux.source_count(), "proxy: watch started");
        Ok(mux.start())
    }
}

/// One backend watch, resumed from the last seen resource version when the backend
/// ends it cleanly.
struct WatchSource {
    backend: Arc<dyn Backend>,
    summary: Option<SummaryHandle>,
    req: ApiRequest,
    schema: Arc<ResourceSchema>,
    res: DiscoveredResource,
    who: Impersonation,
    namespace: Option<String>,
    names: Option<BTreeSet<String>>,
    opts: ListOptions,
    last_rv: Option<String>,
    stream: Option<RawEventStream>,
    idle_resumes: u32,
}

impl WatchSource {
    fn event(&self, raw: RawEvent) -> Option<ApiEvent> {
        let (obj, ctor): (Value, fn(ApiObject) -> ApiEvent) = match raw {
            RawEvent::Added(o) => (o, ApiEvent::created),
            RawEvent::Modified(o) => (o, ApiEvent::updated),
            RawEvent::Deleted(o) => (o, ApiEvent::deleted),
            RawEvent::Bookmark(_) => return None,
        };
        if let Some(names) = &self.names {
            let name = gantry_core::meta_str(&obj, "name")?;
            if !names.contains(name) {
                return None;
            }
        }
        Some(ctor(wrap(self.summary.as_ref(), &self.req, &self.schema, obj)))
    }

    async fn resume(&mut self) -> GatewayResult<()> {
        let opts = ListOptions { resource_version: self.last_rv.clone(), ..self.opts.clone() };
        let stream = self.backend.watch(&self.who, &self.res, self.namespace.as_deref(), &opts).await.map_err(map_backend_error)?;
        debug!(schema = %self.schema.id, resource_version = ?self.last_rv, "proxy: watch resumed");
        self.stream = Some(stream);
        Ok(())
    }

    fn into_stream(self) -> impl futures::Stream<Item = GatewayResult<ApiEvent>> + Send + 'static {
        futures::stream::unfold(Some(self), |state| async move {
            let mut st = state?;
            loop {
                if st.stream.is_none() {
                    if st.idle_resumes >= MAX_IDLE_RESUMES {
                        return None;
                    }
                    st.idle_resumes += 1;
                    if let Err(e) = st.resume().await {
                        return Some((Err(e), None));
                    }
                }
                let next = match st.stream.as_mut() {
                    Some(stream) => stream.next().await,
                    None => None,
                };
                match next {
                    Some(Ok(raw)) => {
                        st.idle_resumes = 0;
                        if let Some(rv) = raw.resource_version() {
                            st.last_rv = Some(rv.to_string());
                        }
                        if let Some(event) = st.event(raw) {
                            return Some((Ok(event), Some(st)));
                        }
                    }
                    Some(Err(e)) => return Some((Err(map_backend_error(e)), None)),
                    None => st.stream = None,
                }
            }
        })
    }
}
