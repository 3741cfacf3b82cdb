//! In-memory [`Backend`] for tests and demos. Objects live in a map keyed by
//! `(gvk key, namespace, name)`; every mutation bumps a global resource version and is
//! broadcast to open watches.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use futures::StreamExt;
use gantry_core::{meta_str, ListOptions};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{Backend, BackendError, BackendResult, DiscoveredResource, Impersonation, RawEvent, RawEventStream, RawList};

type ObjKey = (String, String, String);

#[derive(Debug, Clone)]
enum Signal {
    Event { gvk_key: String, namespace: String, event: RawEvent },
    Fail(BackendError),
    End,
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub who: Impersonation,
    pub gvk_key: String,
    pub namespace: Option<String>,
}

pub struct MockBackend {
    resources: RwLock<Vec<DiscoveredResource>>,
    objects: Mutex<BTreeMap<ObjKey, Value>>,
    rv: AtomicU64,
    version: String,
    signals: broadcast::Sender<Signal>,
    failures: Mutex<HashMap<&'static str, BackendError>>,
    calls: Mutex<Vec<Call>>,
}

/// A resource supporting every standard verb.
pub fn resource(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> DiscoveredResource {
    DiscoveredResource {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
        namespaced,
        verbs: ["get", "list", "watch", "create", "update", "patch", "delete"].iter().map(|s| s.to_string()).collect(),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

impl Default for MockBackend {
    fn default() -> Self { Self::new() }
}

impl MockBackend {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(1024);
        Self {
            resources: RwLock::new(Vec::new()),
            objects: Mutex::new(BTreeMap::new()),
            rv: AtomicU64::new(100),
            version: "v1.29.0".to_string(),
            signals,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_resources(resources: Vec<DiscoveredResource>) -> Self {
        let me = Self::new();
        *me.resources.write().unwrap_or_else(|e| e.into_inner()) = resources;
        me
    }

    pub fn add_resource(&self, res: DiscoveredResource) {
        let mut resources = self.resources.write().unwrap_or_else(|e| e.into_inner());
        resources.retain(|r| r.gvk_key() != res.gvk_key());
        resources.push(res);
    }

    pub fn remove_resource(&self, gvk_key: &str) {
        self.resources.write().unwrap_or_else(|e| e.into_inner()).retain(|r| r.gvk_key() != gvk_key);
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: BackendError) { lock(&self.failures).insert(op, err); }

    /// Fail every open watch with `err`.
    pub fn break_watches(&self, err: BackendError) { let _ = self.signals.send(Signal::Fail(err)); }

    /// End every open watch cleanly, as a server-side watch timeout would.
    pub fn end_watches(&self) { let _ = self.signals.send(Signal::End); }

    pub fn calls(&self) -> Vec<Call> { lock(&self.calls).clone() }

    pub fn calls_of(&self, op: &str) -> Vec<Call> { self.calls().into_iter().filter(|c| c.op == op).collect() }

    pub fn clear_calls(&self) { lock(&self.calls).clear(); }

    pub fn object(&self, res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> Option<Value> {
        lock(&self.objects).get(&key(res, namespace, name)).cloned()
    }

    /// Insert or replace an object directly, as another client of the control plane would.
    pub fn upsert(&self, res: &DiscoveredResource, mut obj: Value) -> Value {
        let namespace = meta_str(&obj, "namespace").map(str::to_string);
        let name = meta_str(&obj, "name").unwrap_or_default().to_string();
        let k = key(res, namespace.as_deref(), &name);
        let mut objects = lock(&self.objects);
        let existed = objects.contains_key(&k);
        self.stamp(res, &mut obj, objects.get(&k));
        objects.insert(k.clone(), obj.clone());
        drop(objects);
        let event = if existed { RawEvent::Modified(obj.clone()) } else { RawEvent::Added(obj.clone()) };
        self.emit(res, &k.1, event);
        obj
    }

    /// Remove an object directly.
    pub fn remove(&self, res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> Option<Value> {
        let k = key(res, namespace, name);
        let removed = lock(&self.objects).remove(&k);
        if let Some(obj) = &removed {
            self.emit(res, &k.1, RawEvent::Deleted(obj.clone()));
        }
        removed
    }

    fn stamp(&self, res: &DiscoveredResource, obj: &mut Value, prev: Option<&Value>) {
        let rv = self.rv.fetch_add(1, Ordering::SeqCst) + 1;
        if !obj.is_object() {
            *obj = serde_json::json!({});
        }
        obj["apiVersion"] = Value::String(res.gvk().api_version());
        obj["kind"] = Value::String(res.kind.clone());
        if !obj.get("metadata").map(Value::is_object).unwrap_or(false) {
            obj["metadata"] = serde_json::json!({});
        }
        let uid = prev
            .and_then(|p| meta_str(p, "uid"))
            .or_else(|| meta_str(obj, "uid"))
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        obj["metadata"]["uid"] = Value::String(uid);
        obj["metadata"]["resourceVersion"] = Value::String(rv.to_string());
    }

    fn emit(&self, res: &DiscoveredResource, namespace: &str, event: RawEvent) {
        let _ = self.signals.send(Signal::Event { gvk_key: res.gvk_key(), namespace: namespace.to_string(), event });
    }

    fn record(&self, op: &'static str, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>) -> BackendResult<()> {
        lock(&self.calls).push(Call { op, who: who.clone(), gvk_key: res.gvk_key(), namespace: namespace.map(str::to_string) });
        match lock(&self.failures).remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn known(&self, res: &DiscoveredResource) -> BackendResult<()> {
        let resources = self.resources.read().unwrap_or_else(|e| e.into_inner());
        if resources.iter().any(|r| r.gvk_key() == res.gvk_key()) {
            Ok(())
        } else {
            Err(BackendError::not_found(format!("resource {}", res.gvk_key())))
        }
    }
}

fn key(res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> ObjKey {
    let ns = if res.namespaced { namespace.unwrap_or_default() } else { "" };
    (res.gvk_key(), ns.to_string(), name.to_string())
}

/// Equality-only selectors: `k=v,k2=v2`.
fn selector_matches(obj: &Value, opts: &ListOptions) -> bool {
    let labels = obj.get("metadata").and_then(|m| m.get("labels"));
    let label_ok = opts.label_selector.as_deref().map_or(true, |sel| {
        sel.split(',').filter(|t| !t.is_empty()).all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k.trim())).and_then(Value::as_str) == Some(v.trim()),
            None => labels.and_then(|l| l.get(term.trim())).is_some(),
        })
    });
    let field_ok = opts.field_selector.as_deref().map_or(true, |sel| {
        sel.split(',').filter(|t| !t.is_empty()).all(|term| match term.split_once('=') {
            Some(("metadata.name", v)) => meta_str(obj, "name") == Some(v),
            Some(("metadata.namespace", v)) => meta_str(obj, "namespace") == Some(v),
            _ => true,
        })
    });
    label_ok && field_ok
}

fn conflict(name: &str) -> BackendError {
    BackendError::status(409, "Conflict", format!("Operation cannot be fulfilled on {}: the object has been modified", name))
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    async fn discover(&self) -> BackendResult<Vec<DiscoveredResource>> {
        if let Some(err) = lock(&self.failures).remove("discover") {
            return Err(err);
        }
        Ok(self.resources.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn server_version(&self) -> BackendResult<String> { Ok(self.version.clone()) }

    async fn get(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> BackendResult<Value> {
        self.record("get", who, res, namespace)?;
        self.known(res)?;
        self.object(res, namespace, name).ok_or_else(|| BackendError::not_found(format!("{} {}", res.plural, name)))
    }

    async fn list(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, opts: &ListOptions) -> BackendResult<RawList> {
        self.record("list", who, res, namespace)?;
        self.known(res)?;
        let gvk_key = res.gvk_key();
        let matching: Vec<Value> = lock(&self.objects)
            .iter()
            .filter(|((g, ns, _), _)| *g == gvk_key && namespace.map_or(true, |want| !res.namespaced || ns == want))
            .map(|(_, v)| v.clone())
            .filter(|v| selector_matches(v, opts))
            .collect();
        let offset = opts.continue_token.as_deref().and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let limit = opts.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let items: Vec<Value> = matching.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + items.len();
        Ok(RawList {
            items,
            continue_token: if next < matching.len() { Some(next.to_string()) } else { None },
            resource_version: Some(self.rv.load(Ordering::SeqCst).to_string()),
        })
    }

    async fn create(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, mut obj: Value) -> BackendResult<Value> {
        self.record("create", who, res, namespace)?;
        self.known(res)?;
        if !obj.is_object() {
            return Err(BackendError::status(422, "Invalid", "body must be an object"));
        }
        let name = meta_str(&obj, "name").filter(|n| !n.is_empty()).map(str::to_string);
        let name = name.ok_or_else(|| BackendError::status(422, "Invalid", "metadata.name: Required value"))?;
        if res.namespaced {
            let ns = namespace.ok_or_else(|| BackendError::status(422, "Invalid", "metadata.namespace: Required value"))?;
            obj["metadata"]["namespace"] = Value::String(ns.to_string());
        }
        let k = key(res, namespace, &name);
        let mut objects = lock(&self.objects);
        if objects.contains_key(&k) {
            return Err(BackendError::status(409, "AlreadyExists", format!("{} \"{}\" already exists", res.plural, name)));
        }
        self.stamp(res, &mut obj, None);
        objects.insert(k.clone(), obj.clone());
        drop(objects);
        self.emit(res, &k.1, RawEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(
        &self,
        who: &Impersonation,
        res: &DiscoveredResource,
        namespace: Option<&str>,
        name: &str,
        mut obj: Value,
    ) -> BackendResult<Value> {
        self.record("update", who, res, namespace)?;
        self.known(res)?;
        let k = key(res, namespace, name);
        let mut objects = lock(&self.objects);
        let current = objects.get(&k).ok_or_else(|| BackendError::not_found(format!("{} {}", res.plural, name)))?;
        if let Some(rv) = meta_str(&obj, "resourceVersion") {
            if Some(rv) != meta_str(current, "resourceVersion") {
                return Err(conflict(name));
            }
        }
        self.stamp(res, &mut obj, Some(current));
        objects.insert(k.clone(), obj.clone());
        drop(objects);
        self.emit(res, &k.1, RawEvent::Modified(obj.clone()));
        Ok(obj)
    }

    async fn delete(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, name: &str) -> BackendResult<Option<Value>> {
        self.record("delete", who, res, namespace)?;
        self.known(res)?;
        match self.remove(res, namespace, name) {
            Some(obj) => Ok(Some(obj)),
            None => Err(BackendError::not_found(format!("{} {}", res.plural, name))),
        }
    }

    async fn apply(
        &self,
        who: &Impersonation,
        res: &DiscoveredResource,
        namespace: Option<&str>,
        name: &str,
        mut obj: Value,
        _field_manager: &str,
    ) -> BackendResult<Value> {
        self.record("apply", who, res, namespace)?;
        self.known(res)?;
        if !obj.is_object() {
            return Err(BackendError::status(422, "Invalid", "apply body must be an object"));
        }
        if !obj.get("metadata").map_or(false, Value::is_object) {
            obj["metadata"] = serde_json::json!({});
        }
        if res.namespaced {
            if let Some(ns) = namespace {
                obj["metadata"]["namespace"] = Value::String(ns.to_string());
            }
        }
        obj["metadata"]["name"] = Value::String(name.to_string());
        Ok(self.upsert(res, obj))
    }

    async fn watch(&self, who: &Impersonation, res: &DiscoveredResource, namespace: Option<&str>, opts: &ListOptions) -> BackendResult<RawEventStream> {
        self.record("watch", who, res, namespace)?;
        self.known(res)?;
        let rx = self.signals.subscribe();
        let gvk_key = res.gvk_key();
        let namespace = if res.namespaced { namespace.map(str::to_string) } else { None };
        let opts = opts.clone();
        let stream = futures::stream::unfold(Some(rx), move |rx| {
            let gvk_key = gvk_key.clone();
            let namespace = namespace.clone();
            let opts = opts.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(Signal::Event { gvk_key: g, namespace: ns, event }) => {
                            let ns_ok = namespace.as_deref().map_or(true, |want| want == ns);
                            let obj_ok = event.object().map_or(true, |o| selector_matches(o, &opts));
                            if g == gvk_key && ns_ok && obj_ok {
                                return Some((Ok(event), Some(rx)));
                            }
                        }
                        Ok(Signal::Fail(err)) => return Some((Err(err), None)),
                        Ok(Signal::End) => return None,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
