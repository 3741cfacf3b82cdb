use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use gantry_core::{ApiEvent, ApiObject, ApiObjectList, GatewayError, GatewayResult, Verb, WatchSpec};
use gantry_schema::{ApiRequest, ResourceSchema, Store};
use gantry_summary::{Entry, SummaryHandle};
use gantry_watch::{Multiplexer, WatchFeed};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const COUNT_TYPE: &str = "count";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCount {
    pub count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub states: BTreeMap<String, u64>,
    pub error: u64,
    pub transitioning: u64,
}

impl ItemCount {
    fn add(&mut self, entry: &Entry) {
        self.count += 1;
        *self.states.entry(entry.summary.state.clone()).or_default() += 1;
        self.error += entry.summary.error as u64;
        self.transitioning += entry.summary.transitioning as u64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    pub summary: ItemCount,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespaces: BTreeMap<String, ItemCount>,
}

/// Per type name.
pub type Counts = BTreeMap<String, TypeCount>;

/// Serves the `count` object: tracked objects per type and namespace, restricted to
/// what the caller may list.
#[derive(Clone)]
pub struct AggregateStore {
    summary: SummaryHandle,
}

impl AggregateStore {
    pub fn new(summary: SummaryHandle) -> Self { Self { summary } }

    /// Recomputed from the current summary snapshot on every call.
    pub fn counts(&self, req: &ApiRequest) -> Counts {
        let snap = self.summary.current();
        let by_gvk: HashMap<String, &Arc<ResourceSchema>> =
            req.view.iter().filter_map(|s| s.gvk.as_ref().map(|g| (g.key(), s))).collect();
        let access = req.access();
        let mut counts = Counts::new();
        for entry in snap.entries() {
            let Some(schema) = by_gvk.get(&entry.key.gvk_key) else { continue };
            let namespace = Some(entry.key.namespace.as_str()).filter(|ns| !ns.is_empty());
            let visible = access.grants(Verb::List, &schema.group, &schema.plural, namespace, None)
                || access.grants(Verb::Get, &schema.group, &schema.plural, namespace, Some(&entry.key.name));
            if !visible {
                continue;
            }
            let slot = counts.entry(schema.id.clone()).or_default();
            slot.summary.add(entry);
            if let Some(ns) = namespace {
                slot.namespaces.entry(ns.to_string()).or_default().add(entry);
            }
        }
        counts
    }

    fn object(&self, req: &ApiRequest, counts: &Counts) -> ApiObject {
        let mut obj = ApiObject::new(
            COUNT_TYPE,
            COUNT_TYPE,
            serde_json::json!({ "id": COUNT_TYPE, "counts": serde_json::to_value(counts).unwrap_or_default() }),
        );
        if let Some(schema) = req.view.lookup(COUNT_TYPE) {
            schema.format(req, &mut obj);
        }
        obj
    }
}

#[async_trait::async_trait]
impl Store for AggregateStore {
    async fn by_id(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        req.check_cancelled()?;
        if id != COUNT_TYPE {
            return Err(GatewayError::not_found(format!("{} {}", schema.id, id)));
        }
        Ok(self.object(req, &self.counts(req)))
    }

    async fn list(&self, req: &ApiRequest, _schema: &ResourceSchema) -> GatewayResult<ApiObjectList> {
        req.check_cancelled()?;
        let epoch = self.summary.current().epoch;
        Ok(ApiObjectList { objects: vec![self.object(req, &self.counts(req))], continue_token: None, revision: Some(epoch.to_string()) })
    }

    /// `created` with the current counts, then `updated` whenever the summary cache
    /// moves and the counts differ.
    async fn watch(&self, req: &ApiRequest, schema: &ResourceSchema, _spec: &WatchSpec) -> GatewayResult<WatchFeed> {
        req.check_cancelled()?;
        let mut epochs = self.summary.subscribe_epoch();
        epochs.borrow_and_update();
        let first = self.counts(req);
        let initial = ApiEvent::created(self.object(req, &first));
        let store = self.clone();
        let request = req.clone();
        let updates = futures::stream::unfold((epochs, first), move |(mut epochs, last)| {
            let store = store.clone();
            let request = request.clone();
            async move {
                loop {
                    epochs.changed().await.ok()?;
                    let next = store.counts(&request);
                    if next != last {
                        debug!(epoch = *epochs.borrow(), types = next.len(), "aggregate: counts changed");
                        let event = ApiEvent::updated(store.object(&request, &next));
                        return Some((Ok(event), (epochs, next)));
                    }
                }
            }
        });
        let mut mux = Multiplexer::new(&req.cancel, schema.id.clone());
        mux.add_source(futures::StreamExt::chain(futures::stream::iter([Ok(initial)]), updates));
        Ok(mux.start())
    }
}
