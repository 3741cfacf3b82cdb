//! Gantry summary cache: a derived index of tracked backend objects with their
//! rolled-up state and owner relationships.
//!
//! Writers feed [`Ingest`] messages into one ingest loop that coalesces them per uid
//! and publishes copy-on-write [`SummarySnapshot`]s; readers load the current snapshot
//! and never wait on the backend.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use gantry_core::{meta_str, Delta, DeltaKind, Gvk, Uid};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

mod summarize;
mod tracker;

pub use summarize::{owners, summarize, OwnerRef, Owners, Summary};
pub use tracker::{SummaryCache, SummaryConfig};

const FLUSH_EVERY: Duration = Duration::from_millis(8);

/// Identity of an indexed object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub gvk_key: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk_key: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { gvk_key: gvk_key.into(), namespace: namespace.unwrap_or_default().to_string(), name: name.into() }
    }

    /// `namespace/name` or `name`.
    pub fn id(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: ObjectKey,
    pub uid: Uid,
    pub uid_str: String,
    pub resource_version: Option<String>,
    /// Unix seconds; 0 when unknown.
    pub creation_ts: i64,
    pub summary: Summary,
    pub owners: Owners,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelKind {
    /// The related object owns this one.
    Owner,
    /// This object owns the related one.
    Owns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub rel: RelKind,
    #[serde(rename = "toType")]
    pub to_type: String,
    #[serde(rename = "toId")]
    pub to_id: String,
}

/// Messages accepted by the ingest loop.
#[derive(Debug, Clone)]
pub enum Ingest {
    Delta { gvk_key: String, delta: Delta },
    /// Full resync of one kind: everything of `gvk_key` not in `items` is dropped.
    Relisted { gvk_key: String, items: Vec<Delta> },
    /// Drop every entry of one kind.
    Forget { gvk_key: String },
}

/// Coalescing queue keyed by uid with FIFO order. `cap` bounds how many
/// distinct uids may be pending before the owner must drain.
pub struct Coalescer {
    map: FxHashMap<Uid, (String, Delta)>,
    order: VecDeque<Uid>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self { Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) } }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// True when pushing `uid` would exceed capacity. Updates to a pending uid never do.
    pub fn is_full_for(&self, uid: &Uid) -> bool { self.order.len() >= self.cap && !self.map.contains_key(uid) }

    /// Last writer wins per uid. Never drops; callers drain when `is_full_for` says so.
    pub fn push(&mut self, gvk_key: String, d: Delta) {
        let uid = d.uid;
        if !self.map.contains_key(&uid) {
            self.order.push_back(uid);
        }
        self.map.insert(uid, (gvk_key, d));
    }

    pub fn drain_ready(&mut self) -> Vec<(String, Delta)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&uid) {
                out.push(d);
            }
        }
        out
    }
}

/// Immutable index published by the ingest loop.
#[derive(Debug, Default)]
pub struct SummarySnapshot {
    pub epoch: u64,
    entries: BTreeMap<ObjectKey, Arc<Entry>>,
    /// Owner uid -> keys of the objects it owns.
    children: FxHashMap<String, Vec<ObjectKey>>,
    by_uid: FxHashMap<String, ObjectKey>,
}

impl SummarySnapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<Entry>> { self.entries.get(key) }

    pub fn summary(&self, key: &ObjectKey) -> Option<&Summary> { self.entries.get(key).map(|e| &e.summary) }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<Entry>> { self.entries.values() }

    pub fn entries_of<'a>(&'a self, gvk_key: &'a str) -> impl Iterator<Item = &'a Arc<Entry>> + 'a {
        self.entries.values().filter(move |e| e.key.gvk_key == gvk_key)
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Owners of the object and objects it owns.
    pub fn relationships(&self, key: &ObjectKey) -> Vec<Relationship> {
        let Some(entry) = self.entries.get(key) else { return Vec::new() };
        let mut out: Vec<Relationship> = entry
            .owners
            .iter()
            .map(|o| {
                let gvk = Gvk::from_api_version(&o.api_version, &o.kind);
                let owner_key = ObjectKey::new(gvk.key(), Some(&key.namespace), o.name.clone());
                Relationship { rel: RelKind::Owner, to_type: gvk.type_name(), to_id: owner_key.id() }
            })
            .collect();
        for child in self.children.get(&entry.uid_str).into_iter().flatten() {
            let to_type = Gvk::parse_key(&child.gvk_key).map(|g| g.type_name()).unwrap_or_else(|| child.gvk_key.clone());
            out.push(Relationship { rel: RelKind::Owns, to_type, to_id: child.id() });
        }
        out
    }

    pub fn by_uid(&self, uid: &str) -> Option<&Arc<Entry>> { self.by_uid.get(uid).and_then(|k| self.entries.get(k)) }
}

/// Builds [`SummarySnapshot`]s from ingest batches.
#[derive(Default)]
pub struct SummaryBuilder {
    epoch: u64,
    entries: BTreeMap<ObjectKey, Arc<Entry>>,
    keys: FxHashMap<Uid, ObjectKey>,
}

fn entry_from(gvk_key: &str, d: &Delta) -> Option<Entry> {
    let name = meta_str(&d.raw, "name")?;
    let namespace = meta_str(&d.raw, "namespace").filter(|ns| !ns.is_empty());
    let creation_ts = meta_str(&d.raw, "creationTimestamp")
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);
    Some(Entry {
        key: ObjectKey::new(gvk_key, namespace, name),
        uid: d.uid,
        uid_str: meta_str(&d.raw, "uid").unwrap_or_default().to_string(),
        resource_version: meta_str(&d.raw, "resourceVersion").map(str::to_string),
        creation_ts,
        summary: summarize(&d.raw),
        owners: owners(&d.raw),
    })
}

impl SummaryBuilder {
    pub fn new() -> Self { Self::default() }

    fn upsert(&mut self, gvk_key: &str, d: &Delta) {
        let Some(entry) = entry_from(gvk_key, d) else { return };
        if let Some(old) = self.keys.insert(d.uid, entry.key.clone()) {
            if old != entry.key {
                self.entries.remove(&old);
            }
        }
        self.entries.insert(entry.key.clone(), Arc::new(entry));
    }

    fn remove(&mut self, uid: &Uid) {
        if let Some(key) = self.keys.remove(uid) {
            self.entries.remove(&key);
        }
    }

    fn forget(&mut self, gvk_key: &str) {
        self.entries.retain(|k, _| k.gvk_key != gvk_key);
        self.keys.retain(|_, k| k.gvk_key != gvk_key);
    }

    pub fn apply_deltas(&mut self, batch: Vec<(String, Delta)>) {
        for (gvk_key, d) in batch {
            match d.kind {
                DeltaKind::Applied => self.upsert(&gvk_key, &d),
                DeltaKind::Deleted => self.remove(&d.uid),
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn apply(&mut self, msg: Ingest) {
        match msg {
            Ingest::Delta { gvk_key, delta } => return self.apply_deltas(vec![(gvk_key, delta)]),
            Ingest::Relisted { gvk_key, items } => {
                let before = self.entries.values().filter(|e| e.key.gvk_key == gvk_key).count();
                self.forget(&gvk_key);
                for d in items.iter().filter(|d| d.kind == DeltaKind::Applied) {
                    self.upsert(&gvk_key, d);
                }
                debug!(gvk = %gvk_key, before, after = items.len(), "summary: relisted");
            }
            Ingest::Forget { gvk_key } => self.forget(&gvk_key),
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<SummarySnapshot> {
        let mut children: FxHashMap<String, Vec<ObjectKey>> = FxHashMap::default();
        let mut by_uid: FxHashMap<String, ObjectKey> = FxHashMap::default();
        for entry in self.entries.values() {
            for owner in entry.owners.iter().filter(|o| !o.uid.is_empty()) {
                children.entry(owner.uid.clone()).or_default().push(entry.key.clone());
            }
            if !entry.uid_str.is_empty() {
                by_uid.insert(entry.uid_str.clone(), entry.key.clone());
            }
        }
        Arc::new(SummarySnapshot { epoch: self.epoch, entries: self.entries.clone(), children, by_uid })
    }
}

/// Read side of the cache: current snapshot plus epoch notifications.
#[derive(Clone)]
pub struct SummaryHandle {
    snap: Arc<ArcSwap<SummarySnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl SummaryHandle {
    pub fn current(&self) -> Arc<SummarySnapshot> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

fn publish(builder: &SummaryBuilder, snap: &ArcSwap<SummarySnapshot>, epoch_tx: &watch::Sender<u64>) {
    let next = builder.freeze();
    let epoch = next.epoch;
    let size = next.len();
    snap.store(next);
    let _ = epoch_tx.send(epoch);
    metrics::gauge!("summary_entries", size as f64);
}

/// Spawn the ingest loop. Returns the sender writers feed and the read handle.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<Ingest>, SummaryHandle) {
    let (tx, mut rx) = mpsc::channel::<Ingest>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(SummarySnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let writer = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = SummaryBuilder::new();
        let mut ticker = tokio::time::interval(FLUSH_EVERY);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(Ingest::Delta { gvk_key, delta }) => {
                        if coalescer.is_full_for(&delta.uid) {
                            builder.apply_deltas(coalescer.drain_ready());
                            publish(&builder, &writer, &epoch_tx);
                            metrics::increment_counter!("summary_coalescer_early_flush_total");
                        }
                        coalescer.push(gvk_key, delta);
                    }
                    Some(barrier) => {
                        // Pending deltas predate the barrier
                        let batch = coalescer.drain_ready();
                        if !batch.is_empty() {
                            builder.apply_deltas(batch);
                        }
                        builder.apply(barrier);
                        publish(&builder, &writer, &epoch_tx);
                    }
                    None => {
                        debug!("ingest channel closed; draining and exiting ingest loop");
                        let batch = coalescer.drain_ready();
                        if !batch.is_empty() {
                            builder.apply_deltas(batch);
                            publish(&builder, &writer, &epoch_tx);
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        builder.apply_deltas(batch);
                        publish(&builder, &writer, &epoch_tx);
                    }
                }
            }
        }
        info!("summary ingest loop stopped");
    });

    (tx, SummaryHandle { snap, epoch_rx })
}
