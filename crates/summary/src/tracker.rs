//! Keeps the summary index in sync with the backend: one list-then-watch loop per
//! tracked kind, relisting after every watch end or failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use gantry_core::{DeltaKind, ListOptions};
use gantry_kubehub::{delta_from, Backend, BackendResult, DiscoveredResource, Impersonation, RawEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{spawn_ingest, Ingest, SummaryHandle, SummarySnapshot};

#[derive(Debug, Clone)]
pub struct SummaryConfig {
    pub queue_cap: usize,
    pub page_size: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self { queue_cap: 2048, page_size: 500, backoff_base: Duration::from_millis(500), backoff_max: Duration::from_secs(30) }
    }
}

/// Relationship/summary cache over a set of tracked kinds.
pub struct SummaryCache {
    backend: Arc<dyn Backend>,
    config: SummaryConfig,
    tx: mpsc::Sender<Ingest>,
    handle: SummaryHandle,
    trackers: Mutex<HashMap<String, JoinHandle<()>>>,
    relists: Arc<AtomicU64>,
}

impl SummaryCache {
    /// Must be called inside a tokio runtime.
    pub fn new(backend: Arc<dyn Backend>, config: SummaryConfig) -> Self {
        let (tx, handle) = spawn_ingest(config.queue_cap);
        Self { backend, config, tx, handle, trackers: Mutex::new(HashMap::new()), relists: Arc::new(AtomicU64::new(0)) }
    }

    /// Start tracking a kind; no-op when it is already tracked.
    pub fn track(&self, res: DiscoveredResource) {
        let gvk_key = res.gvk_key();
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        if trackers.get(&gvk_key).map_or(false, |t| !t.is_finished()) {
            return;
        }
        info!(gvk = %gvk_key, "summary: tracking");
        let task = tokio::spawn(run_tracker(
            Arc::clone(&self.backend),
            res,
            self.tx.clone(),
            self.config.clone(),
            Arc::clone(&self.relists),
        ));
        trackers.insert(gvk_key, task);
        metrics::gauge!("summary_tracked_kinds", trackers.len() as f64);
    }

    /// Stop tracking a kind and drop its entries.
    pub async fn untrack(&self, gvk_key: &str) {
        let task = self.trackers.lock().unwrap_or_else(|e| e.into_inner()).remove(gvk_key);
        if let Some(task) = task {
            task.abort();
            let _ = self.tx.send(Ingest::Forget { gvk_key: gvk_key.to_string() }).await;
            info!(gvk = %gvk_key, "summary: untracked");
        }
    }

    pub fn tracked(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.trackers.lock().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn current(&self) -> Arc<SummarySnapshot> { self.handle.current() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.handle.subscribe_epoch() }

    pub fn handle(&self) -> SummaryHandle { self.handle.clone() }

    /// Writer side, for feeding changes observed elsewhere.
    pub fn sender(&self) -> mpsc::Sender<Ingest> { self.tx.clone() }

    /// Completed full lists across all kinds.
    pub fn relists(&self) -> u64 { self.relists.load(Ordering::Relaxed) }
}

impl Drop for SummaryCache {
    fn drop(&mut self) {
        for (_, task) in self.trackers.lock().unwrap_or_else(|e| e.into_inner()).drain() {
            task.abort();
        }
    }
}

/// All pages of an admin list, as deltas, plus the list's resource version.
async fn list_all(backend: &dyn Backend, res: &DiscoveredResource, page_size: u32) -> BackendResult<(Vec<gantry_core::Delta>, Option<String>)> {
    let mut items = Vec::new();
    let mut opts = ListOptions { limit: Some(page_size), ..Default::default() };
    let mut revision = None;
    loop {
        let page = backend.list(&Impersonation::Admin, res, None, &opts).await?;
        if revision.is_none() {
            revision = page.resource_version.clone();
        }
        for raw in &page.items {
            match delta_from(raw, DeltaKind::Applied) {
                Ok(d) => items.push(d),
                Err(e) => debug!(gvk = %res.gvk_key(), error = %e, "summary: skipping object"),
            }
        }
        match page.continue_token {
            Some(token) if !token.is_empty() => opts.continue_token = Some(token),
            _ => break,
        }
    }
    Ok((items, revision))
}

async fn run_tracker(
    backend: Arc<dyn Backend>,
    res: DiscoveredResource,
    tx: mpsc::Sender<Ingest>,
    config: SummaryConfig,
    relists: Arc<AtomicU64>,
) {
    let gvk_key = res.gvk_key();
    let mut backoff = config.backoff_base;
    loop {
        let t0 = Instant::now();
        match list_all(backend.as_ref(), &res, config.page_size).await {
            Ok((items, revision)) => {
                let count = items.len();
                if tx.send(Ingest::Relisted { gvk_key: gvk_key.clone(), items }).await.is_err() {
                    return;
                }
                relists.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("summary_relists_total");
                info!(gvk = %gvk_key, items = count, took_ms = %t0.elapsed().as_millis(), "summary: listed");

                let opts = ListOptions { resource_version: revision, ..Default::default() };
                match backend.watch(&Impersonation::Admin, &res, None, &opts).await {
                    Ok(mut stream) => {
                        backoff = config.backoff_base;
                        while let Some(item) = stream.next().await {
                            let event = match item {
                                Ok(ev) => ev,
                                Err(e) => {
                                    warn!(gvk = %gvk_key, error = %e, "summary: watch failed; relisting");
                                    break;
                                }
                            };
                            let (raw, kind) = match &event {
                                RawEvent::Added(o) | RawEvent::Modified(o) => (o, DeltaKind::Applied),
                                RawEvent::Deleted(o) => (o, DeltaKind::Deleted),
                                RawEvent::Bookmark(_) => continue,
                            };
                            match delta_from(raw, kind) {
                                Ok(delta) => {
                                    if tx.send(Ingest::Delta { gvk_key: gvk_key.clone(), delta }).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => debug!(gvk = %gvk_key, error = %e, "summary: skipping event"),
                            }
                        }
                        debug!(gvk = %gvk_key, "summary: watch ended");
                    }
                    Err(e) => warn!(gvk = %gvk_key, error = %e, "summary: watch start failed"),
                }
            }
            Err(e) => {
                metrics::increment_counter!("summary_list_failures_total");
                warn!(gvk = %gvk_key, error = %e, backoff_ms = %backoff.as_millis(), "summary: list failed; serving stale entries");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.backoff_max);
    }
}
