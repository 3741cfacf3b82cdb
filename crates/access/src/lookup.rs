use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gantry_core::{GatewayError, GatewayResult, Identity};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::{AccessSet, BindingSource};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Entries beyond this are pruned of expired sets on insert.
const MAX_ENTRIES: usize = 4096;

struct Entry {
    cell: Arc<OnceCell<Arc<AccessSet>>>,
    created: Instant,
}

/// Per-identity access-set cache in front of a [`BindingSource`].
///
/// Concurrent computations for one identity share one in-flight query; entries expire
/// after the TTL or when invalidated.
pub struct AccessSetLookup {
    source: Arc<dyn BindingSource>,
    ttl: Duration,
    entries: Mutex<HashMap<Identity, Entry>>,
    generation: AtomicU64,
    queries: AtomicU64,
    invalidations: watch::Sender<u64>,
}

impl AccessSetLookup {
    pub fn new(source: Arc<dyn BindingSource>, ttl: Duration) -> Self {
        let (invalidations, _) = watch::channel(0);
        Self {
            source,
            ttl,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            invalidations,
        }
    }

    pub fn ttl(&self) -> Duration { self.ttl }

    pub fn generation(&self) -> u64 { self.generation.load(Ordering::Acquire) }

    /// Binding-source queries issued so far.
    pub fn queries(&self) -> u64 { self.queries.load(Ordering::Relaxed) }

    /// Ticks with the generation on every invalidation.
    pub fn subscribe_invalidations(&self) -> watch::Receiver<u64> { self.invalidations.subscribe() }

    fn cell_for(&self, identity: &Identity) -> (Arc<OnceCell<Arc<AccessSet>>>, bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(identity) {
            if entry.created.elapsed() < self.ttl || !entry.cell.initialized() {
                return (Arc::clone(&entry.cell), entry.cell.initialized());
            }
        }
        if entries.len() >= MAX_ENTRIES {
            let ttl = self.ttl;
            entries.retain(|_, e| e.created.elapsed() < ttl);
        }
        let cell = Arc::new(OnceCell::new());
        entries.insert(identity.clone(), Entry { cell: Arc::clone(&cell), created: Instant::now() });
        (cell, false)
    }

    /// The identity's current access set. Returns the same `Arc` until the entry
    /// expires or is invalidated.
    pub async fn compute(&self, identity: &Identity) -> GatewayResult<Arc<AccessSet>> {
        let (cell, hit) = self.cell_for(identity);
        if hit {
            metrics::increment_counter!("access_lookup_total", "result" => "hit");
        }
        let generation = self.generation();
        let res = cell
            .get_or_try_init(|| async {
                self.queries.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("access_lookup_total", "result" => "miss");
                let t0 = Instant::now();
                let rules = self.source.rules_for(identity).await?;
                let set = AccessSet::from_rules(&rules, generation);
                debug!(identity = %identity, rules = rules.len(), took_ms = %t0.elapsed().as_millis(), "access: computed");
                Ok::<_, anyhow::Error>(Arc::new(set))
            })
            .await;
        match res {
            Ok(set) => Ok(Arc::clone(set)),
            Err(e) => {
                warn!(identity = %identity, error = %e, "access: binding source unavailable");
                metrics::increment_counter!("access_lookup_failures_total");
                Err(GatewayError::AuthorizationUnavailable(format!("{:#}", e)))
            }
        }
    }

    pub fn invalidate(&self, identity: &Identity) {
        let removed = self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(identity).is_some();
        let generation = self.bump();
        debug!(identity = %identity, removed, generation, "access: invalidated");
    }

    /// Drops every cached set, e.g. after any role or binding changed.
    pub fn invalidate_all(&self) {
        let count = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let n = entries.len();
            entries.clear();
            n
        };
        let generation = self.bump();
        info!(count, generation, "access: invalidated all");
    }

    fn bump(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.invalidations.send_replace(generation);
        metrics::increment_counter!("access_invalidations_total");
        generation
    }
}
