#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use gantry_kubehub::mock::resource;
use gantry_kubehub::{BackendError, MockBackend};
use gantry_summary::{ObjectKey, RelKind, SummaryCache, SummaryConfig, SummarySnapshot};
use serde_json::json;

fn config() -> SummaryConfig {
    SummaryConfig { queue_cap: 64, page_size: 2, backoff_base: Duration::from_millis(10), backoff_max: Duration::from_millis(40) }
}

async fn eventually(cache: &SummaryCache, what: &str, pred: impl Fn(&SummarySnapshot) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if pred(&cache.current()) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `n` watches have been opened.
async fn watching(backend: &MockBackend, n: usize) {
    while backend.calls_of("watch").len() < n {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn pod(name: &str) -> serde_json::Value { json!({"metadata": {"name": name, "namespace": "ns1"}, "status": {"phase": "Running"}}) }

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lists_then_follows_watch_events() {
    let pods = resource("", "v1", "Pod", "pods", true);
    let backend = Arc::new(MockBackend::with_resources(vec![pods.clone()]));
    for name in ["a", "b", "c"] {
        backend.upsert(&pods, pod(name));
    }
    let cache = SummaryCache::new(backend.clone(), config());
    cache.track(pods.clone());
    cache.track(pods.clone());
    assert_eq!(cache.tracked(), vec!["v1/Pod".to_string()]);

    eventually(&cache, "initial list across pages", |s| s.len() == 3).await;
    assert_eq!(backend.calls_of("list").len(), 2);
    watching(&backend, 1).await;

    backend.upsert(&pods, pod("d"));
    backend.remove(&pods, Some("ns1"), "a");
    eventually(&cache, "watch deltas", |s| {
        s.get(&ObjectKey::new("v1/Pod", Some("ns1"), "d")).is_some() && s.get(&ObjectKey::new("v1/Pod", Some("ns1"), "a")).is_none()
    })
    .await;
    assert_eq!(cache.current().summary(&ObjectKey::new("v1/Pod", Some("ns1"), "d")).unwrap().state, "running");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relationships_follow_owner_uids() {
    let rs = resource("apps", "v1", "ReplicaSet", "replicasets", true);
    let pods = resource("", "v1", "Pod", "pods", true);
    let backend = Arc::new(MockBackend::with_resources(vec![rs.clone(), pods.clone()]));
    let owner = backend.upsert(&rs, json!({"metadata": {"name": "web-1", "namespace": "ns1"}}));
    let owner_uid = owner["metadata"]["uid"].as_str().unwrap().to_string();
    backend.upsert(&pods, json!({"metadata": {"name": "web-1-x", "namespace": "ns1", "ownerReferences": [
        {"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "web-1", "uid": owner_uid}
    ]}}));

    let cache = SummaryCache::new(backend.clone(), config());
    cache.track(rs);
    cache.track(pods);
    eventually(&cache, "both kinds listed", |s| s.len() == 2).await;

    let rels = cache.current().relationships(&ObjectKey::new("apps/v1/ReplicaSet", Some("ns1"), "web-1"));
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].rel, RelKind::Owns);
    assert_eq!(rels[0].to_id, "ns1/web-1-x");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_watch_relists_and_serves_stale_meanwhile() {
    let pods = resource("", "v1", "Pod", "pods", true);
    let backend = Arc::new(MockBackend::with_resources(vec![pods.clone()]));
    backend.upsert(&pods, pod("a"));
    let cache = SummaryCache::new(backend.clone(), SummaryConfig { page_size: 100, ..config() });
    cache.track(pods.clone());
    eventually(&cache, "initial list", |s| s.len() == 1).await;
    let relists = cache.relists();
    watching(&backend, 1).await;

    backend.fail_next("list", BackendError::Unreachable("connection refused".into()));
    backend.break_watches(BackendError::status(410, "Gone", "too old resource version"));
    // Entries survive the failed relist.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.current().len(), 1);

    backend.upsert(&pods, pod("b"));
    eventually(&cache, "recovery relist", |s| s.len() == 2).await;
    assert!(cache.relists() > relists);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn untrack_forgets_the_kind() {
    let pods = resource("", "v1", "Pod", "pods", true);
    let secrets = resource("", "v1", "Secret", "secrets", true);
    let backend = Arc::new(MockBackend::with_resources(vec![pods.clone(), secrets.clone()]));
    backend.upsert(&pods, pod("a"));
    backend.upsert(&secrets, json!({"metadata": {"name": "s", "namespace": "ns1"}}));
    let cache = SummaryCache::new(backend.clone(), config());
    cache.track(pods);
    cache.track(secrets);
    eventually(&cache, "both listed", |s| s.len() == 2).await;

    cache.untrack("v1/Pod").await;
    eventually(&cache, "pods forgotten", |s| s.len() == 1 && s.entries_of("v1/Pod").next().is_none()).await;
    assert_eq!(cache.tracked(), vec!["v1/Secret".to_string()]);
}
