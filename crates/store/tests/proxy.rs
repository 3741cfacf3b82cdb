#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::{configmaps, harness, harness_with, nodes, pod, pods};
use gantry_access::{PolicyRule, ScopedRule};
use gantry_core::{DeltaKind, EventKind, GatewayError, Identity, ListOptions, WatchSpec};
use gantry_kubehub::{delta_from, Impersonation};
use gantry_store::ProxyStore;
use gantry_summary::{spawn_ingest, Ingest};
use gantry_watch::WatchState;

fn ids(list: &gantry_core::ApiObjectList) -> Vec<String> { list.objects.iter().map(|o| o.id.clone()).collect() }

#[tokio::test]
async fn namespace_grant_filters_list_instead_of_denying() {
    let h = harness();
    h.rules.grant("dev", ScopedRule::namespaced("ns1", PolicyRule::new([""], ["pods"], ["list"])));
    h.seed(&pods(), &[("ns1", "a"), ("ns1", "b"), ("ns2", "c")]);

    let req = h.request("dev").await;
    let schema = req.view.lookup("pod").unwrap().clone();
    let store = schema.store.clone().unwrap();
    let list = store.list(&req, &schema).await.unwrap();
    assert_eq!(ids(&list), vec!["ns1/a", "ns1/b"]);

    let calls = h.backend.calls_of("list");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].who, Impersonation::User(Identity::user("dev")));
    assert_eq!(calls[0].namespace.as_deref(), Some("ns1"));

    // Asking for a namespace outside the grant is denied outright.
    let other = req.clone().with_namespace(Some("ns2".into()));
    assert!(matches!(store.list(&other, &schema).await, Err(GatewayError::Forbidden(_))));
}

#[tokio::test]
async fn wildcard_grant_is_one_passthrough_call() {
    let h = harness();
    h.seed(&pods(), &[("ns1", "a"), ("ns2", "b")]);
    let req = h.request("admin").await;
    let schema = req.view.lookup("pods").unwrap().clone();
    let list = schema.store.clone().unwrap().list(&req, &schema).await.unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.revision.is_some());
    let calls = h.backend.calls_of("list");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].namespace, None);
}

#[tokio::test]
async fn named_grants_list_through_the_gateway_and_filter() {
    let h = harness();
    let rule = PolicyRule::new([""], ["configmaps"], ["get", "list"]).with_names(["cfg"]);
    h.rules.grant("dev", ScopedRule::namespaced("ns1", rule));
    h.seed(&configmaps(), &[("ns1", "cfg"), ("ns1", "other")]);

    let req = h.request("dev").await;
    let schema = req.view.lookup("configmap").unwrap().clone();
    let store = schema.store.clone().unwrap();
    assert_eq!(ids(&store.list(&req, &schema).await.unwrap()), vec!["ns1/cfg"]);
    assert_eq!(h.backend.calls_of("list")[0].who, Impersonation::Admin);

    assert_eq!(store.by_id(&req, &schema, "ns1/cfg").await.unwrap().name(), Some("cfg"));
    let denied = store.by_id(&req, &schema, "ns1/other").await.unwrap_err();
    assert!(matches!(denied, GatewayError::Forbidden(_)));
    // Denied before reaching the backend.
    assert_eq!(h.backend.calls_of("get").len(), 1);
}

#[tokio::test]
async fn namespaced_bindings_do_not_reach_cluster_scoped_kinds() {
    let h = harness();
    h.rules.grant("dev", ScopedRule::namespaced("ns1", PolicyRule::new([""], ["nodes"], ["list"])));
    h.seed(&nodes(), &[("", "n1")]);
    let req = h.request("dev").await;
    let schema = req.view.lookup("node").unwrap().clone();
    let list = schema.store.clone().unwrap().list(&req, &schema).await.unwrap();
    assert!(list.is_empty());
    assert!(h.backend.calls_of("list").is_empty());
}

#[tokio::test]
async fn continue_tokens_walk_across_namespace_partitions() {
    let h = harness();
    for ns in ["ns1", "ns2"] {
        h.rules.grant("dev", ScopedRule::namespaced(ns, PolicyRule::new([""], ["pods"], ["list"])));
    }
    h.seed(&pods(), &[("ns1", "a"), ("ns1", "b"), ("ns1", "c"), ("ns2", "d"), ("ns2", "e"), ("ns2", "f")]);
    let base = h.request("dev").await;
    let schema = base.view.lookup("pod").unwrap().clone();
    let store = schema.store.clone().unwrap();

    let first = base.clone().with_options(ListOptions { limit: Some(4), ..Default::default() });
    let page1 = store.list(&first, &schema).await.unwrap();
    assert_eq!(ids(&page1), vec!["ns1/a", "ns1/b", "ns1/c", "ns2/d"]);
    let token = page1.continue_token.clone().unwrap();

    let second = base.clone().with_options(ListOptions { limit: Some(4), continue_token: Some(token), ..Default::default() });
    let page2 = store.list(&second, &schema).await.unwrap();
    assert_eq!(ids(&page2), vec!["ns2/e", "ns2/f"]);
    assert!(page2.continue_token.is_none());

    let bogus = base.with_options(ListOptions { continue_token: Some("nonsense".into()), ..Default::default() });
    assert!(matches!(store.list(&bogus, &schema).await, Err(GatewayError::Invalid(_))));
}

#[tokio::test]
async fn zero_limit_lists_everything() {
    let h = harness();
    for ns in ["ns1", "ns2"] {
        h.rules.grant("dev", ScopedRule::namespaced(ns, PolicyRule::new([""], ["pods"], ["list"])));
    }
    h.seed(&pods(), &[("ns1", "a"), ("ns1", "b"), ("ns2", "c")]);
    let req = h.request("dev").await.with_options(ListOptions { limit: Some(0), ..Default::default() });
    let schema = req.view.lookup("pod").unwrap().clone();
    let list = schema.store.clone().unwrap().list(&req, &schema).await.unwrap();
    assert_eq!(ids(&list), vec!["ns1/a", "ns1/b", "ns2/c"]);
    assert!(list.continue_token.is_none());
    assert_eq!(h.backend.calls_of("list").len(), 2);
}

#[tokio::test]
async fn stale_update_is_a_conflict_and_changes_nothing() {
    let h = harness();
    h.seed(&pods(), &[("ns1", "a")]);
    let req = h.request("admin").await;
    let schema = req.view.lookup("pod").unwrap().clone();
    let store = schema.store.clone().unwrap();

    let mine = store.by_id(&req, &schema, "ns1/a").await.unwrap();
    let mut theirs = pod("ns1", "a");
    theirs["metadata"]["labels"] = serde_json::json!({"owner": "them"});
    let current = h.backend.upsert(&pods(), theirs);

    let mut edit = mine.object.clone();
    edit["metadata"]["labels"] = serde_json::json!({"owner": "me"});
    let err = store.update(&req, &schema, "ns1/a", edit).await.unwrap_err();
    assert!(matches!(err, GatewayError::Conflict(_)));
    assert_eq!(h.backend.object(&pods(), Some("ns1"), "a").unwrap(), current);
}

#[tokio::test]
async fn backend_rejections_keep_their_kind() {
    let h = harness();
    h.rules.grant("viewer", ScopedRule::cluster(PolicyRule::new([""], ["pods"], ["get", "list"])));
    let req = h.request("admin").await.with_namespace(Some("ns1".into()));
    let schema = req.view.lookup("pod").unwrap().clone();
    let store = schema.store.clone().unwrap();

    let created = store.create(&req, &schema, pod("ns1", "a")).await.unwrap();
    assert_eq!(created.id, "ns1/a");
    let dup = store.create(&req, &schema, pod("ns1", "a")).await.unwrap_err();
    assert!(matches!(dup, GatewayError::Conflict(_)));
    let nameless = store.create(&req, &schema, serde_json::json!({"metadata": {}})).await.unwrap_err();
    assert!(matches!(nameless, GatewayError::Invalid(_)));
    assert!(matches!(store.by_id(&req, &schema, "ns1/missing").await, Err(GatewayError::NotFound(_))));

    h.backend.fail_next("get", gantry_kubehub::BackendError::Unreachable("connection refused".into()));
    assert!(matches!(store.by_id(&req, &schema, "ns1/a").await, Err(GatewayError::BackendUnavailable(_))));

    let viewer = h.request("viewer").await.with_namespace(Some("ns1".into()));
    assert!(matches!(store.delete(&viewer, &schema, "a").await, Err(GatewayError::Forbidden(_))));
    let deleted = store.delete(&req, &schema, "a").await.unwrap();
    assert_eq!(deleted.id, "ns1/a");
    assert!(h.backend.object(&pods(), Some("ns1"), "a").is_none());
}

#[tokio::test]
async fn cancelled_requests_do_not_reach_the_backend() {
    let h = harness();
    let req = h.request("admin").await;
    let schema = req.view.lookup("pod").unwrap().clone();
    req.cancel.cancel();
    let err = schema.store.clone().unwrap().list(&req, &schema).await.unwrap_err();
    assert_eq!(err, GatewayError::Cancelled);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_follows_visible_namespaces_and_resumes() {
    let h = harness();
    h.rules.grant("dev", ScopedRule::namespaced("ns1", PolicyRule::new([""], ["pods"], ["watch"])));
    let req = h.request("dev").await;
    let schema = req.view.lookup("pod").unwrap().clone();
    let mut feed = schema.store.clone().unwrap().watch(&req, &schema, &WatchSpec::for_type("pod")).await.unwrap();
    assert_eq!(feed.state(), WatchState::Streaming);

    h.backend.upsert(&pods(), pod("ns2", "x"));
    h.backend.upsert(&pods(), pod("ns1", "y"));
    let ev = tokio::time::timeout(Duration::from_secs(1), feed.next()).await.unwrap().unwrap();
    assert_eq!((ev.kind, ev.id.as_str()), (EventKind::Created, "ns1/y"));

    // A clean server-side end is resumed, not surfaced.
    h.backend.end_watches();
    while h.backend.calls_of("watch").len() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.backend.upsert(&pods(), pod("ns1", "y"));
    let ev = tokio::time::timeout(Duration::from_secs(1), feed.next()).await.unwrap().unwrap();
    assert_eq!((ev.kind, ev.id.as_str()), (EventKind::Updated, "ns1/y"));

    feed.cancel();
    assert!(feed.next().await.is_none());
    assert_eq!(feed.state(), WatchState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_backend_watch_ends_with_one_error_event() {
    let h = harness();
    let req = h.request("admin").await;
    let schema = req.view.lookup("pod").unwrap().clone();
    let mut feed = schema.store.clone().unwrap().watch(&req, &schema, &WatchSpec::for_type("pod")).await.unwrap();
    h.backend.break_watches(gantry_kubehub::BackendError::status(410, "Gone", "too old resource version"));
    let ev = tokio::time::timeout(Duration::from_secs(1), feed.next()).await.unwrap().unwrap();
    assert_eq!(ev.kind, EventKind::Error);
    assert!(feed.next().await.is_none());
    assert_eq!(feed.state(), WatchState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn objects_carry_summary_state_and_relationships() {
    let (tx, summary) = spawn_ingest(16);
    let h = harness_with(move |backend| ProxyStore::new(backend).with_summary(summary));
    let mut raw = pod("ns1", "a");
    raw["status"] = serde_json::json!({"phase": "Pending"});
    let stored = h.backend.upsert(&pods(), raw);
    let delta = delta_from(&stored, DeltaKind::Applied).unwrap();
    tx.send(Ingest::Relisted { gvk_key: "v1/Pod".into(), items: vec![delta] }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let req = h.request("admin").await;
    let schema = req.view.lookup("pod").unwrap().clone();
    let obj = schema.store.clone().unwrap().by_id(&req, &schema, "ns1/a").await.unwrap();
    assert_eq!(obj.object["metadata"]["state"]["name"], "pending");
    assert_eq!(obj.object["metadata"]["state"]["transitioning"], true);
    assert_eq!(obj.object["metadata"]["relationships"], serde_json::json!([]));
}
