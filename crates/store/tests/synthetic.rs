#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::harness;
use gantry_core::{EventKind, GatewayError, Verb, WatchSpec};
use gantry_schema::{Method, ResourceSchema};
use gantry_store::{LocalClusterSource, SyntheticStore, CLUSTER_GROUP, CLUSTER_TYPE, LOCAL_CLUSTER};
use gantry_watch::WatchState;

async fn cluster_schema(h: &common::Harness) -> ResourceSchema {
    let source = LocalClusterSource::capture(h.backend.as_ref()).await.unwrap();
    ResourceSchema::new(CLUSTER_TYPE, CLUSTER_GROUP, "clusters", false)
        .with_methods([Method::Get], [Method::Get])
        .with_static_access([Verb::Watch])
        .with_store(Arc::new(SyntheticStore::new(Arc::new(source))))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_cluster_watch_is_one_created_then_idle_until_cancel() {
    let h = harness();
    h.registry.register(cluster_schema(&h).await);
    let req = h.request("nobody").await;
    let schema = req.view.lookup(CLUSTER_TYPE).unwrap().clone();
    assert!(schema.permits(Verb::Watch));

    let mut feed = schema.store.clone().unwrap().watch(&req, &schema, &WatchSpec::for_type(CLUSTER_TYPE)).await.unwrap();
    let ev = feed.next().await.unwrap();
    assert_eq!(ev.kind, EventKind::Created);
    assert_eq!(ev.id, LOCAL_CLUSTER);
    assert_eq!(ev.object.as_ref().unwrap().object["status"]["version"]["gitVersion"], "v1.29.0");

    assert!(tokio::time::timeout(Duration::from_millis(50), feed.next()).await.is_err(), "feed must idle");
    assert_eq!(feed.state(), WatchState::Streaming);

    req.cancel.cancel();
    assert!(feed.next().await.is_none());
    assert_eq!(feed.state(), WatchState::Closed);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn synthetic_reads_never_contact_the_backend() {
    let h = harness();
    h.registry.register(cluster_schema(&h).await);
    let req = h.request("admin").await;
    let schema = req.view.lookup("management.gantry.io.clusters").unwrap().clone();
    let store = schema.store.clone().unwrap();

    let list = store.list(&req, &schema).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(store.by_id(&req, &schema, LOCAL_CLUSTER).await.unwrap().type_name, CLUSTER_TYPE);
    assert!(matches!(store.by_id(&req, &schema, "downstream").await, Err(GatewayError::NotFound(_))));
    assert!(matches!(store.delete(&req, &schema, LOCAL_CLUSTER).await, Err(GatewayError::MethodNotAllowed(_))));
    assert!(h.backend.calls().is_empty());
}
