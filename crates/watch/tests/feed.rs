#![forbid(unsafe_code)]

use std::time::Duration;

use futures::StreamExt;
use gantry_core::{ApiEvent, ApiObject, EventKind, GatewayError};
use gantry_watch::{once_then_idle, Multiplexer, WatchState};
use tokio_util::sync::CancellationToken;

fn ev(kind: EventKind, name: &str) -> ApiEvent {
    let obj = ApiObject::from_raw("pod", serde_json::json!({"metadata": {"name": name, "namespace": "ns1"}}));
    ApiEvent::from_object(kind, obj)
}

async fn settle() { tokio::time::sleep(Duration::from_millis(20)).await; }

#[tokio::test]
async fn relays_events_in_source_order_then_closes() {
    let req = CancellationToken::new();
    let sent = vec![ev(EventKind::Created, "a"), ev(EventKind::Updated, "a"), ev(EventKind::Created, "b"), ev(EventKind::Deleted, "a")];
    let mut mux = Multiplexer::new(&req, "pod").with_capacity(2);
    mux.add_source(futures::stream::iter(sent.clone().into_iter().map(Ok)));
    let mut feed = mux.start();
    assert_eq!(feed.state(), WatchState::Streaming);

    let mut got = Vec::new();
    while let Some(e) = feed.next().await {
        got.push(e);
    }
    assert_eq!(got, sent);
    assert_eq!(feed.state(), WatchState::Closed);
    assert!(feed.next().await.is_none());
}

#[tokio::test]
async fn source_error_emits_one_terminal_error_event() {
    let req = CancellationToken::new();
    let mut mux = Multiplexer::new(&req, "pod");
    mux.add_source(futures::stream::iter(vec![
        Ok(ev(EventKind::Created, "a")),
        Err(GatewayError::BackendUnavailable("stream reset".into())),
        Ok(ev(EventKind::Created, "never")),
    ]));
    // A second, idle source must be torn down by the failure of the first.
    mux.add_source(futures::stream::pending());
    let mut feed = mux.start();

    let first = feed.next().await.unwrap();
    assert_eq!(first.kind, EventKind::Created);
    let err = feed.next().await.unwrap();
    assert_eq!(err.kind, EventKind::Error);
    assert!(err.error.unwrap().contains("stream reset"));
    assert!(feed.next().await.is_none());
    assert_eq!(feed.state(), WatchState::Closed);
    assert!(!req.is_cancelled(), "a failed feed must not cancel its request");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nothing_follows_the_error_event_from_busy_siblings() {
    for _ in 0..50 {
        let req = CancellationToken::new();
        let mut mux = Multiplexer::new(&req, "pod").with_capacity(8);
        let busy: Vec<_> = (0..10_000).map(|i| Ok(ev(EventKind::Updated, &format!("busy{}", i)))).collect();
        mux.add_source(futures::stream::iter(busy));
        mux.add_source(futures::stream::iter(vec![
            Ok(ev(EventKind::Created, "a")),
            Err(GatewayError::BackendUnavailable("stream reset".into())),
        ]));
        let mut feed = mux.start();

        let mut kinds = Vec::new();
        while let Some(e) = feed.next().await {
            kinds.push(e.kind);
        }
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Error).count(), 1);
        assert_eq!(kinds.last(), Some(&EventKind::Error));
        assert!(feed.next().await.is_none());
        assert_eq!(feed.state(), WatchState::Closed);
    }
}

#[tokio::test]
async fn request_cancellation_closes_feed_without_further_events() {
    let req = CancellationToken::new();
    let mut mux = Multiplexer::new(&req, "management.gantry.io.cluster");
    mux.add_source(once_then_idle(vec![ev(EventKind::Created, "local")]));
    let mut feed = mux.start();

    assert_eq!(feed.next().await.unwrap().kind, EventKind::Created);
    // Idle: nothing else arrives while the request is alive.
    assert!(tokio::time::timeout(Duration::from_millis(50), feed.next()).await.is_err());
    assert_eq!(feed.state(), WatchState::Streaming);

    req.cancel();
    assert!(feed.next().await.is_none());
    assert_eq!(feed.state(), WatchState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_racing_source_completion_is_terminal() {
    for round in 0..50 {
        let req = CancellationToken::new();
        let mut mux = Multiplexer::new(&req, "pod").with_capacity(1);
        let events: Vec<_> = (0..8).map(|i| Ok(ev(EventKind::Created, &format!("p{}", i)))).collect();
        mux.add_source(futures::stream::iter(events));
        let mut feed = mux.start();
        let canceller = {
            let req = req.clone();
            tokio::spawn(async move {
                if round % 2 == 0 {
                    tokio::task::yield_now().await;
                }
                req.cancel();
            })
        };
        let mut seen = Vec::new();
        while let Some(e) = feed.next().await {
            seen.push(e.id);
        }
        canceller.await.unwrap();
        // Whatever was delivered is a prefix of the source, in order.
        let expected: Vec<_> = (0..seen.len()).map(|i| format!("ns1/p{}", i)).collect();
        assert_eq!(seen, expected);
        assert!(feed.next().await.is_none());
        settle().await;
        assert_eq!(feed.state(), WatchState::Closed);
    }
}

#[tokio::test]
async fn dropping_the_feed_stops_relays() {
    let req = CancellationToken::new();
    let (tx, rx) = tokio::sync::mpsc::channel::<ApiEvent>(4);
    let mut mux = Multiplexer::new(&req, "pod");
    mux.add_source(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (Ok(e), rx)) }));
    let feed = mux.start();
    drop(feed);
    settle().await;
    // The relay dropped its receiver, so the producer observes a closed channel.
    assert!(tx.send(ev(EventKind::Created, "late")).await.is_err());
}

#[tokio::test]
async fn feed_without_sources_is_closed() {
    let req = CancellationToken::new();
    let mut feed = Multiplexer::new(&req, "pod").start();
    assert_eq!(feed.state(), WatchState::Closed);
    assert!(feed.next().await.is_none());
}

#[tokio::test]
async fn multiple_sources_preserve_per_source_order() {
    let req = CancellationToken::new();
    let mut mux = Multiplexer::new(&req, "pod");
    let a: Vec<_> = (0..5).map(|i| Ok(ev(EventKind::Created, &format!("a{}", i)))).collect();
    let b: Vec<_> = (0..5).map(|i| Ok(ev(EventKind::Created, &format!("b{}", i)))).collect();
    mux.add_source(futures::stream::iter(a));
    mux.add_source(futures::stream::iter(b));
    let got: Vec<String> = mux.start().into_stream().map(|e| e.id).collect().await;
    assert_eq!(got.len(), 10);
    let only = |p: &str| got.iter().filter(|id| id.starts_with(&format!("ns1/{}", p))).cloned().collect::<Vec<_>>();
    assert_eq!(only("a"), (0..5).map(|i| format!("ns1/a{}", i)).collect::<Vec<_>>());
    assert_eq!(only("b"), (0..5).map(|i| format!("ns1/b{}", i)).collect::<Vec<_>>());
}
