//! Gantry watch multiplexer.
//!
//! A client watch request is served by one [`WatchFeed`]. The [`Multiplexer`] bridges
//! one or more underlying event sources into that feed with one relay task per source,
//! all writing into a single bounded queue and all bound to one cancellation token.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt};
use gantry_core::{ApiEvent, EventKind, GatewayResult};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 256;

/// An underlying source of events for one watch.
pub type EventSource = BoxStream<'static, GatewayResult<ApiEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Open,
    Streaming,
    Closed,
}

const OPEN: u8 = 0;
const STREAMING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of one watch. All transitions are atomic; `Closed` is terminal and is
/// entered exactly once no matter how many paths race to close.
#[derive(Debug, Default)]
pub struct StateCell {
    state: AtomicU8,
    failed: AtomicBool,
}

impl StateCell {
    pub fn get(&self) -> WatchState {
        match self.state.load(Ordering::Acquire) {
            OPEN => WatchState::Open,
            STREAMING => WatchState::Streaming,
            _ => WatchState::Closed,
        }
    }

    /// `Open -> Streaming`; false if the watch already left `Open`.
    pub fn begin_streaming(&self) -> bool {
        self.state.compare_exchange(OPEN, STREAMING, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Enter `Closed`. Returns true only for the caller that performed the transition.
    pub fn close(&self) -> bool { self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED }

    /// First source failure wins the right to emit the terminal error event.
    fn claim_failure(&self) -> bool { !self.failed.swap(true, Ordering::AcqRel) }
}

/// Builder for one request's feed.
pub struct Multiplexer {
    resource_type: String,
    cancel: CancellationToken,
    capacity: usize,
    sources: Vec<EventSource>,
}

impl Multiplexer {
    /// `request` is the request's cancellation signal; the feed gets a child of it so
    /// that cancelling the feed never cancels the request itself.
    pub fn new(request: &CancellationToken, resource_type: impl Into<String>) -> Self {
        Self { resource_type: resource_type.into(), cancel: request.child_token(), capacity: DEFAULT_CAPACITY, sources: Vec::new() }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn add_source<S>(&mut self, source: S)
    where
        S: Stream<Item = GatewayResult<ApiEvent>> + Send + 'static,
    {
        self.sources.push(source.boxed());
    }

    pub fn source_count(&self) -> usize { self.sources.len() }

    /// Spawns the relays and returns the feed. A multiplexer without sources yields an
    /// already closed feed.
    pub fn start(self) -> WatchFeed {
        let (tx, rx) = mpsc::channel(self.capacity);
        let state = Arc::new(StateCell::default());
        let feed = WatchFeed { rx, cancel: self.cancel.clone(), state: Arc::clone(&state), resource_type: self.resource_type.clone(), done: false };
        if self.sources.is_empty() {
            state.close();
            return feed;
        }
        state.begin_streaming();
        metrics::increment_counter!("watch_feeds_started_total");
        metrics::increment_gauge!("watch_feeds_open", 1.0);

        // Relays stop on request/feed cancellation and on the first source failure;
        // the latter must not look like a cancellation to the reader.
        let stop = self.cancel.child_token();
        let mut relays = JoinSet::new();
        for (idx, source) in self.sources.into_iter().enumerate() {
            relays.spawn(relay(idx, source, tx.clone(), stop.clone(), Arc::clone(&state), self.resource_type.clone()));
        }
        drop(tx);
        let resource_type = self.resource_type;
        tokio::spawn(async move {
            while relays.join_next().await.is_some() {}
            stop.cancel();
            metrics::decrement_gauge!("watch_feeds_open", 1.0);
            if state.close() {
                debug!(resource_type = %resource_type, "watch closed");
            }
        });
        feed
    }
}

async fn relay(
    idx: usize,
    mut source: EventSource,
    tx: mpsc::Sender<ApiEvent>,
    stop: CancellationToken,
    state: Arc<StateCell>,
    resource_type: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                let sent = tokio::select! {
                    biased;
                    _ = stop.cancelled() => false,
                    res = tx.send(event) => res.is_ok(),
                };
                if !sent {
                    break;
                }
            }
            Some(Err(e)) => {
                if state.claim_failure() && !stop.is_cancelled() {
                    warn!(resource_type = %resource_type, source = idx, error = %e, "watch source failed; closing feed");
                    metrics::counter!("watch_source_errors_total", 1u64, "kind" => e.kind());
                    let event = ApiEvent::error(resource_type.clone(), e.to_string());
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => {}
                        _ = tx.send(event) => {}
                    }
                }
                stop.cancel();
                break;
            }
            None => {
                debug!(resource_type = %resource_type, source = idx, "watch source exhausted");
                break;
            }
        }
    }
}

/// The per-request output of a watch. Dropping the feed cancels it.
pub struct WatchFeed {
    rx: mpsc::Receiver<ApiEvent>,
    cancel: CancellationToken,
    state: Arc<StateCell>,
    resource_type: String,
    done: bool,
}

impl WatchFeed {
    /// Next event, or `None` once the feed is closed. Nothing is yielded after
    /// cancellation or after the terminal error event, even if sibling sources
    /// managed to queue more.
    pub async fn next(&mut self) -> Option<ApiEvent> {
        if self.done || self.cancel.is_cancelled() {
            self.finish();
            return None;
        }
        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        };
        match &event {
            None => self.finish(),
            Some(e) if e.kind == EventKind::Error => self.finish(),
            Some(_) => {}
        }
        event
    }

    pub fn cancel(&self) { self.cancel.cancel(); }

    pub fn cancellation(&self) -> CancellationToken { self.cancel.clone() }

    pub fn state(&self) -> WatchState { self.state.get() }

    pub fn resource_type(&self) -> &str { &self.resource_type }

    pub fn into_stream(self) -> impl Stream<Item = ApiEvent> + Send + 'static {
        futures::stream::unfold(self, |mut feed| async move { feed.next().await.map(|event| (event, feed)) })
    }

    fn finish(&mut self) {
        self.done = true;
        self.rx.close();
        if self.state.close() {
            debug!(resource_type = %self.resource_type, "watch closed by reader");
        }
    }
}

impl Drop for WatchFeed {
    fn drop(&mut self) { self.cancel.cancel(); }
}

/// A source that yields `events` and then stays silent until the feed is cancelled.
pub fn once_then_idle(events: Vec<ApiEvent>) -> impl Stream<Item = GatewayResult<ApiEvent>> + Send + 'static {
    futures::stream::iter(events.into_iter().map(Ok)).chain(futures::stream::pending())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_claimed_once() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), WatchState::Open);
        assert!(cell.begin_streaming());
        assert!(!cell.begin_streaming());
        assert!(cell.close());
        assert!(!cell.close());
        assert_eq!(cell.get(), WatchState::Closed);
        assert!(!cell.begin_streaming());
    }

    #[test]
    fn concurrent_closers_see_one_transition() {
        let cell = Arc::new(StateCell::default());
        cell.begin_streaming();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c = Arc::clone(&cell);
                std::thread::spawn(move || c.close())
            })
            .collect();
        let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|w| *w).count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn first_failure_only() {
        let cell = StateCell::default();
        assert!(cell.claim_failure());
        assert!(!cell.claim_failure());
    }
}
