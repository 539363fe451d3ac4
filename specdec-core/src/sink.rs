//! The `EventSink` boundary (§2 item 6, §5): receives the typed event
//! sequence, optionally staggering delivery in wall-clock time for
//! animation without ever reordering. The actual WebSocket/HTTP transport
//! that wraps this is an out-of-scope external collaborator (spec §1); this
//! module only provides the in-process channel plumbing a transport would
//! sit on top of, grounded on the teacher's `tokio`-first concurrency style
//! (e.g. `Arc<tokio::sync::Mutex<_>>` around pipelines in
//! `pipeline/speculative.rs`).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::events::Event;

/// Receives events for one generation, in strict causal order (§5).
/// Implementations may block for backpressure (a suspension point per
/// §5) but must not reorder.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event) -> Result<()>;
}

/// A `tokio::sync::mpsc`-backed sink: the natural Rust shape for "stream
/// events to a consumer" when the consumer lives on the other side of a
/// channel (a WebSocket write loop, a test harness, etc).
pub struct ChannelEventSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: Event) -> Result<()> {
        // A closed receiver just means the consumer went away; that is not
        // a generation-fatal condition, so we swallow the send error rather
        // than surfacing a SpecdecError for it.
        let _ = self.tx.send(event).await;
        Ok(())
    }
}

/// Wraps an inner sink and sleeps between `DraftToken`/`VerifyResult`
/// events for visualization pacing (§5: "An optional wall-clock stagger
/// (e.g., 50 ms between DraftToken events, 80 ms between VerifyResult
/// events) MAY be inserted by the sink adapter for animation; it must not
/// reorder."). `Metrics`, `Done`, and `Error` events pass through
/// immediately.
pub struct StaggeredEventSink<S> {
    inner: S,
    draft_token_stagger: Duration,
    verify_result_stagger: Duration,
}

impl<S: EventSink> StaggeredEventSink<S> {
    pub fn new(inner: S, draft_token_stagger: Duration, verify_result_stagger: Duration) -> Self {
        Self {
            inner,
            draft_token_stagger,
            verify_result_stagger,
        }
    }
}

#[async_trait]
impl<S: EventSink> EventSink for StaggeredEventSink<S> {
    async fn emit(&self, event: Event) -> Result<()> {
        match &event {
            Event::DraftToken { .. } => tokio::time::sleep(self.draft_token_stagger).await,
            Event::VerifyResult { .. } => tokio::time::sleep(self.verify_result_stagger).await,
            _ => {}
        }
        self.inner.emit(event).await
    }
}

/// An in-memory sink that just collects events, used by tests and by any
/// embedder that wants to inspect a full run synchronously rather than
/// stream it.
#[derive(Default)]
pub struct CollectingEventSink {
    events: tokio::sync::Mutex<Vec<Event>>,
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: Event) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

impl CollectingEventSink {
    pub async fn into_events(self) -> Vec<Event> {
        self.events.into_inner()
    }
}
