// [[STUDIO]]/apps/studio-server/src/bus.rs
// Purpose: Per-run ordered event queue with a one-shot completion flag.
// Architecture: Run Transport Layer
// Dependencies: Tokio (mpsc, watch, Mutex), tokio-util, Futures

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::events::{EventKind, RuntimeEvent};
use crate::observability::{RunCounters, RunMetrics};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("event bus for run {0} is closed")]
    Closed(String),
}

/// How a run's stream was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Destination for run events. Implemented by [`EventBus`]; steps and the
/// interaction hub only ever see this seam.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, kind: EventKind) -> Result<u64, BusError>;
}

enum Outbox {
    Unbounded(mpsc::UnboundedSender<RuntimeEvent>),
    Bounded(mpsc::Sender<RuntimeEvent>),
}

impl Outbox {
    async fn send(&self, event: RuntimeEvent) -> bool {
        match self {
            Outbox::Unbounded(tx) => tx.send(event).is_ok(),
            Outbox::Bounded(tx) => tx.send(event).await.is_ok(),
        }
    }

    /// Never waits; hands the event back when the queue is full.
    fn try_send(&self, event: RuntimeEvent) -> Result<(), RuntimeEvent> {
        match self {
            Outbox::Unbounded(tx) => tx.send(event).map_err(|e| e.0),
            Outbox::Bounded(tx) => tx.try_send(event).map_err(|e| match e {
                TrySendError::Full(event) | TrySendError::Closed(event) => event,
            }),
        }
    }
}

enum Inbox {
    Unbounded(mpsc::UnboundedReceiver<RuntimeEvent>),
    Bounded(mpsc::Receiver<RuntimeEvent>),
}

impl Inbox {
    async fn recv(&mut self) -> Option<RuntimeEvent> {
        match self {
            Inbox::Unbounded(rx) => rx.recv().await,
            Inbox::Bounded(rx) => rx.recv().await,
        }
    }
}

struct Emitter {
    // Dropped together with the terminal event; that is the completion flag.
    outbox: Option<Outbox>,
    next_seq: u64,
}

pub struct EventBus {
    run_id: String,
    emitter: Mutex<Emitter>,
    inbox: Mutex<Inbox>,
    // Terminal event that found the queue full; delivered after the backlog.
    parked: Mutex<Option<RuntimeEvent>>,
    // Fired by `close_with_error`; aborts emits waiting for queue space.
    closing: CancellationToken,
    outcome: watch::Sender<Option<RunOutcome>>,
    counters: RunCounters,
}

impl EventBus {
    /// `capacity` of `None` (or zero) gives an unbounded queue; otherwise
    /// `emit` waits for the consumer once `capacity` events are queued.
    pub fn new(run_id: &str, capacity: Option<usize>) -> Self {
        let (outbox, inbox) = match capacity.filter(|c| *c > 0) {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (Outbox::Bounded(tx), Inbox::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Outbox::Unbounded(tx), Inbox::Unbounded(rx))
            }
        };
        let (outcome, _) = watch::channel(None);

        Self {
            run_id: run_id.to_string(),
            emitter: Mutex::new(Emitter {
                outbox: Some(outbox),
                next_seq: 0,
            }),
            inbox: Mutex::new(inbox),
            parked: Mutex::new(None),
            closing: CancellationToken::new(),
            outcome,
            counters: RunCounters::default(),
        }
    }

    /// Enqueue an event. A terminal event closes the bus right after it is
    /// queued; anything emitted afterwards is rejected with [`BusError::Closed`].
    pub async fn emit(&self, kind: EventKind) -> Result<u64, BusError> {
        let outcome = match &kind {
            EventKind::RunEnd => Some(RunOutcome::Completed),
            EventKind::Error { .. } => Some(RunOutcome::Failed),
            _ => None,
        };
        self.enqueue(kind, outcome).await
    }

    /// Terminate the stream with an `Error` unless a terminal event was
    /// already queued. Returns whether this call closed the bus. Never waits
    /// for queue space: a producer blocked on a full queue is released with
    /// [`BusError::Closed`], and a terminal event that does not fit is parked
    /// until the consumer has drained the backlog.
    pub async fn close_with_error(&self, message: &str, outcome: RunOutcome) -> bool {
        self.closing.cancel();
        let mut emitter = self.emitter.lock().await;
        let outbox = match emitter.outbox.take() {
            Some(outbox) => outbox,
            None => return false,
        };

        let kind = EventKind::error(message, None);
        self.counters.record(&kind);
        let event = RuntimeEvent::new(&self.run_id, emitter.next_seq, kind);
        emitter.next_seq += 1;
        if let Err(event) = outbox.try_send(event) {
            tracing::debug!("Run {}: queue full, parking terminal event #{}", self.run_id, event.seq);
            *self.parked.lock().await = Some(event);
        }
        // Parked before the sender drops, so `drain` sees it once the queue empties.
        drop(outbox);

        self.outcome.send_replace(Some(outcome));
        tracing::info!("Run {}: stream closed ({:?})", self.run_id, outcome);
        true
    }

    async fn enqueue(&self, kind: EventKind, outcome: Option<RunOutcome>) -> Result<u64, BusError> {
        let mut emitter = self.emitter.lock().await;
        let seq = emitter.next_seq;
        let outbox = match emitter.outbox.as_ref() {
            Some(outbox) => outbox,
            None => {
                tracing::warn!("Run {}: dropping {} emitted after stream end", self.run_id, kind.name());
                return Err(BusError::Closed(self.run_id.clone()));
            }
        };

        self.counters.record(&kind);
        let event = RuntimeEvent::new(&self.run_id, seq, kind);
        tracing::debug!(
            "Run {}: #{} {} {}",
            self.run_id,
            seq,
            event.kind.name(),
            event.kind.node_id().unwrap_or("-")
        );

        let sent = tokio::select! {
            biased;
            _ = self.closing.cancelled() => false,
            sent = outbox.send(event) => sent,
        };
        if !sent {
            tracing::debug!("Run {}: #{} dropped, stream is closing", self.run_id, seq);
            return Err(BusError::Closed(self.run_id.clone()));
        }
        emitter.next_seq += 1;

        if let Some(outcome) = outcome {
            emitter.outbox = None;
            self.outcome.send_replace(Some(outcome));
            tracing::info!("Run {}: stream closed ({:?})", self.run_id, outcome);
        }
        Ok(seq)
    }

    /// Next queued event, or `None` once the bus is closed and empty.
    pub async fn drain(&self) -> Option<RuntimeEvent> {
        if let Some(event) = self.inbox.lock().await.recv().await {
            return Some(event);
        }
        self.parked.lock().await.take()
    }

    /// Every event still to be drained, ending after the terminal one.
    pub fn stream(self: Arc<Self>) -> impl Stream<Item = RuntimeEvent> + Send + 'static {
        stream::unfold(self, |bus| async move {
            let event = bus.drain().await?;
            Some((event, bus))
        })
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        *self.outcome.borrow()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome().is_some()
    }

    /// Resolves once the terminal event has been queued.
    pub async fn wait_complete(&self) -> RunOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = *rx.borrow_and_update() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender lives in self; unreachable while borrowed.
                return RunOutcome::Failed;
            }
        }
    }

    pub fn metrics(&self) -> RunMetrics {
        self.counters.snapshot()
    }
}

#[async_trait]
impl EventEmitter for EventBus {
    async fn emit(&self, kind: EventKind) -> Result<u64, BusError> {
        EventBus::emit(self, kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn start(id: &str) -> EventKind {
        EventKind::NodeStart { node_id: id.to_string() }
    }

    #[tokio::test]
    async fn test_drain_preserves_emit_order_and_ends_after_terminal() {
        let bus = Arc::new(EventBus::new("r1", None));
        bus.emit(start("a")).await.unwrap();
        bus.emit(start("b")).await.unwrap();
        bus.emit(EventKind::RunEnd).await.unwrap();

        let events: Vec<_> = bus.clone().stream().collect().await;
        let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(bus.outcome(), Some(RunOutcome::Completed));
    }

    #[tokio::test]
    async fn test_emit_after_terminal_is_rejected() {
        let bus = EventBus::new("r1", None);
        bus.emit(EventKind::error("boom", Some("A".into()))).await.unwrap();

        let err = bus.emit(EventKind::RunEnd).await.unwrap_err();
        assert_eq!(err, BusError::Closed("r1".into()));
        assert!(!bus.close_with_error("late", RunOutcome::Cancelled).await);
        assert_eq!(bus.outcome(), Some(RunOutcome::Failed));
        assert_eq!(bus.metrics().events_emitted, 1);
    }

    #[tokio::test]
    async fn test_close_with_error_synthesizes_terminal() {
        let bus = EventBus::new("r1", None);
        bus.emit(start("a")).await.unwrap();
        assert!(bus.close_with_error("run cancelled", RunOutcome::Cancelled).await);

        assert_eq!(bus.drain().await.unwrap().kind, start("a"));
        let last = bus.drain().await.unwrap();
        assert_eq!(last.kind, EventKind::error("run cancelled", None));
        assert!(bus.drain().await.is_none());
        assert_eq!(bus.wait_complete().await, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_bounded_bus_applies_backpressure() {
        let bus = Arc::new(EventBus::new("r1", Some(1)));
        bus.emit(start("a")).await.unwrap();

        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(start("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(bus.drain().await.unwrap().seq, 0);
        assert_eq!(producer.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_late_consumer_sees_only_unconsumed_events() {
        let bus = Arc::new(EventBus::new("r1", None));
        bus.emit(start("a")).await.unwrap();
        assert_eq!(bus.drain().await.unwrap().seq, 0);

        bus.emit(start("b")).await.unwrap();
        bus.emit(EventKind::RunEnd).await.unwrap();
        let rest: Vec<_> = bus.clone().stream().map(|e| e.seq).collect().await;
        assert_eq!(rest, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_close_releases_producer_blocked_on_full_queue() {
        let bus = Arc::new(EventBus::new("r1", Some(1)));
        bus.emit(start("a")).await.unwrap();
        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(start("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closed = tokio::time::timeout(
            Duration::from_secs(1),
            bus.close_with_error("run cancelled", RunOutcome::Cancelled),
        )
        .await;
        assert_eq!(closed, Ok(true));
        assert_eq!(producer.await.unwrap(), Err(BusError::Closed("r1".into())));

        let events: Vec<_> = bus.clone().stream().collect().await;
        let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(events[0].kind, start("a"));
        assert_eq!(events[1].kind, EventKind::error("run cancelled", None));
    }

    #[tokio::test]
    async fn test_terminal_event_waits_behind_backlog() {
        let bus = EventBus::new("r1", Some(2));
        bus.emit(start("a")).await.unwrap();
        bus.emit(start("b")).await.unwrap();
        assert!(bus.close_with_error("shutting down", RunOutcome::Cancelled).await);
        assert_eq!(bus.outcome(), Some(RunOutcome::Cancelled));

        assert_eq!(bus.drain().await.unwrap().seq, 0);
        assert_eq!(bus.drain().await.unwrap().seq, 1);
        let last = bus.drain().await.unwrap();
        assert_eq!((last.seq, last.is_terminal()), (2, true));
        assert!(bus.drain().await.is_none());
        assert_eq!(bus.emit(start("c")).await, Err(BusError::Closed("r1".into())));
    }
}
