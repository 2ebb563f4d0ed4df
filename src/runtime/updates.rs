//! Broadcast feeds for state-machine lifecycle observers.
//!
//! All external streams share one shape: [`Feed`] pairs an immutable snapshot
//! with a live delta stream. Streams are broadcast; subscribers are
//! independent and a slow subscriber never blocks flow progress - the hub
//! buffer is bounded, overflow drops the oldest items, and the subscriber
//! observes an explicit [`FeedItem::Lost`] marker carrying the missed count.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast::{self, Receiver, Sender, error::RecvError};

use crate::flows::FlowError;
use crate::types::{InitiatorKind, RunId};

/// Description of a live flow, as exposed by snapshots and `Added` updates.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowDescriptor {
    pub run_id: RunId,
    pub flow_class: String,
    pub initiator: InitiatorKind,
    pub started_at: DateTime<Utc>,
}

/// Terminal result of a flow.
#[derive(Clone, Debug, PartialEq)]
pub enum FlowOutcome {
    Completed(Value),
    Failed(FlowError),
}

impl FlowOutcome {
    /// Convert into the result callers of the RPC surface await.
    #[must_use]
    pub fn into_result(self) -> Result<Value, FlowError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(err) => Err(err),
        }
    }
}

/// One delta on the state-machines feed.
#[derive(Clone, Debug, PartialEq)]
pub enum StateMachineUpdate {
    Added {
        descriptor: FlowDescriptor,
    },
    Removed {
        run_id: RunId,
        outcome: FlowOutcome,
    },
}

/// Snapshot of hub health for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedMetrics {
    /// Maximum items buffered per subscriber before loss occurs.
    pub capacity: usize,
    /// Total items dropped across all subscribers due to lag.
    pub dropped: usize,
}

/// Broadcast hub behind every feed.
#[derive(Debug)]
pub struct FeedHub<T> {
    sender: RwLock<Option<Sender<T>>>,
    dropped: AtomicUsize,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FeedHub<T> {
    /// Create a hub with the given per-subscriber buffer capacity (clamped to
    /// at least 1 to satisfy the broadcast API).
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender: RwLock::new(Some(sender)),
            dropped: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Publish to all subscribers. Publishing to a hub with no subscribers, or
    /// to a closed hub, is a silent no-op: feeds are observability, and flow
    /// progress never depends on anyone listening.
    pub fn publish(&self, item: T) {
        if let Some(sender) = self.sender.read().as_ref() {
            let _ = sender.send(item);
        }
    }

    /// Subscribe to deltas published after this call.
    ///
    /// A closed hub yields an already-terminated stream to keep downstream
    /// code simple.
    pub fn subscribe(self: &Arc<Self>) -> FeedStream<T> {
        let receiver = self
            .sender
            .read()
            .as_ref()
            .map(Sender::subscribe)
            .unwrap_or_else(|| {
                let (sender, receiver) = broadcast::channel(self.capacity);
                drop(sender);
                receiver
            });
        FeedStream {
            receiver,
            hub: Arc::clone(self),
        }
    }

    pub fn metrics(&self) -> FeedMetrics {
        FeedMetrics {
            capacity: self.capacity,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the hub; subscribers see end-of-stream after draining.
    pub fn close(&self) {
        let _ = self.sender.write().take();
    }

    fn record_lag(&self, missed: u64) {
        let increment = usize::try_from(missed).unwrap_or(usize::MAX);
        let total = self
            .dropped
            .fetch_add(increment, Ordering::Relaxed)
            .saturating_add(increment);
        tracing::warn!(
            target: "ledgerflow::feeds",
            missed,
            total_dropped = total,
            "feed subscriber lagged; dropped oldest updates"
        );
    }
}

/// One item observed by a feed subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedItem<T> {
    Update(T),
    /// The subscriber fell behind and `missed` updates were dropped (oldest
    /// first) before the next one it will see.
    Lost { missed: u64 },
}

/// Subscriber half of a feed. Closing (dropping) the stream is the
/// subscriber's responsibility; the hub never blocks on it.
#[derive(Debug)]
pub struct FeedStream<T> {
    receiver: Receiver<T>,
    hub: Arc<FeedHub<T>>,
}

impl<T: Clone + Send + 'static> FeedStream<T> {
    /// Next item, or `None` once the hub is closed and drained.
    pub async fn recv(&mut self) -> Option<FeedItem<T>> {
        match self.receiver.recv().await {
            Ok(item) => Some(FeedItem::Update(item)),
            Err(RecvError::Lagged(missed)) => {
                self.hub.record_lag(missed);
                Some(FeedItem::Lost { missed })
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv): `None` when nothing is
    /// currently buffered.
    pub fn try_recv(&mut self) -> Option<FeedItem<T>> {
        use tokio::sync::broadcast::error::TryRecvError;
        match self.receiver.try_recv() {
            Ok(item) => Some(FeedItem::Update(item)),
            Err(TryRecvError::Lagged(missed)) => {
                self.hub.record_lag(missed);
                Some(FeedItem::Lost { missed })
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Adapt into a [`Stream`], for RPC transports that forward feeds as
    /// server-sent frames.
    pub fn into_stream(self) -> impl Stream<Item = FeedItem<T>> + Send {
        stream::unfold(self, |mut feed| async move {
            feed.recv().await.map(|item| (item, feed))
        })
    }
}

/// An (immutable snapshot, live delta stream) pair.
#[derive(Debug)]
pub struct Feed<S, T> {
    pub snapshot: S,
    pub updates: FeedStream<T>,
}
