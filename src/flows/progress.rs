//! Step-list progress tracking for flows.
//!
//! A tracker is a fixed, ordered list of step labels declared when the flow is
//! written. The flow advances through them via
//! [`FlowContext::progress`](crate::flows::FlowContext::progress); observers
//! subscribe through the RPC surface and receive one update per transition.
//!
//! The current index is checkpointed with the flow, so a resumed flow reports
//! the last step it reached rather than restarting its feed from the top.

use serde::{Deserialize, Serialize};

/// One progress transition, as streamed to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Zero-based index into the tracker's step list.
    pub index: usize,
    pub label: String,
}

/// Immutable view of a tracker, used as the feed snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressSnapshot {
    pub steps: Vec<String>,
    /// Index of the current step; `None` before the first transition.
    pub current: Option<usize>,
}

/// Tracks which declared step a flow is on and fans updates out to listeners.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    steps: Vec<String>,
    current: Option<usize>,
    listeners: Vec<flume::Sender<ProgressUpdate>>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new<S: Into<String>>(steps: impl IntoIterator<Item = S>) -> Self {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            current: None,
            listeners: Vec::new(),
        }
    }

    /// Rebuild a tracker from its checkpointed snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: ProgressSnapshot) -> Self {
        Self {
            steps: snapshot.steps,
            current: snapshot.current,
            listeners: Vec::new(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            steps: self.steps.clone(),
            current: self.current,
        }
    }

    /// Move the tracker to the named step and notify listeners.
    ///
    /// Unknown labels are ignored (with a warning) rather than failing the
    /// flow: progress is observability, not control flow.
    pub fn advance_to(&mut self, label: &str) -> bool {
        let Some(index) = self.steps.iter().position(|s| s == label) else {
            tracing::warn!(target: "ledgerflow::progress", label, "unknown progress step");
            return false;
        };
        self.current = Some(index);
        let update = ProgressUpdate {
            index,
            label: label.to_string(),
        };
        // Disconnected listeners are dropped on the way through.
        self.listeners
            .retain(|tx| tx.send(update.clone()).is_ok());
        true
    }

    /// Subscribe to future transitions. The current step, if any, is replayed
    /// first so late subscribers see where the flow already is.
    pub fn subscribe(&mut self) -> flume::Receiver<ProgressUpdate> {
        let (tx, rx) = flume::unbounded();
        if let Some(index) = self.current {
            let _ = tx.send(ProgressUpdate {
                index,
                label: self.steps[index].clone(),
            });
        }
        self.listeners.push(tx);
        rx
    }

    #[must_use]
    pub fn current_label(&self) -> Option<&str> {
        self.current.map(|i| self.steps[i].as_str())
    }
}
