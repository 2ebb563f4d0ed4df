//! Flow authoring surface: the [`Flow`] trait, its suspension vocabulary, and
//! the execution context handed to every resume step.
//!
//! A flow is a sequential multi-party protocol whose locals are the fields of
//! a serde-serializable struct. The runtime drives it through
//! [`Flow::resume`]: each call receives the value the previous suspension was
//! waiting for ([`FlowResume`]) and returns either the next suspension request
//! or the flow's final result ([`FlowYield`]). The struct itself is the
//! continuation - it is serialized into the checkpoint at every suspension
//! point and restored byte-for-byte after a restart.
//!
//! The suspension points are exactly: `send`, `receive`, `sendAndReceive`,
//! `waitForLedgerCommit`, `sleep`, sub-flow boundaries, and the entry point.
//! Between them a flow runs without preemption.

pub mod errors;
pub mod progress;
pub mod registry;

pub use errors::{BusinessError, FlowError};
pub use progress::{ProgressSnapshot, ProgressTracker, ProgressUpdate};
pub use registry::{FlowRegistration, FlowRegistry, RegistryError};

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::sessions::SessionTable;
use crate::types::{InitiatorKind, Party, RunId, TxId};

/// The value a suspended flow is resumed with.
#[derive(Debug)]
pub enum FlowResume {
    /// First call after the entry-point checkpoint.
    Start,
    /// The previous `Send` was checkpointed and published.
    SendCompleted,
    /// A session payload arrived for the pending receive.
    Received { from: Party, payload: Value },
    /// The sub-flow pushed at the previous suspension finished.
    SubFlowFinished(Value),
    /// The awaited ledger transaction is persisted.
    TransactionCommitted(TxId),
    /// The requested sleep elapsed.
    SleepElapsed,
    /// The awaited value cannot arrive: the session ended or was rejected, the
    /// peer raised an exception, or the flow was aborted. A flow that does not
    /// handle the failure propagates it with `?`.
    Failed(FlowError),
}

impl FlowResume {
    /// Extract and decode the payload of a `Received` resume.
    ///
    /// `Failed` propagates as-is; a payload of the wrong shape becomes
    /// [`FlowError::Payload`] carrying the expected type hint; any other
    /// resume kind is a runtime contract violation.
    pub fn payload<T: DeserializeOwned>(self, expected: &'static str) -> Result<T, FlowError> {
        match self {
            Self::Received { payload, .. } => {
                serde_json::from_value(payload).map_err(|e| FlowError::Payload {
                    expected: expected.to_string(),
                    detail: e.to_string(),
                })
            }
            Self::Failed(err) => Err(err),
            other => Err(FlowError::fatal(format!(
                "expected a received payload, got {other:?}"
            ))),
        }
    }

    /// Confirm a `SendCompleted` resume, propagating delivered failures.
    pub fn sent(self) -> Result<(), FlowError> {
        match self {
            Self::SendCompleted => Ok(()),
            Self::Failed(err) => Err(err),
            other => Err(FlowError::fatal(format!(
                "expected send completion, got {other:?}"
            ))),
        }
    }

    /// Extract the result of a finished sub-flow.
    pub fn subflow_result<T: DeserializeOwned>(self, expected: &'static str) -> Result<T, FlowError> {
        match self {
            Self::SubFlowFinished(value) => {
                serde_json::from_value(value).map_err(|e| FlowError::Payload {
                    expected: expected.to_string(),
                    detail: e.to_string(),
                })
            }
            Self::Failed(err) => Err(err),
            other => Err(FlowError::fatal(format!(
                "expected a sub-flow result, got {other:?}"
            ))),
        }
    }
}

/// An I/O operation a flow suspends on.
pub enum SuspendRequest {
    /// Serialize `payload` into a `SessionData` on the session with `to`,
    /// creating the session with a `SessionInit` if absent, and publish it.
    /// Resumes with [`FlowResume::SendCompleted`] once checkpointed.
    Send { to: Party, payload: Value },
    /// Park until a `SessionData` arrives from `to`. `type_hint` names the
    /// expected type for error reporting.
    Receive { from: Party, type_hint: &'static str },
    /// Atomically enqueue a send and then receive; one suspension point.
    SendAndReceive {
        to: Party,
        payload: Value,
        type_hint: &'static str,
    },
    /// Park until the external ledger reports the transaction persisted.
    WaitForLedgerCommit { tx_id: TxId },
    /// Park until the duration elapses.
    Sleep { duration: Duration },
    /// Run another flow to completion on this flow's stack. Sessions it opens
    /// belong to the same run-id.
    SubFlow { flow: Box<dyn Flow> },
}

impl fmt::Debug for SuspendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send { to, .. } => f.debug_struct("Send").field("to", to).finish_non_exhaustive(),
            Self::Receive { from, type_hint } => f
                .debug_struct("Receive")
                .field("from", from)
                .field("type_hint", type_hint)
                .finish(),
            Self::SendAndReceive { to, type_hint, .. } => f
                .debug_struct("SendAndReceive")
                .field("to", to)
                .field("type_hint", type_hint)
                .finish_non_exhaustive(),
            Self::WaitForLedgerCommit { tx_id } => f
                .debug_struct("WaitForLedgerCommit")
                .field("tx_id", tx_id)
                .finish(),
            Self::Sleep { duration } => {
                f.debug_struct("Sleep").field("duration", duration).finish()
            }
            Self::SubFlow { flow } => f
                .debug_struct("SubFlow")
                .field("class", &flow.class_name())
                .finish(),
        }
    }
}

/// What a resume step produced: the next suspension, or the final result.
#[derive(Debug)]
pub enum FlowYield {
    Suspend(SuspendRequest),
    Finished(Value),
}

impl FlowYield {
    /// Suspend on a send.
    #[must_use]
    pub fn send(to: Party, payload: impl Serialize) -> Self {
        Self::Suspend(SuspendRequest::Send {
            to,
            payload: to_value_lossy(payload),
        })
    }

    /// Suspend on a receive of `T` (named by `type_hint`).
    #[must_use]
    pub fn receive(from: Party, type_hint: &'static str) -> Self {
        Self::Suspend(SuspendRequest::Receive { from, type_hint })
    }

    /// Suspend on a combined send-then-receive.
    #[must_use]
    pub fn send_and_receive(to: Party, payload: impl Serialize, type_hint: &'static str) -> Self {
        Self::Suspend(SuspendRequest::SendAndReceive {
            to,
            payload: to_value_lossy(payload),
            type_hint,
        })
    }

    #[must_use]
    pub fn wait_for_ledger_commit(tx_id: TxId) -> Self {
        Self::Suspend(SuspendRequest::WaitForLedgerCommit { tx_id })
    }

    #[must_use]
    pub fn sleep(duration: Duration) -> Self {
        Self::Suspend(SuspendRequest::Sleep { duration })
    }

    #[must_use]
    pub fn subflow(flow: impl Flow) -> Self {
        Self::Suspend(SuspendRequest::SubFlow {
            flow: Box::new(flow),
        })
    }

    /// Finish the flow with `result` as its terminal value.
    #[must_use]
    pub fn finished(result: impl Serialize) -> Self {
        Self::Finished(to_value_lossy(result))
    }
}

fn to_value_lossy(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// A multi-step, possibly multi-party business protocol.
///
/// Implementations are plain structs whose fields are the protocol's locals,
/// usually with a small state enum recording which suspension the flow is at.
/// The runtime guarantees `resume` is never called concurrently for the same
/// run-id, and that every suspension was checkpointed before the resume that
/// answers it.
pub trait Flow: Send + 'static {
    /// Fully-qualified class name, used for registry lookup, `SessionInit`,
    /// and checkpoint restore. Must be stable across versions of the node.
    fn class_name(&self) -> &'static str;

    /// Ordered step labels for this flow's progress tracker. Flows that do
    /// not report progress keep the default empty list.
    fn progress_steps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Advance the flow by one step.
    fn resume(
        &mut self,
        ctx: &mut FlowContext<'_>,
        input: FlowResume,
    ) -> Result<FlowYield, FlowError>;

    /// Serialize the flow's locals for checkpointing.
    ///
    /// Most implementations delegate to [`save_state`].
    fn save(&self) -> Result<Value, FlowError>;
}

/// Serialize a flow struct for its [`Flow::save`] implementation.
pub fn save_state<F: Flow + Serialize>(flow: &F) -> Result<Value, FlowError> {
    serde_json::to_value(flow).map_err(|e| FlowError::State {
        detail: e.to_string(),
    })
}

/// Execution context handed to every resume step.
///
/// Service handles are deliberately absent: anything a flow needs from the
/// node is reached through this context so that nothing unserializable ends up
/// in flow locals.
pub struct FlowContext<'a> {
    run_id: RunId,
    our_identity: &'a Party,
    initiator: &'a InitiatorKind,
    progress: &'a mut ProgressTracker,
    sessions: &'a SessionTable,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(
        run_id: RunId,
        our_identity: &'a Party,
        initiator: &'a InitiatorKind,
        progress: &'a mut ProgressTracker,
        sessions: &'a SessionTable,
    ) -> Self {
        Self {
            run_id,
            our_identity,
            initiator,
            progress,
            sessions,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The identity this node advertises to counterparties.
    #[must_use]
    pub fn our_identity(&self) -> &Party {
        self.our_identity
    }

    /// Who started this flow.
    #[must_use]
    pub fn initiator(&self) -> &InitiatorKind {
        self.initiator
    }

    /// Move the flow's progress tracker to the named step.
    pub fn progress(&mut self, label: &str) {
        self.progress.advance_to(label);
    }

    /// The protocol version the counterparty actually speaks on the session
    /// with `party`, once the handshake settled it.
    #[must_use]
    pub fn peer_version(&self, party: &Party) -> Option<u32> {
        self.sessions.peer_version(party)
    }
}
