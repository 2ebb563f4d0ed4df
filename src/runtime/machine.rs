//! The live, in-memory representation of one flow run.
//!
//! A [`FlowMachine`] is everything the manager holds for a run between
//! suspensions: the frame stack (bottom frame is the started flow, frames
//! above it are sub-flows), the suspension it is parked on, its session table,
//! the outbound envelopes recorded at the last suspension, and the
//! non-persistent result slot. Conversions to and from
//! [`PersistedCheckpoint`] are the checkpoint boundary: everything except the
//! result slot and the abort mark round-trips through the blob.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::checkpoints::{PersistedCheckpoint, PersistedFrame, PersistedSuspension};
use crate::flows::{Flow, FlowRegistry, FlowResume, ProgressTracker, RegistryError};
use crate::runtime::updates::{FlowDescriptor, FlowOutcome};
use crate::sessions::SessionTable;
use crate::types::{InitiatorKind, Party, RunId, TxId};
use crate::wire::Envelope;

/// The suspension a flow is parked on, live form.
#[derive(Clone, Debug, PartialEq)]
pub enum Suspension {
    /// Entry point not yet run (initial checkpoint, or a freshly pushed
    /// sub-flow frame).
    EntryPoint,
    /// A send was checkpointed. On an established session it resumes as soon
    /// as the transaction commits; a send that opened the session stays
    /// parked until the peer's confirm pins the conversation.
    Send { party: Party },
    /// Awaiting a `SessionData` from `party`.
    Receive { party: Party, type_hint: String },
    Sleep { deadline: DateTime<Utc> },
    LedgerCommit { tx_id: TxId },
}

impl From<&Suspension> for PersistedSuspension {
    fn from(s: &Suspension) -> Self {
        match s {
            Suspension::EntryPoint => PersistedSuspension::EntryPoint,
            Suspension::Send { party } => PersistedSuspension::Send {
                party: party.clone(),
            },
            Suspension::Receive { party, type_hint } => PersistedSuspension::Receive {
                party: party.clone(),
                type_hint: type_hint.clone(),
            },
            Suspension::Sleep { deadline } => PersistedSuspension::SleepUntil {
                deadline: deadline.to_rfc3339(),
            },
            Suspension::LedgerCommit { tx_id } => PersistedSuspension::LedgerCommit {
                tx_id: tx_id.clone(),
            },
        }
    }
}

impl From<PersistedSuspension> for Suspension {
    fn from(p: PersistedSuspension) -> Self {
        match p {
            PersistedSuspension::EntryPoint => Suspension::EntryPoint,
            PersistedSuspension::Send { party } => Suspension::Send { party },
            PersistedSuspension::Receive { party, type_hint } => {
                Suspension::Receive { party, type_hint }
            }
            PersistedSuspension::SleepUntil { deadline } => Suspension::Sleep {
                // An unreadable deadline wakes immediately; sleeping forever
                // would wedge the flow.
                deadline: DateTime::parse_from_rfc3339(&deadline)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            },
            PersistedSuspension::LedgerCommit { tx_id } => Suspension::LedgerCommit { tx_id },
        }
    }
}

/// One live flow run.
pub struct FlowMachine {
    pub run_id: RunId,
    pub initiator: InitiatorKind,
    /// Call stack, bottom first. Never empty while the machine is live.
    pub frames: Vec<Box<dyn Flow>>,
    pub suspension: Suspension,
    pub sessions: SessionTable,
    pub progress: ProgressTracker,
    /// Envelopes recorded at the current suspension; re-published verbatim on
    /// resurrection.
    pub outbox: Vec<Envelope>,
    /// Resume input waiting to be fed to the flow; `None` while parked.
    pub pending_input: Option<FlowResume>,
    /// Result slot. Not persisted: handles do not survive restarts.
    pub result_tx: Option<oneshot::Sender<FlowOutcome>>,
    /// Set by an external kill; honored at the next suspension point.
    pub abort_requested: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl FlowMachine {
    /// A freshly started machine: entry point pending, initial checkpoint not
    /// yet taken.
    #[must_use]
    pub fn new(run_id: RunId, initiator: InitiatorKind, flow: Box<dyn Flow>) -> Self {
        let progress = ProgressTracker::new(flow.progress_steps());
        Self {
            run_id,
            initiator,
            frames: vec![flow],
            suspension: Suspension::EntryPoint,
            sessions: SessionTable::new(),
            progress,
            outbox: Vec::new(),
            pending_input: Some(FlowResume::Start),
            result_tx: None,
            abort_requested: None,
            started_at: Utc::now(),
        }
    }

    /// The class name of the flow this run was started with.
    #[must_use]
    pub fn flow_class(&self) -> &'static str {
        // The bottom frame exists for the whole life of the machine.
        self.frames.first().map_or("<empty>", |f| f.class_name())
    }

    /// The class name of the currently executing frame (the innermost
    /// sub-flow, or the flow itself).
    #[must_use]
    pub fn active_class(&self) -> &'static str {
        self.frames.last().map_or("<empty>", |f| f.class_name())
    }

    #[must_use]
    pub fn descriptor(&self) -> FlowDescriptor {
        FlowDescriptor {
            run_id: self.run_id,
            flow_class: self.flow_class().to_string(),
            initiator: self.initiator.clone(),
            started_at: self.started_at,
        }
    }

    /// Snapshot this machine into its persisted form.
    pub fn to_persisted(&self) -> Result<PersistedCheckpoint, crate::flows::FlowError> {
        let mut frames = Vec::with_capacity(self.frames.len());
        for flow in &self.frames {
            frames.push(PersistedFrame {
                class: flow.class_name().to_string(),
                state: flow.save()?,
            });
        }
        Ok(PersistedCheckpoint {
            run_id: self.run_id.to_string(),
            initiator: self.initiator.clone(),
            frames,
            suspension: (&self.suspension).into(),
            sessions: self.sessions.clone(),
            outbox: self.outbox.clone(),
            progress: self.progress.snapshot(),
            created_at: Utc::now().to_rfc3339(),
        })
    }

    /// Rebuild a machine from a resurrected checkpoint.
    ///
    /// The pending input is re-derived from the suspension: an entry point
    /// restarts; everything else stays parked until the resurrecting manager
    /// re-publishes the outbox, re-arms timers, and re-tries delivery.
    pub fn from_persisted(
        cp: PersistedCheckpoint,
        registry: &FlowRegistry,
    ) -> Result<Self, RegistryError> {
        let run_id: RunId = cp
            .run_id
            .parse()
            .map_err(|e: uuid::Error| RegistryError::RestoreFailed {
                class: cp.run_id.clone(),
                detail: e.to_string(),
            })?;
        let started_at = cp.created_at_utc();
        let mut frames: Vec<Box<dyn Flow>> = Vec::with_capacity(cp.frames.len());
        for frame in cp.frames {
            frames.push(registry.restore(&frame.class, frame.state)?);
        }
        let suspension: Suspension = cp.suspension.into();
        let pending_input = match &suspension {
            Suspension::EntryPoint => Some(FlowResume::Start),
            // A checkpointed send resumes only once its session is known to
            // be confirmed; the resurrecting manager decides.
            _ => None,
        };
        Ok(Self {
            run_id,
            initiator: cp.initiator,
            frames,
            suspension,
            sessions: cp.sessions,
            progress: ProgressTracker::from_snapshot(cp.progress),
            outbox: cp.outbox,
            pending_input,
            result_tx: None,
            abort_requested: None,
            started_at,
        })
    }
}
