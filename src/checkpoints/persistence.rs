/*!
Persistence models for checkpoint blobs.

Design goals:
- Explicit serde-friendly structs decoupled from runtime types, so the store
  code stays lean and the blob layout is reviewable in one place.
- A mandatory schema-version byte prefix on every blob; a mismatched version
  fails the resume with a fatal error reported out-of-band rather than a
  guessy migration.
- No I/O here. Pure data transformation and (de)serialization glue.

The blob encodes the flow's frame stack (one frame per flow/sub-flow on the
call stack), the suspension the flow is parked on, its session table, its
unacknowledged outbox, and the progress snapshot. No external consumer may
depend on this structure.
*/

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::flows::ProgressSnapshot;
use crate::sessions::SessionTable;
use crate::types::{InitiatorKind, Party, TxId};
use crate::wire::Envelope;

/// Version byte prefixed to every checkpoint blob.
pub const CHECKPOINT_SCHEMA_VERSION: u8 = 1;

/// One frame of a flow's call stack: the flow class plus its serialized
/// locals. The bottom frame is the flow the run was started with; frames above
/// it are sub-flows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedFrame {
    pub class: String,
    pub state: Value,
}

/// The suspension the checkpointed flow is parked on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedSuspension {
    /// The entry point has not run yet (initial checkpoint, or a sub-flow
    /// about to start).
    EntryPoint,
    /// A send to `party` was checkpointed; the flow resumes once the session
    /// is confirmed and the outbox re-published.
    Send { party: Party },
    /// Awaiting a `SessionData` from `party`.
    Receive { party: Party, type_hint: String },
    /// Asleep until the deadline (RFC 3339).
    SleepUntil { deadline: String },
    /// Awaiting persistence of a ledger transaction.
    LedgerCommit { tx_id: TxId },
}

/// Full persisted shape of a suspended flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedCheckpoint {
    pub run_id: String,
    pub initiator: InitiatorKind,
    /// Call stack, bottom first. Never empty.
    pub frames: Vec<PersistedFrame>,
    pub suspension: PersistedSuspension,
    pub sessions: SessionTable,
    /// Outbound envelopes recorded at this suspension and possibly not yet
    /// acknowledged by the transport; re-published verbatim on resurrection.
    #[serde(default)]
    pub outbox: Vec<Envelope>,
    #[serde(default)]
    pub progress: ProgressSnapshot,
    /// RFC 3339 creation time of this checkpoint.
    pub created_at: String,
}

impl PersistedCheckpoint {
    /// Parse the persisted creation time, falling back to now for blobs with
    /// an unreadable timestamp (the timestamp is informational only).
    #[must_use]
    pub fn created_at_utc(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }
}

/// Blob encoding/decoding errors.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("checkpoint blob is empty")]
    #[diagnostic(code(ledgerflow::persistence::empty))]
    Empty,

    /// The blob was written by an incompatible node version. Fatal for the
    /// resume; reported out-of-band, never retried.
    #[error("checkpoint schema version {found} does not match supported version {expected}")]
    #[diagnostic(
        code(ledgerflow::persistence::schema),
        help("The checkpoint was written by an incompatible node version; it cannot be resumed.")
    )]
    SchemaMismatch { found: u8, expected: u8 },

    #[error("checkpoint (de)serialization failed: {source}")]
    #[diagnostic(code(ledgerflow::persistence::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Encode a checkpoint into its durable blob form: schema byte + JSON body.
pub fn encode_checkpoint(checkpoint: &PersistedCheckpoint) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(checkpoint).map_err(|source| PersistenceError::Serde { source })?;
    let mut blob = Vec::with_capacity(body.len() + 1);
    blob.push(CHECKPOINT_SCHEMA_VERSION);
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Decode a durable blob, verifying the schema-version prefix first.
pub fn decode_checkpoint(blob: &[u8]) -> Result<PersistedCheckpoint> {
    let (&version, body) = blob.split_first().ok_or(PersistenceError::Empty)?;
    if version != CHECKPOINT_SCHEMA_VERSION {
        return Err(PersistenceError::SchemaMismatch {
            found: version,
            expected: CHECKPOINT_SCHEMA_VERSION,
        });
    }
    serde_json::from_slice(body).map_err(|source| PersistenceError::Serde { source })
}
