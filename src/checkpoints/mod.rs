//! Checkpoint storage: a durable keyed map of run-id → serialized
//! continuation, plus the host-transaction unit that couples checkpoint
//! mutations to their side effects.
//!
//! A flow's presence in the store is authoritative: a flow running in memory
//! whose checkpoint write never committed must be discarded, and checkpoint
//! deletion is the sole marker of flow completion. `list` is called only at
//! startup, to enumerate flows for resurrection.
//!
//! Two backends ship: [`InMemoryCheckpointStore`] for tests and ephemeral
//! nodes, and a SQLite store (see [`sqlite`], behind the default `sqlite`
//! feature) for durable deployments.

pub mod persistence;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use persistence::{
    CHECKPOINT_SCHEMA_VERSION, PersistedCheckpoint, PersistedFrame, PersistedSuspension,
    PersistenceError, decode_checkpoint, encode_checkpoint,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::transport::DeliveryTag;
use crate::types::RunId;
use crate::wire::Envelope;

/// Errors from checkpoint store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// Backend storage error (database, filesystem, ...).
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(
        code(ledgerflow::checkpoints::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    /// Other checkpoint store errors.
    #[error("checkpoint store error: {message}")]
    #[diagnostic(code(ledgerflow::checkpoints::other))]
    Other { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The checkpoint half of a host transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointWrite {
    /// Replace the checkpoint for `run_id` with `blob`.
    Put { run_id: RunId, blob: Vec<u8> },
    /// Delete the checkpoint: the flow reached a terminal transition.
    Remove { run_id: RunId },
}

/// One atomic unit of externally visible effect.
///
/// Everything the framework makes visible to the outside world - the
/// checkpoint mutation, the outbound envelopes, and the acknowledgement of the
/// inbound delivery that triggered the work - travels in one of these and is
/// committed as a unit while the flow slot is still held. Partial success is
/// impossible: if the checkpoint write fails, nothing is published, nothing is
/// acknowledged, and the in-memory flow is discarded in favor of the store's
/// view.
#[derive(Debug, Default)]
pub struct HostTransaction {
    pub checkpoint: Option<CheckpointWrite>,
    pub outbound: Vec<Envelope>,
    pub consumed: Option<DeliveryTag>,
}

impl HostTransaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn put(mut self, run_id: RunId, blob: Vec<u8>) -> Self {
        self.checkpoint = Some(CheckpointWrite::Put { run_id, blob });
        self
    }

    #[must_use]
    pub fn remove(mut self, run_id: RunId) -> Self {
        self.checkpoint = Some(CheckpointWrite::Remove { run_id });
        self
    }

    #[must_use]
    pub fn publish(mut self, envelope: Envelope) -> Self {
        self.outbound.push(envelope);
        self
    }

    #[must_use]
    pub fn publish_all(mut self, envelopes: impl IntoIterator<Item = Envelope>) -> Self {
        self.outbound.extend(envelopes);
        self
    }

    #[must_use]
    pub fn consume(mut self, tag: Option<DeliveryTag>) -> Self {
        self.consumed = tag;
        self
    }
}

/// Durable keyed map of run-id → checkpoint blob.
///
/// All three operations participate in the host-transaction discipline: the
/// manager applies the [`CheckpointWrite`] before handing the transaction's
/// outbound envelopes to the transport, and treats a failed write as a failed
/// transaction. Implementations must make `put` a replace and both `put` and
/// `remove` idempotent, since restarts can replay either.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist (or replace) the checkpoint for a run.
    async fn put(&self, run_id: RunId, blob: Vec<u8>) -> Result<()>;

    /// Delete the checkpoint for a run. Deleting a missing run is a no-op.
    async fn remove(&self, run_id: RunId) -> Result<()>;

    /// Every stored checkpoint. Startup-only, for resurrection.
    async fn list(&self) -> Result<Vec<(RunId, Vec<u8>)>>;

    /// Whether a checkpoint exists for `run_id`.
    async fn contains(&self, run_id: RunId) -> Result<bool> {
        Ok(self.list().await?.iter().any(|(id, _)| *id == run_id))
    }
}

/// Volatile process-local checkpoint store for tests and ephemeral nodes.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<FxHashMap<RunId, Vec<u8>>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, run_id: RunId, blob: Vec<u8>) -> Result<()> {
        self.inner.write().insert(run_id, blob);
        Ok(())
    }

    async fn remove(&self, run_id: RunId) -> Result<()> {
        self.inner.write().remove(&run_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(RunId, Vec<u8>)>> {
        Ok(self
            .inner
            .read()
            .iter()
            .map(|(id, blob)| (*id, blob.clone()))
            .collect())
    }

    async fn contains(&self, run_id: RunId) -> Result<bool> {
        Ok(self.inner.read().contains_key(&run_id))
    }
}
