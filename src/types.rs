//! Core identifier types for the ledgerflow framework.
//!
//! This module defines the domain identifiers used throughout the system:
//! run-ids for flows, session-ids for conversations between flows, party and
//! endpoint handles for addressing, and ledger transaction ids.
//!
//! Runtime-facing types (suspensions, frames, descriptors) live in
//! [`crate::runtime`]; wire shapes live in [`crate::wire`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, globally unique identifier assigned when a flow is created.
///
/// Stable across restarts: the run-id keys the flow's checkpoint, so a
/// resurrected flow keeps the id it was started with.
///
/// # Examples
///
/// ```rust
/// use ledgerflow::types::RunId;
///
/// let id = RunId::fresh();
/// let round_tripped: RunId = id.to_string().parse().unwrap();
/// assert_eq!(id, round_tripped);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Allocate a fresh random run-id.
    #[must_use]
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One half of a session identity: a 63-bit random integer chosen by the side
/// that created it.
///
/// A session is uniquely identified by the (initiator-session-id,
/// confirmer-session-id) pair; before confirmation only the initiator half
/// exists. The top bit is always clear so the value survives transports that
/// treat ids as signed 64-bit integers.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id, clearing the sign bit.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw & !(1 << 63))
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque identity addressable by the messaging transport.
///
/// Parties are logical: several endpoints may advertise the same party (a
/// replicated service), in which case the transport picks a concrete
/// [`NodeId`] per `SessionInit` and the confirming endpoint is pinned into the
/// session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Party(String);

impl Party {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Party {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Concrete transport endpoint backing a [`Party`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque ledger transaction id, resolved by the external validation engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    #[must_use]
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TxId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who asked for a flow to run.
///
/// RPC starts are permission-checked; peer starts bypass the check because the
/// counterparty's own node already authorized the initiating flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitiatorKind {
    /// Started by an authenticated RPC user.
    Rpc { user: String },
    /// Spawned to service a `SessionInit` from a peer node.
    Peer { party: Party },
    /// Started by the node's internal scheduler.
    Scheduled,
    /// Started from the node shell.
    Shell,
}

impl fmt::Display for InitiatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc { user } => write!(f, "rpc:{user}"),
            Self::Peer { party } => write!(f, "peer:{party}"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Shell => write!(f, "shell"),
        }
    }
}
