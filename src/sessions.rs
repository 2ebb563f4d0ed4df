//! Session records and the per-flow session table.
//!
//! A session is a bidirectional, ordered, versioned conversation between
//! exactly two flows on two nodes. Each endpoint holds its own record; once
//! confirmed, the peer endpoint holds a mirror record with the ids swapped.
//! Records live inside the owning flow's checkpoint, so sequence counters and
//! undelivered inbound payloads survive restarts - that persistence is what
//! makes receiver-side deduplication effective across crashes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flows::BusinessError;
use crate::types::{NodeId, Party, SessionId};

/// Protocol phase of one session endpoint.
///
/// ```text
/// [start] --init--> Initiating --confirm--> Confirmed --(end | error-end)--> {Ended | Errored}
/// Initiating --reject--> Errored
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Initiating,
    Confirmed,
    Ended,
    Errored,
}

/// An inbound event queued on a session until the owning flow consumes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionInbound {
    Data { sequence: u64, payload: Value },
    Ended,
    Errored { error: Option<BusinessError> },
    Rejected { reason: String },
}

/// One endpoint's record of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowSession {
    /// This endpoint's half of the session identity.
    pub local_id: SessionId,
    /// The peer's half; absent until the handshake completes.
    pub peer_id: Option<SessionId>,
    /// Logical counterparty identity.
    pub peer: Party,
    /// Concrete endpoint pinned at confirmation. Before that, only the
    /// initiator knows a (round-robin chosen) destination.
    pub peer_endpoint: Option<NodeId>,
    pub phase: SessionPhase,
    /// Version we offered (initiator) or registered (responder).
    pub our_version: u32,
    /// Version the peer speaks, learned from init/confirm.
    pub peer_version: Option<u32>,
    /// True on the endpoint that sent the `SessionInit`.
    pub initiated_by_us: bool,
    /// Sequence the next outbound `SessionData` will carry (starting at 1).
    pub next_send_sequence: u64,
    /// Highest inbound sequence delivered to this session; anything at or
    /// below is a duplicate and is dropped.
    pub last_delivered_sequence: u64,
    /// Inbound events the flow has not consumed yet, in arrival order.
    pub inbound: VecDeque<SessionInbound>,
    /// Payloads sent while still `Initiating`; flushed in order as
    /// `SessionData` when the confirm arrives.
    pub pending_sends: Vec<Value>,
    /// Type hint of the receive currently parked on this session, for error
    /// reporting.
    pub expected_type_hint: Option<String>,
}

impl FlowSession {
    /// Record for a session we are initiating towards `peer`.
    #[must_use]
    pub fn initiated(local_id: SessionId, peer: Party, endpoint: NodeId, our_version: u32) -> Self {
        Self {
            local_id,
            peer_id: None,
            peer,
            peer_endpoint: Some(endpoint),
            phase: SessionPhase::Initiating,
            our_version,
            peer_version: None,
            initiated_by_us: true,
            next_send_sequence: 1,
            last_delivered_sequence: 0,
            inbound: VecDeque::new(),
            pending_sends: Vec::new(),
            expected_type_hint: None,
        }
    }

    /// Record for a session confirmed in response to a peer's init.
    ///
    /// The responder is `Confirmed` from birth; there is no `Initiating` stop
    /// on this side of the handshake.
    #[must_use]
    pub fn confirmed(
        local_id: SessionId,
        peer_id: SessionId,
        peer: Party,
        peer_endpoint: NodeId,
        our_version: u32,
        peer_version: u32,
    ) -> Self {
        Self {
            local_id,
            peer_id: Some(peer_id),
            peer,
            peer_endpoint: Some(peer_endpoint),
            phase: SessionPhase::Confirmed,
            our_version,
            peer_version: Some(peer_version),
            initiated_by_us: false,
            next_send_sequence: 1,
            last_delivered_sequence: 0,
            inbound: VecDeque::new(),
            pending_sends: Vec::new(),
            expected_type_hint: None,
        }
    }

    /// The version both sides settled on: the lower of the two once known.
    #[must_use]
    pub fn effective_version(&self) -> u32 {
        match self.peer_version {
            Some(peer) => self.our_version.min(peer),
            None => self.our_version,
        }
    }

    /// Allocate the next outbound data sequence.
    pub fn take_send_sequence(&mut self) -> u64 {
        let seq = self.next_send_sequence;
        self.next_send_sequence += 1;
        seq
    }

    /// Admit an inbound data payload, enforcing at-most-once delivery.
    ///
    /// Returns `false` for duplicates (sequence already delivered), which the
    /// caller drops without any visible effect.
    pub fn admit_data(&mut self, sequence: u64, payload: Value) -> bool {
        if sequence <= self.last_delivered_sequence {
            return false;
        }
        self.last_delivered_sequence = sequence;
        self.inbound.push_back(SessionInbound::Data { sequence, payload });
        true
    }

    /// True while the peer may still send us data.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.phase, SessionPhase::Initiating | SessionPhase::Confirmed)
    }
}

/// All sessions owned by one flow, indexed by counterparty and by local id.
///
/// Mutated only by the runtime thread servicing the owning flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: Vec<FlowSession>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: FlowSession) {
        self.sessions.push(session);
    }

    /// The session with `party`, if one has been opened.
    ///
    /// Flows address counterparties by party; one flow holds at most one
    /// session per counterparty.
    #[must_use]
    pub fn by_party(&self, party: &Party) -> Option<&FlowSession> {
        self.sessions.iter().find(|s| &s.peer == party)
    }

    pub fn by_party_mut(&mut self, party: &Party) -> Option<&mut FlowSession> {
        self.sessions.iter_mut().find(|s| &s.peer == party)
    }

    #[must_use]
    pub fn by_local_id(&self, id: SessionId) -> Option<&FlowSession> {
        self.sessions.iter().find(|s| s.local_id == id)
    }

    pub fn by_local_id_mut(&mut self, id: SessionId) -> Option<&mut FlowSession> {
        self.sessions.iter_mut().find(|s| s.local_id == id)
    }

    /// Local ids of every session, for routing registration.
    #[must_use]
    pub fn local_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.local_id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowSession> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FlowSession> {
        self.sessions.iter_mut()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The confirmed peer version on the session with `party`, if settled.
    #[must_use]
    pub fn peer_version(&self, party: &Party) -> Option<u32> {
        self.by_party(party).and_then(|s| s.peer_version)
    }
}
