//! Session protocol engine: envelope construction and inbound classification.
//!
//! Pure logic over [`FlowSession`] records and [`wire`](crate::wire) shapes;
//! the manager owns routing, checkpoints, and commits. Keeping this layer free
//! of I/O makes the per-message state transitions testable in isolation.

use serde_json::Value;

use crate::flows::{BusinessError, FlowError, FlowResume};
use crate::sessions::{FlowSession, SessionInbound, SessionPhase, SessionTable};
use crate::types::{NodeId, SessionId};
use crate::wire::{Envelope, SessionMessage};

/// `SessionInit` opening `session`, optionally carrying the first payload.
#[must_use]
pub fn init_envelope(
    our_node: &NodeId,
    session: &FlowSession,
    flow_class: &str,
    app_id: &str,
    first_payload: Option<Value>,
) -> Envelope {
    let destination = session
        .peer_endpoint
        .clone()
        .unwrap_or_else(|| NodeId::new(session.peer.name()));
    Envelope::new(
        our_node.clone(),
        destination,
        session.local_id,
        SessionMessage::SessionInit {
            initiator_session_id: session.local_id,
            flow_class: flow_class.to_string(),
            flow_version: session.our_version,
            app_id: app_id.to_string(),
            first_payload,
        },
    )
}

/// `SessionConfirm` for a responder-side session (peer id is the initiator's).
#[must_use]
pub fn confirm_envelope(our_node: &NodeId, session: &FlowSession, app_id: &str) -> Envelope {
    let destination = session
        .peer_endpoint
        .clone()
        .unwrap_or_else(|| NodeId::new(session.peer.name()));
    Envelope::new(
        our_node.clone(),
        destination,
        session.local_id,
        SessionMessage::SessionConfirm {
            initiator_session_id: session.peer_id.unwrap_or_default(),
            confirmer_session_id: session.local_id,
            flow_version: session.our_version,
            app_id: app_id.to_string(),
        },
    )
}

/// `SessionData` carrying `payload` on a confirmed session.
///
/// Returns `None` while the session is still `Initiating`; the caller buffers
/// the payload in `pending_sends` and flushes on confirm.
#[must_use]
pub fn data_envelope(
    our_node: &NodeId,
    session: &mut FlowSession,
    payload: Value,
) -> Option<Envelope> {
    if session.phase != SessionPhase::Confirmed {
        return None;
    }
    let (peer_id, endpoint) = match (session.peer_id, session.peer_endpoint.clone()) {
        (Some(peer_id), Some(endpoint)) => (peer_id, endpoint),
        _ => return None,
    };
    let sequence = session.take_send_sequence();
    Some(Envelope::new(
        our_node.clone(),
        endpoint,
        session.local_id,
        SessionMessage::SessionData {
            recipient_session_id: peer_id,
            sequence,
            payload,
        },
    ))
}

/// `SessionReject` refusing an init we cannot service.
#[must_use]
pub fn reject_envelope(
    our_node: &NodeId,
    destination: NodeId,
    initiator_session_id: SessionId,
    reason: String,
) -> Envelope {
    Envelope::new(
        our_node.clone(),
        destination,
        initiator_session_id,
        SessionMessage::SessionReject {
            initiator_session_id,
            error_message: reason,
        },
    )
}

/// Flush payloads buffered while the session was `Initiating`, in send order.
/// Call after the confirm has been applied.
#[must_use]
pub fn flush_pending_sends(our_node: &NodeId, session: &mut FlowSession) -> Vec<Envelope> {
    let pending = std::mem::take(&mut session.pending_sends);
    pending
        .into_iter()
        .filter_map(|payload| data_envelope(our_node, session, payload))
        .collect()
}

/// Terminal notifications for every session the peer still believes is open.
///
/// On success each peer gets a `NormalSessionEnd`. On failure each gets an
/// `ErrorSessionEnd` carrying the business exception if the failure was
/// declared, and nothing otherwise - undeclared errors never leak onto the
/// wire. Local phases transition in the same pass.
#[must_use]
pub fn end_envelopes(
    our_node: &NodeId,
    sessions: &mut SessionTable,
    error: Option<&BusinessError>,
    failed: bool,
) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    for session in sessions.iter_mut() {
        if !session.is_open() {
            continue;
        }
        session.phase = if failed {
            SessionPhase::Errored
        } else {
            SessionPhase::Ended
        };
        // A session still awaiting its confirm has no peer id to address;
        // the peer's eventual confirm will find the flow gone and the init
        // side of the handshake dies with the flow.
        let (Some(peer_id), Some(endpoint)) = (session.peer_id, session.peer_endpoint.clone())
        else {
            continue;
        };
        let message = if failed {
            SessionMessage::ErrorSessionEnd {
                recipient_session_id: peer_id,
                error: error.cloned(),
            }
        } else {
            SessionMessage::NormalSessionEnd {
                recipient_session_id: peer_id,
            }
        };
        envelopes.push(Envelope::new(
            our_node.clone(),
            endpoint,
            session.local_id,
            message,
        ));
    }
    envelopes
}

/// Pop the next inbound event for a parked receive and translate it into the
/// resume input the flow sees.
///
/// Queued data is consumed in arrival order, so an end behind undelivered
/// payloads only fails the receive once those payloads are drained. Undeclared
/// counterparty failures and rejects surface as `UnexpectedFlowEnd` carrying
/// the expected type hint; declared ones re-raise as a peer-typed copy.
#[must_use]
pub fn pop_inbound(session: &mut FlowSession, expected: &str) -> Option<FlowResume> {
    let peer = session.peer.clone();
    let Some(event) = session.inbound.pop_front() else {
        // Nothing queued. A still-open session parks the receive; a closed
        // one can never satisfy it.
        if session.is_open() {
            return None;
        }
        return Some(FlowResume::Failed(FlowError::UnexpectedFlowEnd {
            expected: expected.to_string(),
            reason: format!("session with {peer} is already closed"),
        }));
    };
    match event {
        SessionInbound::Data { payload, .. } => Some(FlowResume::Received {
            from: peer,
            payload,
        }),
        SessionInbound::Ended => Some(FlowResume::Failed(FlowError::UnexpectedFlowEnd {
            expected: expected.to_string(),
            reason: format!("counterparty {peer} finished before sending the expected value"),
        })),
        SessionInbound::Errored { error: Some(b) } => Some(FlowResume::Failed(FlowError::Peer(b))),
        SessionInbound::Errored { error: None } => {
            Some(FlowResume::Failed(FlowError::UnexpectedFlowEnd {
                expected: expected.to_string(),
                reason: format!("counterparty {peer} flow errored"),
            }))
        }
        SessionInbound::Rejected { reason } => {
            Some(FlowResume::Failed(FlowError::UnexpectedFlowEnd {
                expected: expected.to_string(),
                reason,
            }))
        }
    }
}

/// Apply a non-data session message to the target session record.
///
/// Returns `false` when the message is a duplicate or arrived in a phase where
/// it has no effect (idempotent replays are dropped without trace).
pub fn apply_terminal_message(session: &mut FlowSession, message: &SessionMessage) -> bool {
    match message {
        SessionMessage::NormalSessionEnd { .. } => {
            if !session.is_open() {
                return false;
            }
            session.phase = SessionPhase::Ended;
            session.inbound.push_back(SessionInbound::Ended);
            true
        }
        SessionMessage::ErrorSessionEnd { error, .. } => {
            if !session.is_open() {
                return false;
            }
            session.phase = SessionPhase::Errored;
            session.inbound.push_back(SessionInbound::Errored {
                error: error.clone(),
            });
            true
        }
        SessionMessage::SessionReject { error_message, .. } => {
            if session.phase != SessionPhase::Initiating {
                return false;
            }
            session.phase = SessionPhase::Errored;
            session.inbound.push_back(SessionInbound::Rejected {
                reason: error_message.clone(),
            });
            true
        }
        _ => false,
    }
}
