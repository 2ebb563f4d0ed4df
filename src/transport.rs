//! Transport contract and the in-memory message bus.
//!
//! The framework requires a reliable, party-addressed message bus with FIFO
//! delivery per (sender, recipient) pair and at-least-once semantics. The bus
//! never deduplicates; effectively-once is the session layer's job.
//!
//! Consumption is acknowledge-on-commit: a delivery stays in the mailbox until
//! the receiving node's host transaction commits and acknowledges its tag, so
//! a crash mid-processing redelivers the message after restart.
//!
//! [`InMemoryNetwork`] is the bus used by tests and single-process
//! deployments; production nodes plug their broker in behind [`MessageBus`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::{NodeId, Party};
use crate::wire::Envelope;

/// Identifies one undelivered message in one endpoint's mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryTag {
    pub node: NodeId,
    pub tag: u64,
}

/// An inbound message held by the bus until acknowledged.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub bytes: Vec<u8>,
}

/// Party-addressed message bus.
pub trait MessageBus: Send + Sync {
    /// Hand an envelope to the transport. Reliable once accepted; FIFO per
    /// (origin, destination) pair.
    fn publish(&self, envelope: &Envelope);

    /// Mark a delivery consumed. Called only from a committed host
    /// transaction; an unacknowledged delivery is redelivered.
    fn acknowledge(&self, tag: &DeliveryTag);

    /// Choose the endpoint a new `SessionInit` for `party` should target.
    ///
    /// When several endpoints advertise the same logical identity, successive
    /// calls rotate through them round-robin; the confirming endpoint is then
    /// pinned into the session for all subsequent messages.
    fn next_endpoint(&self, party: &Party) -> Option<NodeId>;

    /// The logical identity `node` advertises, per the external directory.
    fn identity_of(&self, node: &NodeId) -> Option<Party>;
}

#[derive(Default)]
struct NetworkInner {
    mailboxes: FxHashMap<NodeId, VecDeque<Delivery>>,
    directory: FxHashMap<Party, Vec<NodeId>>,
    cursors: FxHashMap<Party, usize>,
    next_tag: u64,
}

/// In-process message bus: durable (for the process lifetime) FIFO mailboxes
/// with ack-on-commit consumption.
///
/// Mailboxes survive a node "restart" in tests - dropping a manager and
/// resurrecting it from its checkpoint store leaves unacknowledged deliveries
/// in place, exactly like a broker would.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl InMemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise `node` as an endpoint for `party`.
    ///
    /// Registering several endpoints under one party models a replicated
    /// service; `next_endpoint` rotates through them in registration order.
    pub fn register_endpoint(&self, node: NodeId, party: Party) {
        let mut inner = self.inner.lock();
        inner.mailboxes.entry(node.clone()).or_default();
        let endpoints = inner.directory.entry(party).or_default();
        if !endpoints.contains(&node) {
            endpoints.push(node);
        }
    }

    /// The oldest unacknowledged delivery for `node`, if any. Does not
    /// consume: the same delivery is returned until acknowledged.
    #[must_use]
    pub fn next_delivery(&self, node: &NodeId) -> Option<Delivery> {
        let inner = self.inner.lock();
        inner.mailboxes.get(node)?.front().cloned()
    }

    /// Number of undelivered messages for `node`.
    #[must_use]
    pub fn pending(&self, node: &NodeId) -> usize {
        self.inner.lock().mailboxes.get(node).map_or(0, VecDeque::len)
    }
}

impl MessageBus for InMemoryNetwork {
    fn publish(&self, envelope: &Envelope) {
        // Encoding failures cannot happen for value-typed payloads; a message
        // that cannot be encoded is dropped with a log rather than wedging the
        // sender.
        let bytes = match crate::wire::encode_envelope(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(target: "ledgerflow::transport", error = %e, "dropping unencodable envelope");
                return;
            }
        };
        let mut inner = self.inner.lock();
        inner.next_tag += 1;
        let tag = DeliveryTag {
            node: envelope.destination.clone(),
            tag: inner.next_tag,
        };
        inner
            .mailboxes
            .entry(envelope.destination.clone())
            .or_default()
            .push_back(Delivery { tag, bytes });
    }

    fn acknowledge(&self, tag: &DeliveryTag) {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.mailboxes.get_mut(&tag.node) {
            queue.retain(|d| d.tag != *tag);
        }
    }

    fn next_endpoint(&self, party: &Party) -> Option<NodeId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let endpoints = match inner.directory.get(party) {
            Some(endpoints) if !endpoints.is_empty() => endpoints,
            _ => return None,
        };
        let cursor = inner.cursors.entry(party.clone()).or_insert(0);
        let chosen = endpoints[*cursor % endpoints.len()].clone();
        *cursor += 1;
        Some(chosen)
    }

    fn identity_of(&self, node: &NodeId) -> Option<Party> {
        let inner = self.inner.lock();
        inner
            .directory
            .iter()
            .find(|(_, endpoints)| endpoints.contains(node))
            .map(|(party, _)| party.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use crate::wire::SessionMessage;

    fn envelope(to: &str) -> Envelope {
        Envelope::new(
            NodeId::from("origin"),
            NodeId::from(to),
            SessionId::from_raw(1),
            SessionMessage::NormalSessionEnd {
                recipient_session_id: SessionId::from_raw(2),
            },
        )
    }

    #[test]
    fn deliveries_stay_until_acknowledged() {
        let net = InMemoryNetwork::new();
        net.register_endpoint(NodeId::from("b"), Party::from("B"));
        net.publish(&envelope("b"));

        let first = net.next_delivery(&NodeId::from("b")).unwrap();
        let again = net.next_delivery(&NodeId::from("b")).unwrap();
        assert_eq!(first.tag, again.tag);

        net.acknowledge(&first.tag);
        assert!(net.next_delivery(&NodeId::from("b")).is_none());
    }

    #[test]
    fn round_robin_rotates_and_wraps() {
        let net = InMemoryNetwork::new();
        let service = Party::from("O=Notary Service");
        for name in ["n0", "n1", "n2"] {
            net.register_endpoint(NodeId::from(name), service.clone());
        }

        let picks: Vec<String> = (0..4)
            .map(|_| net.next_endpoint(&service).unwrap().address().to_string())
            .collect();
        assert_eq!(picks, vec!["n0", "n1", "n2", "n0"]);
    }

    #[test]
    fn unknown_party_has_no_endpoint() {
        let net = InMemoryNetwork::new();
        assert!(net.next_endpoint(&Party::from("nobody")).is_none());
    }
}
