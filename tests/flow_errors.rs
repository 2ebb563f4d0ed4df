//! Error propagation across sessions: declared exceptions, masking, rejects,
//! and external kills.

mod common;

use std::sync::Arc;

use common::flows::*;
use common::{RecordingBus, TestNode, pump};
use ledgerflow::checkpoints::CheckpointStore;
use ledgerflow::flows::{FlowError, FlowRegistration, FlowRegistry};
use ledgerflow::transport::InMemoryNetwork;
use ledgerflow::types::InitiatorKind;
use ledgerflow::wire::SessionMessage;

fn sender_registry() -> Arc<FlowRegistry> {
    let registry = FlowRegistry::new();
    registry
        .register(
            FlowRegistration::of::<SendAndAwaitAckFlow>(SendAndAwaitAckFlow::CLASS, 1).initiating(),
        )
        .unwrap();
    registry
        .register(FlowRegistration::of::<DozingFlow>(DozingFlow::CLASS, 1))
        .unwrap();
    registry.freeze();
    Arc::new(registry)
}

fn responder_registry(kind: &str) -> Arc<FlowRegistry> {
    let registry = FlowRegistry::new();
    match kind {
        "business" => {
            registry
                .register(FlowRegistration::of::<BusinessFailResponder>(
                    BusinessFailResponder::CLASS,
                    1,
                ))
                .unwrap();
            registry
                .register_responder(
                    SendAndAwaitAckFlow::CLASS,
                    BusinessFailResponder::CLASS,
                    1,
                    BusinessFailResponder::responder,
                )
                .unwrap();
        }
        "evil" => {
            registry
                .register(FlowRegistration::of::<EvilBugResponder>(EvilBugResponder::CLASS, 1))
                .unwrap();
            registry
                .register_responder(
                    SendAndAwaitAckFlow::CLASS,
                    EvilBugResponder::CLASS,
                    1,
                    EvilBugResponder::responder,
                )
                .unwrap();
        }
        "none" => {}
        other => panic!("unknown responder kind {other}"),
    }
    registry.freeze();
    Arc::new(registry)
}

#[tokio::test]
async fn business_exceptions_propagate_as_peer_typed_copies() {
    let network = InMemoryNetwork::new();
    let a = TestNode::start("node-a", "O=Alice", &network, sender_registry()).await;
    let b = TestNode::start("node-b", "O=Bob", &network, responder_registry("business")).await;

    let handle = a
        .manager
        .start_flow(
            Box::new(SendAndAwaitAckFlow::new(b.identity.clone(), "Hello")),
            InitiatorKind::Shell,
        )
        .await
        .unwrap();
    pump(&network, &[&a, &b]).await;

    match handle.result.outcome().await {
        Err(FlowError::Peer(business)) => {
            assert_eq!(business.class, BusinessFailResponder::EXCEPTION_CLASS);
            assert_eq!(business.message, "Nothing useful");
        }
        other => panic!("expected a peer business exception, got {other:?}"),
    }

    // No checkpoint remains on the responder's node.
    assert!(b.store.list().await.unwrap().is_empty());
    assert!(a.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn undeclared_exceptions_are_masked_on_the_wire() {
    let network = InMemoryNetwork::new();
    let bus = RecordingBus::new(network.clone());
    let a =
        TestNode::start_recording("node-a", "O=Alice", &network, sender_registry(), &bus).await;
    let b = TestNode::start_recording(
        "node-b",
        "O=Bob",
        &network,
        responder_registry("evil"),
        &bus,
    )
    .await;

    let handle = a
        .manager
        .start_flow(
            Box::new(SendAndAwaitAckFlow::new(b.identity.clone(), "Hello")),
            InitiatorKind::Shell,
        )
        .await
        .unwrap();
    pump(&network, &[&a, &b]).await;

    match handle.result.outcome().await {
        Err(err @ FlowError::UnexpectedFlowEnd { .. }) => {
            assert!(!err.to_string().contains("evil bug!"));
        }
        other => panic!("expected UnexpectedFlowEnd, got {other:?}"),
    }

    // The error end that crossed the wire carried no body.
    let error_ends: Vec<_> = bus
        .published()
        .iter()
        .filter_map(|e| match &e.message {
            SessionMessage::ErrorSessionEnd { error, .. } => Some(error.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(error_ends, vec![None]);
}

#[tokio::test]
async fn unknown_flow_class_is_rejected_with_one_message() {
    let network = InMemoryNetwork::new();
    let bus = RecordingBus::new(network.clone());
    let a =
        TestNode::start_recording("node-a", "O=Alice", &network, sender_registry(), &bus).await;
    let b = TestNode::start_recording(
        "node-b",
        "O=Bob",
        &network,
        responder_registry("none"),
        &bus,
    )
    .await;

    let handle = a
        .manager
        .start_flow(
            Box::new(SendAndAwaitAckFlow::new(b.identity.clone(), "Hello")),
            InitiatorKind::Shell,
        )
        .await
        .unwrap();
    pump(&network, &[&a, &b]).await;

    match handle.result.outcome().await {
        Err(FlowError::UnexpectedFlowEnd { reason, .. }) => {
            assert_eq!(reason, format!("Don't know {}", SendAndAwaitAckFlow::CLASS));
        }
        other => panic!("expected UnexpectedFlowEnd, got {other:?}"),
    }

    // Exactly two messages crossed the wire: the init and the reject.
    let published = bus.published();
    assert_eq!(published.len(), 2, "trace: {published:#?}");
    assert!(matches!(
        published[0].message,
        SessionMessage::SessionInit { .. }
    ));
    match &published[1].message {
        SessionMessage::SessionReject { error_message, .. } => {
            assert_eq!(
                error_message,
                &format!("Don't know {}", SendAndAwaitAckFlow::CLASS)
            );
        }
        other => panic!("expected reject, got {other:?}"),
    }
}

#[tokio::test]
async fn kill_terminates_a_parked_flow_and_deletes_its_checkpoint() {
    let network = InMemoryNetwork::new();
    let a = TestNode::start("node-a", "O=Alice", &network, sender_registry()).await;

    let handle = a
        .manager
        .start_flow(Box::new(DozingFlow::new()), InitiatorKind::Shell)
        .await
        .unwrap();
    assert!(a.manager.has_checkpoint(handle.run_id).await.unwrap());

    assert!(a.manager.kill(handle.run_id, "operator request").await.unwrap());
    match handle.result.outcome().await {
        Err(FlowError::Aborted { reason }) => assert_eq!(reason, "operator request"),
        other => panic!("expected abort, got {other:?}"),
    }
    assert!(!a.manager.has_checkpoint(handle.run_id).await.unwrap());

    // Killing an unknown run is a no-op.
    assert!(!a.manager.kill(handle.run_id, "again").await.unwrap());
}
