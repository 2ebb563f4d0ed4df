//! Shared two-node test harness: in-memory network, node lifecycle, and a
//! message pump.

#![allow(dead_code)]

pub mod flows;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ledgerflow::checkpoints::InMemoryCheckpointStore;
use ledgerflow::config::NodeConfig;
use ledgerflow::flows::FlowRegistry;
use ledgerflow::runtime::FlowManager;
use ledgerflow::transport::{DeliveryTag, InMemoryNetwork, MessageBus};
use ledgerflow::types::{NodeId, Party};
use ledgerflow::wire::Envelope;

/// Bus wrapper that records every published envelope, in publish order, for
/// wire-trace assertions.
#[derive(Clone)]
pub struct RecordingBus {
    inner: InMemoryNetwork,
    log: Arc<Mutex<Vec<Envelope>>>,
}

impl RecordingBus {
    pub fn new(inner: InMemoryNetwork) -> Self {
        Self {
            inner,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn published(&self) -> Vec<Envelope> {
        self.log.lock().clone()
    }
}

impl MessageBus for RecordingBus {
    fn publish(&self, envelope: &Envelope) {
        self.log.lock().push(envelope.clone());
        self.inner.publish(envelope);
    }

    fn acknowledge(&self, tag: &DeliveryTag) {
        self.inner.acknowledge(tag);
    }

    fn next_endpoint(&self, party: &Party) -> Option<NodeId> {
        self.inner.next_endpoint(party)
    }

    fn identity_of(&self, node: &NodeId) -> Option<Party> {
        self.inner.identity_of(node)
    }
}

/// One node under test: its manager plus the pieces needed to restart it.
pub struct TestNode {
    pub manager: FlowManager,
    pub node_id: NodeId,
    pub identity: Party,
    pub store: Arc<InMemoryCheckpointStore>,
    pub registry: Arc<FlowRegistry>,
    pub network: InMemoryNetwork,
    pub bus: Arc<dyn MessageBus>,
}

impl TestNode {
    /// Register the endpoint and boot a node with a fresh store.
    pub async fn start(
        name: &str,
        identity: &str,
        network: &InMemoryNetwork,
        registry: Arc<FlowRegistry>,
    ) -> Self {
        let bus: Arc<dyn MessageBus> = Arc::new(network.clone());
        Self::start_with(name, identity, network, registry, bus, Arc::new(InMemoryCheckpointStore::new()))
            .await
    }

    /// Boot a node that publishes through a recording bus.
    pub async fn start_recording(
        name: &str,
        identity: &str,
        network: &InMemoryNetwork,
        registry: Arc<FlowRegistry>,
        bus: &RecordingBus,
    ) -> Self {
        Self::start_with(
            name,
            identity,
            network,
            registry,
            Arc::new(bus.clone()),
            Arc::new(InMemoryCheckpointStore::new()),
        )
        .await
    }

    pub async fn start_with(
        name: &str,
        identity: &str,
        network: &InMemoryNetwork,
        registry: Arc<FlowRegistry>,
        bus: Arc<dyn MessageBus>,
        store: Arc<InMemoryCheckpointStore>,
    ) -> Self {
        let node_id = NodeId::from(name);
        let party = Party::from(identity);
        network.register_endpoint(node_id.clone(), party.clone());
        let config = NodeConfig::new(party.clone(), node_id.clone());
        let (manager, _) = FlowManager::start(config, registry.clone(), store.clone(), bus.clone())
            .await
            .expect("manager start");
        Self {
            manager,
            node_id,
            identity: party,
            store,
            registry,
            network: network.clone(),
            bus,
        }
    }

    /// Stop this node and boot a replacement from the same checkpoint store.
    ///
    /// Unacknowledged deliveries stay in the node's mailbox, exactly as a
    /// broker would keep them across a process restart.
    pub async fn restart(self) -> Self {
        self.manager.shutdown().await;
        let Self {
            node_id,
            identity,
            store,
            registry,
            network,
            bus,
            ..
        } = self;
        let config = NodeConfig::new(identity.clone(), node_id.clone());
        let (manager, _) = FlowManager::start(config, registry.clone(), store.clone(), bus.clone())
            .await
            .expect("manager restart");
        Self {
            manager,
            node_id,
            identity,
            store,
            registry,
            network,
            bus,
        }
    }
}

/// Deliver queued messages round-robin until no mailbox drains further.
///
/// Processes one delivery per node per round so cross-node conversations
/// interleave the way independent nodes would.
pub async fn pump(network: &InMemoryNetwork, nodes: &[&TestNode]) {
    loop {
        let mut progressed = false;
        for node in nodes {
            let before = network.pending(&node.node_id);
            if before == 0 {
                continue;
            }
            let Some(delivery) = network.next_delivery(&node.node_id) else {
                continue;
            };
            node.manager.process(delivery).await.expect("process");
            if network.pending(&node.node_id) < before {
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

/// Pump repeatedly with small pauses, letting timers fire in between.
pub async fn pump_for(network: &InMemoryNetwork, nodes: &[&TestNode], total: Duration) {
    let rounds = (total.as_millis() / 10).max(1);
    for _ in 0..rounds {
        pump(network, nodes).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pump(network, nodes).await;
}

/// Wait until `node`'s checkpoint store is empty (every flow reached a
/// terminal transition), pumping along the way. Panics on timeout.
pub async fn pump_until_idle(network: &InMemoryNetwork, nodes: &[&TestNode], node: &TestNode) {
    use ledgerflow::checkpoints::CheckpointStore;
    for _ in 0..500 {
        pump(network, nodes).await;
        if node.store.list().await.expect("list").is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node {} still has checkpoints", node.node_id);
}
