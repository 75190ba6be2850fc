//! Shared test environment: a full node over simulation adapters.

use fieldnode::bus::i2c::SimI2cEngine;
use fieldnode::bus::onewire::SimOneWire;
use fieldnode::config::store::MemStore;
use fieldnode::net::SimBroker;
use fieldnode::runtime::Node;

pub type TestNode = Node<SimBroker, MemStore, SimI2cEngine, SimOneWire>;

/// Fresh node against reset simulated hardware. The caller must
/// already hold `fieldnode::hal::sim::lock()`.
pub fn fresh_node() -> TestNode {
    fieldnode::hal::sim::reset();
    Node::new(
        SimBroker::new(),
        MemStore::new(),
        SimI2cEngine::new(),
        SimOneWire::new(),
        "ctrl",
        "node-1",
    )
}

/// Fresh node with a pre-seeded store (warm boot scenarios).
pub fn node_with_store(store: MemStore) -> TestNode {
    fieldnode::hal::sim::reset();
    Node::new(
        SimBroker::new(),
        store,
        SimI2cEngine::new(),
        SimOneWire::new(),
        "ctrl",
        "node-1",
    )
}

/// Last JSON payload the broker saw on `topic`.
pub fn last_json(node: &TestNode, topic: &str) -> Option<serde_json::Value> {
    node.link
        .payloads_for(topic)
        .pop()
        .map(|p| serde_json::from_slice(p).expect("payload is not JSON"))
}

/// Every JSON payload the broker saw on `topic`, in order.
pub fn all_json(node: &TestNode, topic: &str) -> Vec<serde_json::Value> {
    node.link
        .payloads_for(topic)
        .into_iter()
        .map(|p| serde_json::from_slice(p).expect("payload is not JSON"))
        .collect()
}
