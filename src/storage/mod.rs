//! Storage collaborators of the network layer
//!
//! This module provides:
//! - The `Inventory` of objects known to this node
//! - The `NodeRegistry` of known peer addresses
//! - In-memory implementations of both

pub mod inventory;
pub mod node_registry;

pub use inventory::MemoryInventory;
pub use node_registry::{
    resolve_bootstrap, MemoryNodeRegistry, RegistryError, DEFAULT_BOOTSTRAP,
};

use crate::core::{InventoryVector, NetworkAddress, ObjectMessage};

/// Objects held by this node, keyed by inventory vector
pub trait Inventory: Send + Sync {
    fn contains(&self, vector: &InventoryVector) -> bool;

    fn get(&self, vector: &InventoryVector) -> Option<ObjectMessage>;

    /// Store an object; returns `false` if it was already present.
    /// Concurrent puts of the same object store exactly one copy.
    fn put(&self, object: &ObjectMessage) -> bool;

    /// Objects of a stream, optionally filtered by version and type
    fn query(&self, stream: u64, version: Option<u64>, object_type: Option<u32>)
        -> Vec<ObjectMessage>;

    /// Vectors of all unexpired objects in the given streams
    fn inventory(&self, streams: &[u64]) -> Vec<InventoryVector>;

    /// Drop objects that expired a while ago; returns how many were removed
    fn cleanup(&self) -> usize;
}

/// Known peer addresses
pub trait NodeRegistry: Send + Sync {
    /// Up to `limit` randomly chosen addresses serving any of `streams`
    fn known_addresses(&self, limit: usize, streams: &[u64]) -> Vec<NetworkAddress>;

    fn offer_addresses(&self, addresses: Vec<NetworkAddress>);

    /// `(stream, "host:port")` entries to resolve when nothing is known.
    /// Resolution is left to the caller so it can happen off the runtime's
    /// worker threads.
    fn bootstrap_hosts(&self) -> Vec<(u64, String)> {
        Vec::new()
    }
}
