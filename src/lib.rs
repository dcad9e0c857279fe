//! Mini-Bitmessage: a store-and-forward anonymous messaging node in Rust
//!
//! This crate provides the core of a Bitmessage node:
//! - The v3 wire protocol with a framed, checksummed codec
//! - Peer connections with handshake, inventory exchange and keep-alive
//! - A connection pool gossiping new objects with bounded fan-out
//! - Network-wide deduplication of object requests
//! - Proof of work (single and multi-threaded) and a send queue
//! - ECIES encryption, identities and signed-encrypted extension messages
//!
//! # Example
//!
//! ```rust,no_run
//! use mini_bitmessage::core::ObjectMessage;
//! use mini_bitmessage::network::{ConnectionPool, MessageListener, NetworkConfig};
//! use mini_bitmessage::storage::{MemoryInventory, MemoryNodeRegistry};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), mini_bitmessage::network::NetworkError> {
//! let pool = Arc::new(ConnectionPool::new(
//!     NetworkConfig::default(),
//!     Arc::new(MemoryInventory::new()),
//!     Arc::new(MemoryNodeRegistry::with_default_bootstrap()),
//! ));
//!
//! let listener: Arc<dyn MessageListener> = Arc::new(|object: &ObjectMessage| {
//!     println!("New object {}", object.inventory_vector());
//! });
//! let address = pool.start(listener).await?;
//! println!("Listening on {}", address);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod extensions;
pub mod network;
pub mod pow;
pub mod storage;

// Re-export commonly used types
pub use core::{BitmessageAddress, InventoryVector, ObjectMessage, ObjectPayload, Pubkey};
pub use extensions::{EnvelopeError, SignedEnvelope};
pub use network::{ConnectionPool, MessageListener, NetworkConfig, NetworkError, RequestTable};
pub use pow::{MultiThreadedPowEngine, PowQueue, ProofOfWorkEngine, SimplePowEngine};
pub use storage::{Inventory, MemoryInventory, MemoryNodeRegistry, NodeRegistry};
