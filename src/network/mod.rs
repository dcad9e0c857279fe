//! P2P networking module
//!
//! Speaks the Bitmessage v3 wire protocol over TCP.
//!
//! # Features
//! - Framed message codec with checksums
//! - Per-peer handshake and state machine
//! - Object gossip with bounded fan-out
//! - Network-wide deduplication of pending object requests
//! - Synchronization with a trusted node

pub mod codec;
pub mod connection;
pub mod listener;
pub mod message;
pub mod pool;
pub mod requests;

pub use codec::MessageCodec;
pub use connection::{Connection, Delivery, Mode, NetworkError, Outbound, State};
pub use listener::MessageListener;
pub use message::{
    CustomMessage, Message, VersionMessage, MAGIC, MAX_ADDR_ENTRIES, MAX_INV_ENTRIES,
    MAX_PAYLOAD_SIZE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use pool::{
    ConnectionPool, NetworkConfig, NetworkContext, NetworkStatus, StreamStatus, DEFAULT_PORT,
};
pub use requests::{RequestOwner, RequestTable, DEFAULT_REQUEST_EXPIRY};
