//! Core protocol types
//!
//! This module contains the entities every other layer speaks in:
//! - Wire encodings (var_int, var_str, var_int_list)
//! - Objects, their typed payloads and their proof-of-work target
//! - Inventory vectors and network addresses
//! - Addresses, public keys and private keys

pub mod encoding;
pub mod identity;
pub mod inventory_vector;
pub mod network_address;
pub mod object;
pub mod payload;

pub use encoding::DecodeError;
pub use identity::{BitmessageAddress, Behavior, PrivateKey, Pubkey, ADDRESS_PREFIX};
pub use inventory_vector::InventoryVector;
pub use network_address::{NetworkAddress, Services, NETWORK_ADDRESS_SIZE};
pub use object::{
    pow_target, unix_time, ObjectError, ObjectMessage, ObjectType, DAY, HOUR, MAX_OBJECT_SIZE,
    MAX_TTL, MINUTE, NETWORK_EXTRA_BYTES, NETWORK_NONCE_TRIALS_PER_BYTE,
};
pub use payload::{BroadcastPayload, GetPubkey, ObjectPayload, PubkeyPayload};
