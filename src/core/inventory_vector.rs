//! Content hash identifying a gossiped object

use crate::crypto::double_sha512;
use std::fmt;

/// 32-byte content hash of an object, unique across the network
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InventoryVector([u8; 32]);

impl InventoryVector {
    pub const SIZE: usize = 32;

    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Hash of a fully serialized object (nonce included)
    pub fn of_object_bytes(data: &[u8]) -> Self {
        let hash = double_sha512(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hash[..32]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InventoryVector({})", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_vector_is_content_addressed() {
        let a = InventoryVector::of_object_bytes(b"object one");
        let b = InventoryVector::of_object_bytes(b"object one");
        let c = InventoryVector::of_object_bytes(b"object two");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 64);
    }
}
