//! Network-wide deduplication of outstanding object requests
//!
//! At most one connection requests a given object at a time. An entry lives
//! while its `getdata` is outstanding and is removed on delivery, on expiry, or
//! when the requesting connection goes away. Entries remember who claimed
//! them so a connection can only give up its own claims.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::core::InventoryVector;

/// Default time after which an unanswered request may be claimed again
pub const DEFAULT_REQUEST_EXPIRY: Duration = Duration::from_secs(120);

/// Identifies the claimant of a request, usually a connection id
pub type RequestOwner = u64;

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    requested: Instant,
    owner: RequestOwner,
}

#[derive(Debug)]
pub struct RequestTable {
    pending: DashMap<InventoryVector, PendingRequest>,
    expiry: Duration,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_EXPIRY)
    }
}

impl RequestTable {
    pub fn new(expiry: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            expiry,
        }
    }

    /// Claim the right to request `vector` for `owner`. Returns `false` while
    /// another unexpired request for it is outstanding.
    pub fn try_request(&self, vector: InventoryVector, owner: RequestOwner) -> bool {
        let claim = PendingRequest {
            requested: Instant::now(),
            owner,
        };
        match self.pending.entry(vector) {
            Entry::Occupied(mut entry) => {
                if claim.requested.duration_since(entry.get().requested) >= self.expiry {
                    entry.insert(claim);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(claim);
                true
            }
        }
    }

    /// The object arrived: drop the entry whoever claimed it.
    /// Returns whether this call removed the entry.
    pub fn remove(&self, vector: &InventoryVector) -> bool {
        self.pending.remove(vector).is_some()
    }

    /// Give up a claim, but only if `owner` still holds it
    pub fn release(&self, vector: &InventoryVector, owner: RequestOwner) -> bool {
        self.pending
            .remove_if(vector, |_, pending| pending.owner == owner)
            .is_some()
    }

    pub fn contains(&self, vector: &InventoryVector) -> bool {
        self.pending.contains_key(vector)
    }

    /// Current claimant of `vector`, expired or not
    pub fn owner(&self, vector: &InventoryVector) -> Option<RequestOwner> {
        self.pending.get(vector).map(|pending| pending.owner)
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.pending.len();
        let expiry = self.expiry;
        self.pending
            .retain(|_, pending| pending.requested.elapsed() < expiry);
        before.saturating_sub(self.pending.len())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
