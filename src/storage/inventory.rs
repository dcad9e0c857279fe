//! In-memory object inventory

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;

use super::Inventory;
use crate::core::{unix_time, InventoryVector, ObjectMessage, MINUTE};

/// Expired objects are kept this long so late requests can still be answered
const CLEANUP_GRACE: i64 = 5 * MINUTE;

/// Concurrent inventory backed by a `DashMap`
#[derive(Debug, Default)]
pub struct MemoryInventory {
    objects: DashMap<InventoryVector, ObjectMessage>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn cleanup_before(&self, cutoff: i64) -> usize {
        let before = self.objects.len();
        self.objects.retain(|_, object| object.expires_time >= cutoff);
        before.saturating_sub(self.objects.len())
    }
}

impl Inventory for MemoryInventory {
    fn contains(&self, vector: &InventoryVector) -> bool {
        self.objects.contains_key(vector)
    }

    fn get(&self, vector: &InventoryVector) -> Option<ObjectMessage> {
        self.objects.get(vector).map(|entry| entry.value().clone())
    }

    fn put(&self, object: &ObjectMessage) -> bool {
        match self.objects.entry(object.inventory_vector()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(object.clone());
                true
            }
        }
    }

    fn query(
        &self,
        stream: u64,
        version: Option<u64>,
        object_type: Option<u32>,
    ) -> Vec<ObjectMessage> {
        self.objects
            .iter()
            .filter(|entry| {
                let object = entry.value();
                object.stream == stream
                    && version.map_or(true, |v| object.version == v)
                    && object_type.map_or(true, |t| object.object_type == t)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn inventory(&self, streams: &[u64]) -> Vec<InventoryVector> {
        let now = unix_time();
        self.objects
            .iter()
            .filter(|entry| {
                streams.contains(&entry.value().stream) && entry.value().expires_time > now
            })
            .map(|entry| *entry.key())
            .collect()
    }

    fn cleanup(&self) -> usize {
        let removed = self.cleanup_before(unix_time() - CLEANUP_GRACE);
        if removed > 0 {
            debug!("Removed {} expired objects from inventory", removed);
        }
        removed
    }
}
