//! In-memory fragment store
//!
//! Used for testing and development. Not persistent.

use crate::store::{FragmentStore, StoreStats};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::error::Result;

/// In-memory fragment store
#[derive(Default)]
pub struct MemoryStore {
    fragments: RwLock<HashMap<String, Bytes>>,

    /// Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all stored fragments
    pub fn clear(&self) {
        self.fragments.write().clear();
    }
}

impl FragmentStore for MemoryStore {
    fn put(&self, fragment_id: &str, data: Bytes) -> Result<()> {
        self.fragments.write().insert(fragment_id.to_string(), data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get(&self, fragment_id: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.fragments.read().get(fragment_id).cloned())
    }

    fn delete(&self, fragment_id: &str) -> Result<bool> {
        let removed = self.fragments.write().remove(fragment_id).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn contains(&self, fragment_id: &str) -> Result<bool> {
        Ok(self.fragments.read().contains_key(fragment_id))
    }

    fn fragment_count(&self) -> Result<usize> {
        Ok(self.fragments.read().len())
    }

    fn list_fragments(&self) -> Result<Vec<String>> {
        Ok(self.fragments.read().keys().cloned().collect())
    }

    fn stats(&self) -> Result<StoreStats> {
        let fragments = self.fragments.read();
        Ok(StoreStats {
            fragment_count: fragments.len() as u64,
            bytes_used: fragments.values().map(|b| b.len() as u64).sum(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
