//! Sled-based fragment store
//!
//! Persistent fragment storage for one storage node. Fragments live in a
//! dedicated tree keyed by fragment id; operation counters are kept in
//! memory only.

use crate::store::{FragmentStore, StoreStats};
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::error::{Result, TesseraError};
use tracing::{debug, info};

const FRAGMENT_TREE: &str = "fragments";

fn storage_err(e: sled::Error) -> TesseraError {
    TesseraError::Storage(e.to_string())
}

/// Sled-based fragment store
pub struct SledStore {
    db: sled::Db,
    fragments: sled::Tree,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl SledStore {
    /// Open or create a fragment store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled fragment store");

        let db = sled::open(path.as_ref())
            .map_err(|e| TesseraError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::from_db(db)
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| TesseraError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let fragments = db.open_tree(FRAGMENT_TREE).map_err(storage_err)?;
        Ok(Self {
            db,
            fragments,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Get database size estimate
    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

impl FragmentStore for SledStore {
    fn put(&self, fragment_id: &str, data: Bytes) -> Result<()> {
        self.fragments
            .insert(fragment_id.as_bytes(), data.as_ref())
            .map_err(storage_err)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(fragment_id, bytes = data.len(), "Stored fragment");
        Ok(())
    }

    fn get(&self, fragment_id: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .fragments
            .get(fragment_id.as_bytes())
            .map_err(storage_err)?
            .map(|value| Bytes::copy_from_slice(&value)))
    }

    fn delete(&self, fragment_id: &str) -> Result<bool> {
        let removed = self
            .fragments
            .remove(fragment_id.as_bytes())
            .map_err(storage_err)?
            .is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn contains(&self, fragment_id: &str) -> Result<bool> {
        self.fragments
            .contains_key(fragment_id.as_bytes())
            .map_err(storage_err)
    }

    fn fragment_count(&self) -> Result<usize> {
        Ok(self.fragments.len())
    }

    fn list_fragments(&self) -> Result<Vec<String>> {
        self.fragments
            .iter()
            .keys()
            .map(|key| {
                let key = key.map_err(storage_err)?;
                String::from_utf8(key.to_vec())
                    .map_err(|e| TesseraError::Storage(format!("non-utf8 fragment id: {e}")))
            })
            .collect()
    }

    fn stats(&self) -> Result<StoreStats> {
        let mut bytes_used = 0u64;
        for item in self.fragments.iter() {
            let (_, value) = item.map_err(storage_err)?;
            bytes_used += value.len() as u64;
        }
        Ok(StoreStats {
            fragment_count: self.fragments.len() as u64,
            bytes_used,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}
