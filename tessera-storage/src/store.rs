//! Fragment store trait
//!
//! Defines the interface that every replica-local fragment store follows.
//! Stores are synchronous: the agreement engine executes committed commands
//! against them inline. [`crate::LocalNode`] lifts a store into the async
//! [`crate::StorageNode`] capability.

use bytes::Bytes;
use tessera_core::error::Result;

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of fragments stored
    pub fragment_count: u64,

    /// Total payload bytes
    pub bytes_used: u64,

    /// Number of read operations
    pub reads: u64,

    /// Number of write operations
    pub writes: u64,

    /// Number of delete operations
    pub deletes: u64,
}

/// Key-addressed blob store holding the fragments of one storage node
pub trait FragmentStore: Send + Sync {
    /// Store (or overwrite) a fragment
    fn put(&self, fragment_id: &str, data: Bytes) -> Result<()>;

    /// Retrieve a fragment
    fn get(&self, fragment_id: &str) -> Result<Option<Bytes>>;

    /// Delete a fragment, returning whether it existed
    fn delete(&self, fragment_id: &str) -> Result<bool>;

    /// Check if a fragment exists
    fn contains(&self, fragment_id: &str) -> Result<bool>;

    /// Number of stored fragments
    fn fragment_count(&self) -> Result<usize>;

    /// List all fragment ids
    fn list_fragments(&self) -> Result<Vec<String>>;

    /// Get store statistics
    fn stats(&self) -> Result<StoreStats>;

    /// Flush any pending writes
    fn flush(&self) -> Result<()>;
}
