//! Tessera Storage
//!
//! Storage-side building blocks:
//! - `FragmentStore` trait with `MemoryStore` and `SledStore` implementations
//! - `StorageNode` async handle and the in-process `LocalNode`
//! - `StorageServers`, the configured node set
//! - `Distributor`, which fans distribution sets out to nodes and back

pub mod distributor;
pub mod memory;
pub mod node;
pub mod servers;
pub mod sled_store;
pub mod store;

pub use distributor::{Distributor, DistributorConfig, NodeOutcome, PutReport};
pub use memory::MemoryStore;
pub use node::{LocalNode, NodeError, NodeResult, StorageNode};
pub use servers::StorageServers;
pub use sled_store::SledStore;
pub use store::{FragmentStore, StoreStats};
