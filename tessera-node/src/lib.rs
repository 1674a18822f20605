//! Tessera node
//!
//! Runs the agreement replicas and exposes storage through them:
//! - `Replica` / `ReplicaCluster`: one task per replica driving a `BftEngine`
//! - `StorageApplication`: the state machine executed on commit
//! - `ReplicatedNode`: a `StorageNode` whose operations are agreed upon first
//! - `LocalNetwork`: in-process transport with drop rules
//! - `StorageEngine`: whole-object put/get on top of metadata and distribution

pub mod application;
pub mod client;
pub mod cluster;
pub mod engine;
pub mod replica;
pub mod transport;

pub use application::{StorageApplication, StorageCommand, StorageReply};
pub use client::{ClusterRoute, ReplicatedNode};
pub use cluster::ReplicaCluster;
pub use engine::StorageEngine;
pub use replica::{Replica, ReplicaCallbacks, ReplicaHandle, ReplicaStats};
pub use transport::{LocalNetwork, ReplicaInput, Transport};
