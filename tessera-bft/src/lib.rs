//! Tessera Byzantine agreement
//!
//! A replication engine that orders client commands across `3f+1`
//! replicas and executes them identically on every honest one:
//! - `BftEngine`: PBFT-style pre-prepare / prepare / commit with
//!   checkpointing, log garbage collection and state transfer
//! - `BftEngineCallbacks`: the engine's only channel to the outside world
//! - Signed protocol messages (ed25519) and suspicion tracking
//!
//! The engine performs no I/O and owns no threads; a runtime drives it.

pub mod callbacks;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod log;
pub mod messages;
pub mod replica_set;
pub mod suspicion;

pub use callbacks::BftEngineCallbacks;
pub use checkpoint::{StableCheckpoint, StateHasher};
pub use engine::{BftEngine, EngineConfig};
pub use error::InvalidMessage;
pub use messages::{
    CheckpointMessage, ClientCommand, CommittedSlot, PrePrepare, ProtocolMessage, ReplicaId,
    SequenceNumber, SignedMessage, StateTransfer, TransactionResult, ViewNumber, Vote,
};
pub use replica_set::{parse_verifying_key, ReplicaInfo, ReplicaSet};
pub use suspicion::{SuspicionReport, SuspicionTracker};

// Re-exported so runtimes need no direct dependency for key handling
pub use ed25519_dalek::{SigningKey, VerifyingKey};
