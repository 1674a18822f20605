//! Tessera Core Library
//!
//! Core abstractions for the Tessera Byzantine-fault-tolerant storage
//! backend. This crate provides:
//! - Threshold secret sharing of blobs into fragments (plus a mirror codec)
//! - Reed-Solomon erasure coding and AES-256-GCM primitives it builds on
//! - Fragment and distribution-set types
//! - Cluster configuration and the shared error taxonomy

pub mod codec;
pub mod config;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod fragment;

pub use codec::{CodecKind, MirrorCodec, SecretSharing, ThresholdCodec};
pub use config::{BackendKind, ClusterConfig, NodeSettings, ReplicaSettings, TimeoutSettings};
pub use crypto::Digest;
pub use error::{ReconstructionError, Result, TesseraError};
pub use fragment::{DistributionSet, Fragment, INDEX_FRAGMENT_ID};
