//! The fixed replica set
//!
//! Identifies every replica by id, address and verifying key. The primary
//! of view `v` is the replica at position `v mod n`.

use crate::messages::{ReplicaId, ViewNumber};
use ed25519_dalek::VerifyingKey;
use tessera_core::error::{Result, TesseraError};

/// One agreement participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub address: String,
    pub verifying_key: VerifyingKey,
}

impl ReplicaInfo {
    pub fn new(id: ReplicaId, address: impl Into<String>, verifying_key: VerifyingKey) -> Self {
        Self {
            id,
            address: address.into(),
            verifying_key,
        }
    }
}

/// Replica membership with fault tolerance `f`
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    replicas: Vec<ReplicaInfo>,
    faulty: usize,
}

impl ReplicaSet {
    /// Build a replica set, requiring `n >= 3f + 1` and unique ids
    pub fn new(replicas: Vec<ReplicaInfo>, faulty: usize) -> Result<Self> {
        if replicas.len() < 3 * faulty + 1 {
            return Err(TesseraError::Configuration(format!(
                "{} replicas cannot tolerate {} faults",
                replicas.len(),
                faulty
            )));
        }
        for (i, replica) in replicas.iter().enumerate() {
            if replicas[..i].iter().any(|r| r.id == replica.id) {
                return Err(TesseraError::Configuration(format!(
                    "duplicate replica id {}",
                    replica.id
                )));
            }
        }
        Ok(Self { replicas, faulty })
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Tolerated faulty replicas (f)
    pub fn faulty(&self) -> usize {
        self.faulty
    }

    /// Matching votes needed to certify agreement (2f+1)
    pub fn quorum(&self) -> usize {
        2 * self.faulty + 1
    }

    pub fn primary(&self, view: ViewNumber) -> ReplicaId {
        let position = (view % self.replicas.len() as u64) as usize;
        self.replicas[position].id
    }

    pub fn get(&self, id: ReplicaId) -> Option<&ReplicaInfo> {
        self.replicas.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.get(id).is_some()
    }

    pub fn verifying_key(&self, id: ReplicaId) -> Option<&VerifyingKey> {
        self.get(id).map(|r| &r.verifying_key)
    }

    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.iter().map(|r| r.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.iter()
    }
}

/// Parse a hex-encoded ed25519 verifying key
pub fn parse_verifying_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(encoded)
        .map_err(|e| TesseraError::Configuration(format!("invalid public key hex: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TesseraError::Configuration("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| TesseraError::Configuration(format!("invalid public key: {e}")))
}
