//! Protocol messages
//!
//! Client commands, the intra-replica messages of the normal-case
//! protocol, and the state transfer that lets a lagging replica catch up.
//! Everything a replica sends travels inside a [`SignedMessage`].

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tessera_core::crypto::Digest;
use tessera_core::error::Result;

pub type ReplicaId = u32;
pub type ViewNumber = u64;
pub type SequenceNumber = u64;

/// An opaque client operation to be ordered and executed exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommand {
    pub client_id: String,
    /// Monotonic per client; retransmissions reuse the same id
    pub request_id: u64,
    pub operation: Vec<u8>,
}

impl ClientCommand {
    pub fn new(client_id: impl Into<String>, request_id: u64, operation: Vec<u8>) -> Self {
        Self {
            client_id: client_id.into(),
            request_id,
            operation,
        }
    }

    /// BLAKE3 digest of the canonical encoding
    pub fn digest(&self) -> Digest {
        Digest::compute_parts(&[
            &(self.client_id.len() as u64).to_be_bytes(),
            self.client_id.as_bytes(),
            &self.request_id.to_be_bytes(),
            &self.operation,
        ])
    }
}

/// Proposal of the primary binding a command to a sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: Digest,
    pub command: ClientCommand,
}

/// A prepare or commit vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: Digest,
}

/// Claim that `replica` reached `state_digest` after executing `sequence`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMessage {
    pub replica: ReplicaId,
    pub sequence: SequenceNumber,
    pub state_digest: Digest,
}

/// An executed slot together with the signed commits that certify it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedSlot {
    pub pre_prepare: PrePrepare,
    pub commits: Vec<SignedMessage>,
}

/// What a replica knows past a lagging peer's position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransfer {
    /// Signed checkpoint votes proving the sender's stable checkpoint; empty
    /// unless the requester is behind it
    pub checkpoint: Vec<SignedMessage>,
    /// Executed slots above the checkpoint (or the requested position), in
    /// sequence order
    pub slots: Vec<CommittedSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// A client command handed from a backup to the primary
    Request(ClientCommand),
    PrePrepare(PrePrepare),
    Prepare(Vote),
    Commit(Vote),
    Checkpoint(CheckpointMessage),
    /// Ask peers for everything executed after `after`
    StateRequest { after: SequenceNumber },
    StateTransfer(StateTransfer),
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Request(_) => "request",
            ProtocolMessage::PrePrepare(_) => "pre-prepare",
            ProtocolMessage::Prepare(_) => "prepare",
            ProtocolMessage::Commit(_) => "commit",
            ProtocolMessage::Checkpoint(_) => "checkpoint",
            ProtocolMessage::StateRequest { .. } => "state-request",
            ProtocolMessage::StateTransfer(_) => "state-transfer",
        }
    }

    pub fn sequence(&self) -> Option<SequenceNumber> {
        match self {
            ProtocolMessage::Request(_)
            | ProtocolMessage::StateRequest { .. }
            | ProtocolMessage::StateTransfer(_) => None,
            ProtocolMessage::PrePrepare(p) => Some(p.sequence),
            ProtocolMessage::Prepare(v) | ProtocolMessage::Commit(v) => Some(v.sequence),
            ProtocolMessage::Checkpoint(c) => Some(c.sequence),
        }
    }
}

/// Result of a committed command, relayed back to the issuing client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub client_id: String,
    pub request_id: u64,
    /// Replica that executed the command
    pub replica: ReplicaId,
    pub sequence: SequenceNumber,
    pub result: Vec<u8>,
}

/// `(sender, message, ed25519 signature)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub sender: ReplicaId,
    pub message: ProtocolMessage,
    pub signature: Vec<u8>,
}

fn signing_payload(sender: ReplicaId, message: &ProtocolMessage) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(sender, message))?)
}

impl SignedMessage {
    /// Sign `message` as `sender`
    pub fn sign(sender: ReplicaId, message: ProtocolMessage, key: &SigningKey) -> Result<Self> {
        let payload = signing_payload(sender, &message)?;
        let signature = key.sign(&payload).to_bytes().to_vec();
        Ok(Self {
            sender,
            message,
            signature,
        })
    }

    /// Check the signature against the sender's verifying key
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        match signing_payload(self.sender, &self.message) {
            Ok(payload) => key.verify(&payload, &signature).is_ok(),
            Err(_) => false,
        }
    }
}
