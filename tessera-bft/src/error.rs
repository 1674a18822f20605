//! Validation failures for protocol input
//!
//! Every rejected message is classified by an [`InvalidMessage`] reason.
//! Rejections never change protocol state; they are reported through the
//! engine callbacks and, when attributable, counted as evidence against the
//! sender.

use crate::messages::{ReplicaId, SequenceNumber, ViewNumber};
use tessera_core::TesseraError;
use thiserror::Error;

/// Why a protocol message was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidMessage {
    // ===== Envelope =====
    #[error("sender {0} is not a member of the replica set")]
    UnknownSender(ReplicaId),

    #[error("message claims to originate from this replica")]
    Impersonation,

    #[error("signature verification failed")]
    BadSignature,

    #[error("malformed message: {0}")]
    Malformed(String),

    // ===== Ordering =====
    #[error("message for view {got}, current view is {current}")]
    WrongView { current: ViewNumber, got: ViewNumber },

    #[error("sequence {sequence} outside window ({low}, {high}]")]
    OutsideWindow {
        sequence: SequenceNumber,
        low: SequenceNumber,
        high: SequenceNumber,
    },

    #[error("replica {sender} is not the primary of view {view}")]
    NotPrimary { sender: ReplicaId, view: ViewNumber },

    #[error("primary {0} may not send prepares")]
    PrepareFromPrimary(ReplicaId),

    #[error("pre-prepare digest does not match its command")]
    DigestMismatch,

    #[error("conflicting pre-prepare for sequence {0}")]
    ConflictingPrePrepare(SequenceNumber),

    #[error("conflicting vote for sequence {0}")]
    ConflictingVote(SequenceNumber),

    // ===== Checkpoints =====
    #[error("checkpoint sequence {sequence} is not a multiple of {interval}")]
    UnalignedCheckpoint {
        sequence: SequenceNumber,
        interval: u64,
    },

    #[error("checkpoint {sequence} is not above stable checkpoint {stable}")]
    StaleCheckpoint {
        sequence: SequenceNumber,
        stable: SequenceNumber,
    },

    #[error("checkpoint {sequence} is above the high watermark {high}")]
    CheckpointAboveWindow {
        sequence: SequenceNumber,
        high: SequenceNumber,
    },

    #[error("conflicting checkpoint digest for sequence {0}")]
    ConflictingCheckpoint(SequenceNumber),

    // ===== State transfer =====
    #[error("invalid certificate for sequence {sequence}: {reason}")]
    InvalidCertificate {
        sequence: SequenceNumber,
        reason: &'static str,
    },

    // ===== Views =====
    #[error("view {requested} does not advance current view {current}")]
    ViewRegression {
        current: ViewNumber,
        requested: ViewNumber,
    },
}

impl InvalidMessage {
    /// Whether the failure counts as evidence against the claimed sender
    ///
    /// Unknown senders, impersonation and bad signatures cannot be
    /// attributed to a member of the replica set, since the claimed sender
    /// is only proven by a valid signature. View and window mismatches are what a lagging honest
    /// replica produces, so they are reported but not counted.
    pub fn is_evidence(&self) -> bool {
        !matches!(
            self,
            InvalidMessage::UnknownSender(_)
                | InvalidMessage::Impersonation
                | InvalidMessage::BadSignature
                | InvalidMessage::WrongView { .. }
                | InvalidMessage::OutsideWindow { .. }
                | InvalidMessage::StaleCheckpoint { .. }
                | InvalidMessage::CheckpointAboveWindow { .. }
                | InvalidMessage::ViewRegression { .. }
        )
    }
}

impl From<InvalidMessage> for TesseraError {
    fn from(err: InvalidMessage) -> Self {
        match err {
            InvalidMessage::UnalignedCheckpoint { .. }
            | InvalidMessage::StaleCheckpoint { .. }
            | InvalidMessage::CheckpointAboveWindow { .. }
            | InvalidMessage::ConflictingCheckpoint(_) => {
                TesseraError::InvalidCheckpoint(err.to_string())
            }
            _ => TesseraError::InvalidMessage(err.to_string()),
        }
    }
}
