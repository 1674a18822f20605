//! Error types for Tessera
//!
//! Provides a unified error type for all Tessera operations. Crate-level
//! error enums in the storage, agreement and metadata layers convert into
//! [`TesseraError`] at their boundaries.

use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Why a blob could not be rebuilt from its fragments
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconstructionError {
    #[error("insufficient fragments: have {available}, need {required}")]
    InsufficientFragments { available: usize, required: usize },

    #[error("fragments belong to different distribution sets")]
    InconsistentFragments,

    #[error("integrity verification failed")]
    IntegrityCheckFailed,
}

/// Unified error type for Tessera
#[derive(Error, Debug)]
pub enum TesseraError {
    // ===== Secret Sharing Errors =====
    #[error("Reconstruction failure: {0}")]
    Reconstruction(#[from] ReconstructionError),

    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    // ===== Storage Errors =====
    #[error("Storage node unavailable: {node}")]
    NodeUnavailable { node: String },

    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Agreement Errors =====
    #[error("Invalid protocol message: {0}")]
    InvalidMessage(String),

    #[error("Invalid checkpoint message: {0}")]
    InvalidCheckpoint(String),

    #[error("Agreement did not complete within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    // ===== Metadata Errors =====
    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Metadata service is not connected")]
    NotConnected,

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Whether this error means the blob is unrecoverable from storage
    pub fn is_reconstruction_failure(&self) -> bool {
        matches!(self, TesseraError::Reconstruction(_))
    }
}

impl From<reed_solomon_erasure::Error> for TesseraError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        TesseraError::ErasureCoding(err.to_string())
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}
