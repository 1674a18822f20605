//! Directory format errors

use tessera_core::TesseraError;
use thiserror::Error;

/// Why a serialized directory could not be read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after the last entry")]
    TrailingBytes(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("path {0} appears more than once")]
    DuplicatePath(String),

    #[error("fragment of {path} names unknown storage node {node}")]
    UnknownNode { path: String, node: String },

    #[error("invalid distribution set for {path}: {reason}")]
    InvalidSet { path: String, reason: String },
}

impl From<FormatError> for TesseraError {
    fn from(err: FormatError) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}
