//! Core error types

use thiserror::Error;

/// Errors from the canonical data model.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Key fragment too short to derive an identity
    #[error("Key fragment too short: {len} bytes (need at least 4)")]
    InvalidKeyFragment {
        /// Fragment length supplied
        len: usize,
    },

    /// Malformed node identity
    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
