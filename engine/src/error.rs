//! Error types for the Depot engine.

use crate::{remote::RemoteError, store::MediumError};
use thiserror::Error;

/// All errors the engine surfaces to its callers.
///
/// Most failures never get this far: remote and connectivity problems degrade
/// into cache reads and queued writes instead of errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Storage errors
    #[error("storage quota exceeded writing '{key}' ({needed} bytes needed)")]
    QuotaExceeded { key: String, needed: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Remote errors
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    // Caller errors
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<MediumError> for Error {
    fn from(err: MediumError) -> Self {
        match err {
            MediumError::QuotaExceeded { key, needed } => Error::QuotaExceeded { key, needed },
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
