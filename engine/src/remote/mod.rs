//! Remote backend boundary.
//!
//! The sync core only needs four operations per resource plus a bulk fetch.
//! Any backend (REST, GraphQL, a hosted database client) can sit behind
//! [`RemoteBackend`].

#[cfg(feature = "http")]
mod http;
mod memory;
pub mod wire;

#[cfg(feature = "http")]
pub use http::HttpBackend;
pub use memory::{Call, MemoryBackend};

use crate::{MutationKind, PendingMutation};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Why a remote call failed.
///
/// Network failures and timeouts mean "offline" and are worth retrying.
/// Rejections mean the backend saw the request and refused it; retrying the
/// same request will keep failing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rejected by backend ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    /// Whether the failure is a connectivity problem rather than a refusal.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }

    /// Classify an HTTP error status.
    ///
    /// 408, 429 and 5xx are transient; every other status is a rejection.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 | 500..=599 => RemoteError::Network(format!("status {status}: {message}")),
            _ => RemoteError::Rejected { status, message },
        }
    }
}

/// The authoritative store the sync core reconciles against.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Fetch every record of `resource`.
    async fn fetch_all(&self, resource: &str) -> Result<Vec<Value>, RemoteError>;

    /// Create a record. Must tolerate replays of the same payload.
    async fn insert(&self, resource: &str, payload: &Value) -> Result<(), RemoteError>;

    /// Update the record under `key` with a (partial) payload.
    async fn update(&self, resource: &str, key: &str, payload: &Value) -> Result<(), RemoteError>;

    /// Delete the record under `key`.
    async fn delete(&self, resource: &str, key: &str) -> Result<(), RemoteError>;

    /// Cheap reachability check. Backends without one are assumed reachable.
    async fn probe(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Send one pending mutation to the backend.
pub async fn dispatch(
    backend: &dyn RemoteBackend,
    mutation: &PendingMutation,
) -> Result<(), RemoteError> {
    send_change(
        backend,
        mutation.kind,
        &mutation.resource,
        mutation.key.as_deref(),
        &mutation.payload,
    )
    .await
}

/// Route a single change to the matching backend call.
pub async fn send_change(
    backend: &dyn RemoteBackend,
    kind: MutationKind,
    resource: &str,
    key: Option<&str>,
    payload: &Value,
) -> Result<(), RemoteError> {
    match (kind, key) {
        (MutationKind::Create, _) => backend.insert(resource, payload).await,
        (MutationKind::Update, Some(key)) => backend.update(resource, key, payload).await,
        (MutationKind::Delete, Some(key)) => backend.delete(resource, key).await,
        (kind, None) => Err(RemoteError::Rejected {
            status: 400,
            message: format!("{kind} mutation without a record key"),
        }),
    }
}
