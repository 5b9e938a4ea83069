//! Storage media: the raw key/value persistence underneath [`DurableStore`].
//!
//! [`DurableStore`]: super::DurableStore

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::DEFAULT_STORAGE_LIMIT_BYTES;

/// Errors raised by a storage medium.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediumError {
    /// The write would exceed the medium's capacity. The previous value, if
    /// any, is left untouched.
    #[error("quota exceeded writing '{key}' ({needed} bytes needed)")]
    QuotaExceeded { key: String, needed: usize },

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MediumError {
    fn from(err: std::io::Error) -> Self {
        MediumError::Io(err.to_string())
    }
}

/// A persisted string key/value medium with a capacity ceiling.
///
/// Implementations must fail a write that does not fit with
/// [`MediumError::QuotaExceeded`] without disturbing the existing value.
#[async_trait]
pub trait StorageMedium: Send + Sync {
    /// Read the raw value for `key`.
    async fn read(&self, key: &str) -> Result<Option<String>, MediumError>;

    /// Write the raw value for `key`, replacing any previous value.
    async fn write(&self, key: &str, value: &str) -> Result<(), MediumError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), MediumError>;

    /// All entries currently held.
    async fn entries(&self) -> Result<Vec<(String, String)>, MediumError>;
}

/// Bytes a single entry occupies for quota purposes.
pub(crate) fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// In-process medium with a byte ceiling.
///
/// Clones share the same underlying map, so a clone can stand in for "the
/// same storage after a restart".
#[derive(Debug, Clone)]
pub struct MemoryMedium {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    limit_bytes: usize,
    /// Reads left to fail with an I/O error
    failing_reads: Arc<AtomicUsize>,
}

impl MemoryMedium {
    /// Create an empty medium with the default ceiling.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_STORAGE_LIMIT_BYTES)
    }

    /// Create an empty medium holding at most `limit_bytes`.
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            limit_bytes,
            failing_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bytes currently in use.
    pub async fn used_bytes(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.iter().map(|(k, v)| entry_size(k, v)).sum()
    }

    /// Store a raw value without quota checks. Useful for seeding corrupt or
    /// foreign data.
    pub async fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().await.insert(key.into(), value.into());
    }

    /// Make the next `count` reads fail as if the device were unavailable.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    fn take_read_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageMedium for MemoryMedium {
    async fn read(&self, key: &str) -> Result<Option<String>, MediumError> {
        if self.take_read_failure() {
            return Err(MediumError::Io(format!("injected read failure for '{key}'")));
        }
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), MediumError> {
        let mut entries = self.entries.lock().await;
        let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        let replaced = entries.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        let needed = entry_size(key, value);

        if used - replaced + needed > self.limit_bytes {
            return Err(MediumError::QuotaExceeded {
                key: key.to_string(),
                needed,
            });
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), MediumError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>, MediumError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
