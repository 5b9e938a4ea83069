//! Record persistence.
//!
//! Records are opaque JSON objects grouped by resource and identified by a
//! string key. PostgreSQL backs production; the in-memory repository backs
//! tests and local development.

mod memory;
mod records;

pub use memory::MemoryRepository;
pub use records::PgRepository;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Storage for resource records.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Every record of `resource`, oldest first.
    async fn list(&self, resource: &str) -> Result<Vec<Value>>;

    /// Insert or replace the record under `key`.
    async fn upsert(&self, resource: &str, key: &str, record: &Map<String, Value>) -> Result<Value>;

    /// Shallow-merge `patch` into the record under `key`.
    ///
    /// Returns `None` if there is no such record.
    async fn merge(
        &self,
        resource: &str,
        key: &str,
        patch: &Map<String, Value>,
    ) -> Result<Option<Value>>;

    /// Delete the record under `key`. Returns whether one existed.
    async fn delete(&self, resource: &str, key: &str) -> Result<bool>;

    /// Whether the repository can serve requests.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
