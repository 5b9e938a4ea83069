//! In-memory repository, used when no database is configured.

use super::RecordRepository;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use depot_engine::CachedCollection;
use serde_json::{Map, Value};

/// Records held in a concurrent map of collections, one per resource.
#[derive(Debug)]
pub struct MemoryRepository {
    key_field: String,
    tables: DashMap<String, CachedCollection>,
}

impl MemoryRepository {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            tables: DashMap::new(),
        }
    }
}

#[async_trait]
impl RecordRepository for MemoryRepository {
    async fn list(&self, resource: &str) -> Result<Vec<Value>> {
        Ok(self
            .tables
            .get(resource)
            .map(|table| table.records().to_vec())
            .unwrap_or_default())
    }

    async fn upsert(&self, resource: &str, _key: &str, record: &Map<String, Value>) -> Result<Value> {
        // The record carries its own key under `key_field`.
        let mut table = self.tables.entry(resource.to_string()).or_default();
        let record = Value::Object(record.clone());
        table.upsert(record.clone(), &self.key_field);
        Ok(record)
    }

    async fn merge(
        &self,
        resource: &str,
        key: &str,
        patch: &Map<String, Value>,
    ) -> Result<Option<Value>> {
        let Some(mut table) = self.tables.get_mut(resource) else {
            return Ok(None);
        };
        if table.get(key, &self.key_field).is_none() {
            return Ok(None);
        }
        table.merge(key, &Value::Object(patch.clone()), &self.key_field);
        Ok(table.get(key, &self.key_field).cloned())
    }

    async fn delete(&self, resource: &str, key: &str) -> Result<bool> {
        Ok(self
            .tables
            .get_mut(resource)
            .is_some_and(|mut table| table.remove(key, &self.key_field)))
    }
}
