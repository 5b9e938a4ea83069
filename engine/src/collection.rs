//! Cached collections: the local mirror of a remote resource.

use crate::{MutationKind, PendingMutation, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Extract a record's key from its `key_field`.
///
/// String and integer keys are accepted; anything else has no key.
pub fn record_key(record: &Value, key_field: &str) -> Option<String> {
    match record.get(key_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// An ordered list of records mirroring a remote resource.
///
/// Replaced wholesale on every successful remote fetch and patched in place
/// by local writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCollection {
    records: Vec<Value>,
    /// When the records last came from the backend
    #[serde(default)]
    fetched_at: Option<Timestamp>,
}

impl CachedCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection from a fresh remote fetch.
    pub fn from_remote(records: Vec<Value>, fetched_at: Timestamp) -> Self {
        Self {
            records,
            fetched_at: Some(fetched_at),
        }
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Value> {
        self.records
    }

    pub fn fetched_at(&self) -> Option<Timestamp> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, key: &str, key_field: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| record_key(r, key_field).as_deref() == Some(key))
    }

    /// Get a record by key.
    pub fn get(&self, key: &str, key_field: &str) -> Option<&Value> {
        self.position(key, key_field).map(|i| &self.records[i])
    }

    /// Replace the record with the same key, or append it.
    pub fn upsert(&mut self, record: Value, key_field: &str) {
        match record_key(&record, key_field).and_then(|k| self.position(&k, key_field)) {
            Some(i) => self.records[i] = record,
            None => self.records.push(record),
        }
    }

    /// Shallow-merge `patch` into the record under `key`.
    ///
    /// Object fields in `patch` overwrite the record's fields. An unknown key
    /// inserts the patch as a new record carrying the key.
    pub fn merge(&mut self, key: &str, patch: &Value, key_field: &str) {
        match self.position(key, key_field) {
            Some(i) => match (&mut self.records[i], patch) {
                (Value::Object(existing), Value::Object(fields)) => {
                    for (name, value) in fields {
                        existing.insert(name.clone(), value.clone());
                    }
                }
                (slot, _) => *slot = patch.clone(),
            },
            None => {
                let mut record = patch.clone();
                if let Value::Object(fields) = &mut record {
                    fields
                        .entry(key_field.to_string())
                        .or_insert_with(|| Value::String(key.to_string()));
                }
                self.records.push(record);
            }
        }
    }

    /// Remove the record under `key`. Returns whether one was removed.
    pub fn remove(&mut self, key: &str, key_field: &str) -> bool {
        match self.position(key, key_field) {
            Some(i) => {
                self.records.remove(i);
                true
            }
            None => false,
        }
    }

    /// Apply a pending mutation locally, the way the backend would.
    pub fn apply(&mut self, mutation: &PendingMutation, key_field: &str) {
        self.apply_change(
            mutation.kind,
            mutation.key.as_deref(),
            &mutation.payload,
            key_field,
        );
    }

    /// Apply a single change. Updates and deletes without a key are ignored.
    pub fn apply_change(
        &mut self,
        kind: MutationKind,
        key: Option<&str>,
        payload: &Value,
        key_field: &str,
    ) {
        match (kind, key) {
            (MutationKind::Create, _) => self.upsert(payload.clone(), key_field),
            (MutationKind::Update, Some(key)) => self.merge(key, payload, key_field),
            (MutationKind::Delete, Some(key)) => {
                self.remove(key, key_field);
            }
            (_, None) => {}
        }
    }

    /// Typed view of the records, skipping those that do not fit `T`.
    pub fn records_as<T: DeserializeOwned>(&self) -> Vec<T> {
        self.records
            .iter()
            .filter_map(|record| match serde_json::from_value(record.clone()) {
                Ok(typed) => Some(typed),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping cached record of unexpected shape");
                    None
                }
            })
            .collect()
    }
}
