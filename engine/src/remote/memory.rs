//! In-process backend with fault injection.

use super::{RemoteBackend, RemoteError};
use crate::{record_key, CachedCollection};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A call that reached the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    FetchAll {
        resource: String,
    },
    Insert {
        resource: String,
        payload: Value,
    },
    Update {
        resource: String,
        key: String,
        payload: Value,
    },
    Delete {
        resource: String,
        key: String,
    },
}

impl Call {
    pub fn resource(&self) -> &str {
        match self {
            Call::FetchAll { resource }
            | Call::Insert { resource, .. }
            | Call::Update { resource, .. }
            | Call::Delete { resource, .. } => resource,
        }
    }

    /// Whether this call changes data.
    pub fn is_write(&self) -> bool {
        !matches!(self, Call::FetchAll { .. })
    }
}

type Rejector = Box<dyn Fn(&Call) -> Option<String> + Send + Sync>;

struct Inner {
    key_field: String,
    tables: Mutex<HashMap<String, CachedCollection>>,
    calls: Mutex<Vec<Call>>,
    rejector: Mutex<Option<Rejector>>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
}

/// A backend holding its tables in memory.
///
/// Behaves like the reference server: inserts upsert by key, updates of
/// missing records are rejected with 404, deletes of missing records
/// succeed. Clones share state, so a test can keep a handle while the sync
/// core owns another.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("key_field", &self.inner.key_field)
            .field("offline", &self.inner.offline.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend keying records by `"id"`.
    pub fn new() -> Self {
        Self::with_key_field("id")
    }

    /// Create an empty backend keying records by `key_field`.
    pub fn with_key_field(key_field: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                key_field: key_field.into(),
                tables: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                rejector: Mutex::new(None),
                offline: AtomicBool::new(false),
                latency_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the records of `resource`.
    pub async fn seed(&self, resource: &str, records: Vec<Value>) {
        let mut tables = self.inner.tables.lock().await;
        tables.insert(resource.to_string(), CachedCollection::from_remote(records, 0));
    }

    /// Current records of `resource`.
    pub async fn records(&self, resource: &str) -> Vec<Value> {
        let tables = self.inner.tables.lock().await;
        tables
            .get(resource)
            .map(|t| t.records().to_vec())
            .unwrap_or_default()
    }

    /// Every call that reached the backend, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().await.clone()
    }

    /// Calls that changed (or tried to change) data.
    pub async fn write_calls(&self) -> Vec<Call> {
        self.calls()
            .await
            .into_iter()
            .filter(Call::is_write)
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.inner.calls.lock().await.clear();
    }

    /// Simulate losing (or regaining) the network.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Reject calls for which `rule` returns a reason (HTTP 422).
    pub async fn reject_when<F>(&self, rule: F)
    where
        F: Fn(&Call) -> Option<String> + Send + Sync + 'static,
    {
        *self.inner.rejector.lock().await = Some(Box::new(rule));
    }

    /// Stop rejecting.
    pub async fn accept_all(&self) {
        *self.inner.rejector.lock().await = None;
    }

    /// Common path of every call: latency, reachability, logging, rejection.
    async fn admit(&self, call: Call) -> Result<(), RemoteError> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("backend unreachable".into()));
        }

        let rejection = self
            .inner
            .rejector
            .lock()
            .await
            .as_ref()
            .and_then(|rule| rule(&call));
        self.inner.calls.lock().await.push(call);

        match rejection {
            Some(message) => Err(RemoteError::Rejected {
                status: 422,
                message,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn fetch_all(&self, resource: &str) -> Result<Vec<Value>, RemoteError> {
        self.admit(Call::FetchAll {
            resource: resource.to_string(),
        })
        .await?;
        Ok(self.records(resource).await)
    }

    async fn insert(&self, resource: &str, payload: &Value) -> Result<(), RemoteError> {
        self.admit(Call::Insert {
            resource: resource.to_string(),
            payload: payload.clone(),
        })
        .await?;

        if record_key(payload, &self.inner.key_field).is_none() {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("record has no '{}' field", self.inner.key_field),
            });
        }

        let mut tables = self.inner.tables.lock().await;
        tables
            .entry(resource.to_string())
            .or_default()
            .upsert(payload.clone(), &self.inner.key_field);
        Ok(())
    }

    async fn update(&self, resource: &str, key: &str, payload: &Value) -> Result<(), RemoteError> {
        self.admit(Call::Update {
            resource: resource.to_string(),
            key: key.to_string(),
            payload: payload.clone(),
        })
        .await?;

        let mut tables = self.inner.tables.lock().await;
        let table = tables.entry(resource.to_string()).or_default();
        if table.get(key, &self.inner.key_field).is_none() {
            return Err(RemoteError::Rejected {
                status: 404,
                message: format!("{resource}/{key} not found"),
            });
        }
        table.merge(key, payload, &self.inner.key_field);
        Ok(())
    }

    async fn delete(&self, resource: &str, key: &str) -> Result<(), RemoteError> {
        self.admit(Call::Delete {
            resource: resource.to_string(),
            key: key.to_string(),
        })
        .await?;

        let mut tables = self.inner.tables.lock().await;
        if let Some(table) = tables.get_mut(resource) {
            table.remove(key, &self.inner.key_field);
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("backend unreachable".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_is_idempotent() {
        let backend = MemoryBackend::new();
        let record = json!({"id": "1", "qty": 5});
        backend.insert("items", &record).await.unwrap();
        backend.insert("items", &record).await.unwrap();
        assert_eq!(backend.records("items").await, vec![record]);
    }

    #[tokio::test]
    async fn insert_without_key_is_rejected() {
        let backend = MemoryBackend::new();
        let err = backend.insert("items", &json!({"qty": 5})).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend
            .update("items", "nope", &json!({"qty": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn delete_missing_succeeds() {
        let backend = MemoryBackend::new();
        assert!(backend.delete("items", "nope").await.is_ok());
    }

    #[tokio::test]
    async fn offline_calls_fail_transiently_and_are_not_logged() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);

        let err = backend.fetch_all("items").await.unwrap_err();
        assert!(err.is_transient());
        assert!(backend.probe().await.is_err());
        assert!(backend.calls().await.is_empty());

        backend.set_offline(false);
        assert!(backend.fetch_all("items").await.is_ok());
        assert!(backend.probe().await.is_ok());
    }

    #[tokio::test]
    async fn rejection_rule_applies() {
        let backend = MemoryBackend::new();
        backend
            .reject_when(|call| match call {
                Call::Insert { payload, .. } if payload["qty"].as_i64().is_some_and(|q| q < 0) => {
                    Some("qty must not be negative".into())
                }
                _ => None,
            })
            .await;

        let err = backend
            .insert("items", &json!({"id": "1", "qty": -3}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 422,
                message: "qty must not be negative".into()
            }
        );
        assert!(backend
            .insert("items", &json!({"id": "2", "qty": 3}))
            .await
            .is_ok());
        assert_eq!(backend.write_calls().await.len(), 2);

        backend.accept_all().await;
        assert!(backend
            .insert("items", &json!({"id": "1", "qty": -3}))
            .await
            .is_ok());
    }
}
