//! Resource accessor - the read/write surface feature code talks to.
//!
//! Reads go to the backend when it is believed reachable and fall back to
//! the cache on any failure, so a read never errors. Writes patch the cache
//! first, then either reach the backend right away or wait in the queue.

use crate::remote::{self, RemoteBackend};
use crate::store::StoreKey;
use crate::{
    record_key, Error, MutationId, MutationKind, NewMutation, Result, SyncManager, SyncOutcome,
    SyncState,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOutcome {
    /// The backend accepted the change
    Applied,
    /// The change is cached and queued for the next drain
    Queued(MutationId),
    /// The backend refused the change; it was parked in dead letters
    Rejected { id: MutationId, reason: String },
}

impl WriteOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, WriteOutcome::Rejected { .. })
    }
}

/// Read/write access to remote resources with offline fallback.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct ResourceAccessor {
    manager: Arc<SyncManager>,
}

impl ResourceAccessor {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self { manager }
    }

    fn key_field(&self) -> &str {
        &self.manager.config().key_field
    }

    /// Records of `resource`: fresh from the backend when possible, cached
    /// otherwise (empty if nothing was ever cached).
    pub async fn read(&self, resource: &str) -> Vec<Value> {
        if self.manager.monitor().is_reachable() {
            match self.manager.refresh(resource).await {
                Ok(records) => return records,
                Err(e) => {
                    tracing::debug!(resource, error = %e, "Remote read failed, serving cache");
                }
            }
        }
        self.manager.cached(resource).await.into_records()
    }

    /// Typed [`read`](Self::read). Records that do not fit `T` are skipped.
    pub async fn read_as<T: DeserializeOwned>(&self, resource: &str) -> Vec<T> {
        self.read(resource)
            .await
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record) {
                Ok(typed) => Some(typed),
                Err(e) => {
                    tracing::warn!(resource, error = %e, "Skipping record of unexpected shape");
                    None
                }
            })
            .collect()
    }

    /// Records of `resource` from the cache only.
    pub async fn read_cached(&self, resource: &str) -> Vec<Value> {
        self.manager.cached(resource).await.into_records()
    }

    /// Write with the key taken from the payload.
    ///
    /// - `Create`: the payload is the full record. A record without a key
    ///   gets a generated one.
    /// - `Update`: the payload carries the key field plus changed fields.
    /// - `Delete`: the payload is the key itself, or a record carrying it.
    pub async fn write(
        &self,
        resource: &str,
        kind: MutationKind,
        payload: Value,
    ) -> Result<WriteOutcome> {
        let mutation = self.normalize(resource, kind, payload)?;
        self.submit(mutation).await
    }

    /// Create a record.
    pub async fn create(&self, resource: &str, record: Value) -> Result<WriteOutcome> {
        self.write(resource, MutationKind::Create, record).await
    }

    /// Update fields of the record under `key`.
    pub async fn update(&self, resource: &str, key: &str, patch: Value) -> Result<WriteOutcome> {
        self.submit(NewMutation::update(resource, key, patch)).await
    }

    /// Delete the record under `key`.
    pub async fn delete(&self, resource: &str, key: &str) -> Result<WriteOutcome> {
        self.submit(NewMutation::delete(resource, key)).await
    }

    fn normalize(&self, resource: &str, kind: MutationKind, payload: Value) -> Result<NewMutation> {
        let key_field = self.key_field();
        match kind {
            MutationKind::Create => {
                let key = record_key(&payload, key_field);
                let mut record = payload;
                let Value::Object(fields) = &mut record else {
                    return Err(Error::InvalidMutation("create payload must be an object".into()));
                };
                let key = key.unwrap_or_else(|| {
                    let key = Uuid::new_v4().to_string();
                    fields.insert(key_field.to_string(), Value::String(key.clone()));
                    key
                });
                Ok(NewMutation::create(resource, record).with_key(key))
            }
            MutationKind::Update => {
                let key = record_key(&payload, key_field).ok_or_else(|| {
                    Error::InvalidMutation(format!("update payload has no '{key_field}' field"))
                })?;
                Ok(NewMutation::update(resource, key, payload))
            }
            MutationKind::Delete => {
                let key = match &payload {
                    Value::String(key) => Some(key.clone()),
                    Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
                    other => record_key(other, key_field),
                }
                .ok_or_else(|| Error::InvalidMutation("delete payload carries no key".into()))?;
                Ok(NewMutation::delete(resource, key))
            }
        }
    }

    /// Apply a mutation locally, then remotely or via the queue.
    ///
    /// The remote call is skipped in favour of the queue while an older
    /// change to the same record is still pending, so changes to one record
    /// always reach the backend in the order they were made. Writes to one
    /// resource are handled one at a time.
    ///
    /// An `Err` means the change was not recorded at all: if the cache patch
    /// fails (storage full even after eviction), nothing is queued or sent.
    pub async fn submit(&self, mutation: NewMutation) -> Result<WriteOutcome> {
        mutation.validate()?;
        let held = self.manager.lock_resource(&mutation.resource).await;
        self.manager.patch_cache(&held, &mutation).await?;

        let queue = self.manager.queue();
        if !self.manager.monitor().is_reachable() || self.has_pending_for_record(&mutation).await {
            let id = queue.enqueue(mutation).await?;
            return Ok(WriteOutcome::Queued(id));
        }

        let backend: &dyn RemoteBackend = self.manager.remote().as_ref();
        let sent = remote::send_change(
            backend,
            mutation.kind,
            &mutation.resource,
            mutation.key.as_deref(),
            &mutation.payload,
        )
        .await;

        match sent {
            Ok(()) => {
                tracing::debug!(
                    kind = %mutation.kind,
                    resource = %mutation.resource,
                    key = ?mutation.key,
                    "Write applied"
                );
                Ok(WriteOutcome::Applied)
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(resource = %mutation.resource, error = %e, "Write deferred");
                let id = queue.enqueue(mutation).await?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(e) => {
                let reason = e.to_string();
                let id = queue.park(mutation, &reason).await?;
                Ok(WriteOutcome::Rejected { id, reason })
            }
        }
    }

    async fn has_pending_for_record(&self, mutation: &NewMutation) -> bool {
        let Some(key) = mutation.key.as_deref() else {
            return false;
        };
        self.manager
            .queue()
            .pending_for(&mutation.resource)
            .await
            .iter()
            .any(|pending| pending.key.as_deref() == Some(key))
    }

    /// Number of mutations waiting for the backend.
    pub async fn pending_count(&self) -> usize {
        self.manager.queue().count().await
    }

    /// Drain the queue now.
    pub async fn trigger_sync(&self) -> SyncOutcome {
        self.manager.drain().await
    }

    pub fn sync_state(&self) -> SyncState {
        self.manager.state()
    }

    /// Drop every cached collection, pending mutation and dead letter.
    ///
    /// The session entry survives.
    pub async fn clear_local_data(&self) -> Result<()> {
        self.manager.queue().clear().await?;
        self.manager
            .store()
            .clear_where(|key| *key != StoreKey::Session)
            .await?;
        tracing::info!("Local data cleared");
        Ok(())
    }
}
