//! Durable store - persisted key/JSON-value map with quota management.
//!
//! Every value is wrapped in an envelope carrying a `lastModified` stamp:
//!
//! ```json
//! {"lastModified": 1706745600000, "data": <value>}
//! ```
//!
//! Reads are typed. A stored value that does not parse as the requested type
//! is treated as absent, never as an error. Writes that hit the medium's
//! capacity trigger one eviction pass over unprotected keys, oldest first,
//! and a single retry.

mod eviction;
mod file;
mod key;
mod medium;

pub use file::FileMedium;
pub use key::StoreKey;
pub use medium::{MediumError, MemoryMedium, StorageMedium};

use crate::{clock::MonotonicClock, config::SyncConfig, Error, Result, Timestamp};
use eviction::Candidate;
use medium::entry_size;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a, T: ?Sized> {
    last_modified: Timestamp,
    data: &'a T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    last_modified: Timestamp,
    data: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
    last_modified: Timestamp,
}

/// Best-effort storage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    /// Sum of key and value byte lengths in this store's namespace
    pub used_bytes: usize,
    /// Assumed ceiling (the real platform limit is generally not queryable)
    pub limit_bytes: usize,
}

impl StorageUsage {
    /// Fraction of the ceiling in use, `0.0..=1.0` (can exceed 1.0 if the
    /// assumed ceiling is lower than the medium's real one).
    pub fn ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }
}

/// The durable store shared by every component of the sync core.
pub struct DurableStore {
    medium: Arc<dyn StorageMedium>,
    namespace: String,
    limit_bytes: usize,
    clock: Arc<MonotonicClock>,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("namespace", &self.namespace)
            .field("limit_bytes", &self.limit_bytes)
            .finish_non_exhaustive()
    }
}

impl DurableStore {
    /// Create a store over `medium` using the namespace and limit from `config`.
    pub fn new(medium: Arc<dyn StorageMedium>, config: &SyncConfig) -> Self {
        Self::with_clock(medium, config, Arc::new(MonotonicClock::new()))
    }

    /// Create a store sharing an existing clock.
    pub fn with_clock(
        medium: Arc<dyn StorageMedium>,
        config: &SyncConfig,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        Self {
            medium,
            namespace: config.namespace.clone(),
            limit_bytes: config.storage_limit_bytes,
            clock,
        }
    }

    /// The namespace every key is rendered under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The clock used to stamp stored values.
    pub fn clock(&self) -> &Arc<MonotonicClock> {
        &self.clock
    }

    /// Read and deserialize the value under `key`.
    ///
    /// Returns `None` if the key is absent, unreadable or does not parse as
    /// `T`. The last two cases are logged.
    pub async fn get<T: DeserializeOwned>(&self, key: &StoreKey) -> Option<T> {
        self.get_entry(key).await.map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), also returning the `lastModified` stamp.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &StoreKey) -> Option<(T, Timestamp)> {
        match self.read_entry(key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key.render(&self.namespace), error = %e, "Failed to read stored value");
                None
            }
        }
    }

    /// Read `key`, telling an absent value apart from an unreadable medium.
    ///
    /// A medium failure is an error. Malformed content is still treated as
    /// absent. Callers that write back what they read use this so a failed
    /// read never turns into an overwrite.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &StoreKey) -> Result<Option<T>> {
        Ok(self.read_entry(key).await?.map(|(value, _)| value))
    }

    async fn read_entry<T: DeserializeOwned>(
        &self,
        key: &StoreKey,
    ) -> std::result::Result<Option<(T, Timestamp)>, MediumError> {
        let raw_key = key.render(&self.namespace);
        let Some(raw) = self.medium.read(&raw_key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Envelope<T>>(&raw) {
            Ok(envelope) => Ok(Some((envelope.data, envelope.last_modified))),
            Err(e) => {
                tracing::warn!(key = %raw_key, error = %e, "Ignoring malformed stored value");
                Ok(None)
            }
        }
    }

    /// Serialize and persist `value` under `key`.
    ///
    /// On quota pressure, evicts unprotected entries (oldest first) and
    /// retries once. If the retry fails the write is dropped, the previous
    /// value stays in place and [`Error::QuotaExceeded`] is returned.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &StoreKey, value: &T) -> Result<()> {
        let raw_key = key.render(&self.namespace);
        let body = serde_json::to_string(&EnvelopeRef {
            last_modified: self.clock.tick(),
            data: value,
        })?;

        match self.medium.write(&raw_key, &body).await {
            Ok(()) => Ok(()),
            Err(MediumError::QuotaExceeded { needed, .. }) => {
                tracing::warn!(key = %raw_key, needed, "Storage quota exceeded, evicting");
                let freed = self.evict_for(&raw_key, needed).await?;

                self.medium.write(&raw_key, &body).await.map_err(|e| {
                    tracing::error!(
                        key = %raw_key,
                        needed,
                        freed,
                        error = %e,
                        "Write dropped after eviction"
                    );
                    Error::from(e)
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `key`. Removing a missing key is not an error.
    pub async fn remove(&self, key: &StoreKey) -> Result<()> {
        self.medium.delete(&key.render(&self.namespace)).await?;
        Ok(())
    }

    /// Whether a value is stored under `key` (parseable or not).
    pub async fn contains(&self, key: &StoreKey) -> bool {
        matches!(
            self.medium.read(&key.render(&self.namespace)).await,
            Ok(Some(_))
        )
    }

    /// All keys in this store's namespace.
    pub async fn keys(&self) -> Result<Vec<StoreKey>> {
        let entries = self.medium.entries().await?;
        Ok(entries
            .iter()
            .filter_map(|(raw, _)| StoreKey::parse(&self.namespace, raw))
            .collect())
    }

    /// Remove every key in this store's namespace.
    pub async fn clear(&self) -> Result<()> {
        self.clear_where(|_| true).await
    }

    /// Remove every key in this store's namespace matching `predicate`.
    pub async fn clear_where(&self, predicate: impl Fn(&StoreKey) -> bool) -> Result<()> {
        for key in self.keys().await? {
            if predicate(&key) {
                self.remove(&key).await?;
            }
        }
        Ok(())
    }

    /// Sum key and value byte lengths in this namespace.
    pub async fn estimate_usage(&self) -> Result<StorageUsage> {
        let entries = self.medium.entries().await?;
        let used_bytes = entries
            .iter()
            .filter(|(raw, _)| StoreKey::parse(&self.namespace, raw).is_some())
            .map(|(raw, value)| entry_size(raw, value))
            .sum();

        Ok(StorageUsage {
            used_bytes,
            limit_bytes: self.limit_bytes,
        })
    }

    /// Evict unprotected entries, oldest first, until `needed` bytes are
    /// freed or nothing evictable remains. Returns the bytes freed.
    async fn evict_for(&self, writing: &str, needed: usize) -> Result<usize> {
        let entries = self.medium.entries().await?;

        let candidates = entries
            .into_iter()
            .filter(|(raw, _)| raw != writing)
            .filter_map(|(raw, value)| {
                let key = StoreKey::parse(&self.namespace, &raw)?;
                if key.is_protected() {
                    return None;
                }
                // Unreadable entries rank as oldest.
                let last_modified = serde_json::from_str::<EnvelopeHeader>(&value)
                    .map(|h| h.last_modified)
                    .unwrap_or(0);
                Some(Candidate {
                    size: entry_size(&raw, &value),
                    key: raw,
                    last_modified,
                })
            })
            .collect();

        let mut freed = 0;
        for victim in eviction::plan(candidates, needed) {
            self.medium.delete(&victim.key).await?;
            freed += victim.size;
            tracing::info!(
                key = %victim.key,
                bytes = victim.size,
                last_modified = victim.last_modified,
                "Evicted stored value"
            );
        }

        if freed < needed {
            tracing::warn!(needed, freed, "Eviction could not free enough space");
        }
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    const NS: &str = "t";

    fn store_with_limit(limit: usize) -> (DurableStore, MemoryMedium) {
        let medium = MemoryMedium::with_limit(limit);
        let config = SyncConfig::default()
            .with_namespace(NS)
            .with_storage_limit(limit);
        (DurableStore::new(Arc::new(medium.clone()), &config), medium)
    }

    /// A string value whose stored entry is `key.len() + 40 + n` bytes
    /// (13-digit millisecond stamp in the envelope).
    fn blob(n: usize) -> Value {
        json!("x".repeat(n))
    }

    #[tokio::test]
    async fn set_then_get() {
        let (store, _) = store_with_limit(10_000);
        let key = StoreKey::collection("items");

        store.set(&key, &json!([{"id": "1"}])).await.unwrap();
        let value: Value = store.get(&key).await.unwrap();
        assert_eq!(value, json!([{"id": "1"}]));
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let (store, _) = store_with_limit(10_000);
        assert_eq!(store.get::<Value>(&StoreKey::Session).await, None);
    }

    #[tokio::test]
    async fn try_get_surfaces_read_failures() {
        let (store, medium) = store_with_limit(10_000);
        let key = StoreKey::PendingQueue;
        store.set(&key, &json!([1, 2])).await.unwrap();

        medium.fail_next_reads(1);
        assert!(matches!(
            store.try_get::<Value>(&key).await,
            Err(Error::Storage(_))
        ));
        assert_eq!(store.try_get::<Value>(&key).await.unwrap(), Some(json!([1, 2])));
        assert_eq!(store.try_get::<Value>(&StoreKey::Session).await.unwrap(), None);

        // The lenient read still degrades to absent.
        medium.fail_next_reads(1);
        assert_eq!(store.get::<Value>(&key).await, None);
    }

    #[tokio::test]
    async fn malformed_content_is_none() {
        let (store, medium) = store_with_limit(10_000);
        medium.insert_raw("t:collection:items", "{not json").await;
        assert_eq!(store.get::<Value>(&StoreKey::collection("items")).await, None);

        // Valid JSON but not an envelope.
        medium.insert_raw("t:collection:items", "[1, 2]").await;
        assert_eq!(store.get::<Value>(&StoreKey::collection("items")).await, None);
    }

    #[tokio::test]
    async fn type_mismatch_is_none() {
        let (store, _) = store_with_limit(10_000);
        let key = StoreKey::custom("count");
        store.set(&key, &json!("not a number")).await.unwrap();
        assert_eq!(store.get::<u32>(&key).await, None);
    }

    #[tokio::test]
    async fn get_entry_returns_increasing_stamps() {
        let (store, _) = store_with_limit(10_000);
        let a = StoreKey::custom("a");
        let b = StoreKey::custom("b");
        store.set(&a, &1).await.unwrap();
        store.set(&b, &2).await.unwrap();

        let (_, stamp_a) = store.get_entry::<u32>(&a).await.unwrap();
        let (_, stamp_b) = store.get_entry::<u32>(&b).await.unwrap();
        assert!(stamp_b > stamp_a);
    }

    #[tokio::test]
    async fn eviction_frees_oldest_unprotected() {
        let (store, _) = store_with_limit(400);
        store.set(&StoreKey::PendingQueue, &blob(100)).await.unwrap(); // 147
        store.set(&StoreKey::collection("a"), &blob(100)).await.unwrap(); // 154

        // 147 + 154 + 154 > 400: "a" has to go, the queue must stay.
        store.set(&StoreKey::collection("b"), &blob(100)).await.unwrap();

        assert!(store.get::<Value>(&StoreKey::PendingQueue).await.is_some());
        assert!(store.get::<Value>(&StoreKey::collection("a")).await.is_none());
        assert!(store.get::<Value>(&StoreKey::collection("b")).await.is_some());
    }

    #[tokio::test]
    async fn eviction_follows_last_modified_order() {
        let (store, _) = store_with_limit(500);
        for name in ["a", "b", "c"] {
            store.set(&StoreKey::collection(name), &blob(100)).await.unwrap();
        }

        store.set(&StoreKey::collection("d"), &blob(100)).await.unwrap();
        assert!(!store.contains(&StoreKey::collection("a")).await);

        // Touch "b" so "c" becomes the oldest.
        store.set(&StoreKey::collection("b"), &blob(100)).await.unwrap();
        store.set(&StoreKey::collection("e"), &blob(100)).await.unwrap();

        assert!(!store.contains(&StoreKey::collection("c")).await);
        assert!(store.contains(&StoreKey::collection("b")).await);
        assert!(store.contains(&StoreKey::collection("d")).await);
        assert!(store.contains(&StoreKey::collection("e")).await);
    }

    #[tokio::test]
    async fn protected_keys_are_never_evicted() {
        let (store, _) = store_with_limit(300);
        store.set(&StoreKey::PendingQueue, &blob(100)).await.unwrap(); // 147
        store.set(&StoreKey::Session, &blob(50)).await.unwrap(); // 99

        let err = store
            .set(&StoreKey::collection("a"), &blob(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        assert!(store.contains(&StoreKey::PendingQueue).await);
        assert!(store.contains(&StoreKey::Session).await);
    }

    #[tokio::test]
    async fn failed_rewrite_keeps_previous_value() {
        let (store, _) = store_with_limit(300);
        store.set(&StoreKey::PendingQueue, &blob(150)).await.unwrap(); // 197
        store.set(&StoreKey::collection("a"), &blob(10)).await.unwrap(); // 64

        let result = store.set(&StoreKey::collection("a"), &blob(100)).await;
        assert!(result.is_err());

        let kept: Value = store.get(&StoreKey::collection("a")).await.unwrap();
        assert_eq!(kept, blob(10));
    }

    #[tokio::test]
    async fn corrupt_entries_are_evicted_first() {
        let (store, medium) = store_with_limit(400);
        store.set(&StoreKey::collection("good"), &blob(100)).await.unwrap(); // 157
        medium.insert_raw("t:collection:bad", "x".repeat(130)).await; // 146

        store.set(&StoreKey::collection("new"), &blob(50)).await.unwrap(); // 106
        assert!(!store.contains(&StoreKey::collection("bad")).await);
        assert!(store.contains(&StoreKey::collection("good")).await);
    }

    #[tokio::test]
    async fn foreign_keys_are_not_touched() {
        let (store, medium) = store_with_limit(10_000);
        medium.insert_raw("other-app:data", "keep me").await;
        store.set(&StoreKey::collection("a"), &json!([])).await.unwrap();

        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
        assert_eq!(
            medium.read("other-app:data").await.unwrap(),
            Some("keep me".to_string())
        );
    }

    #[tokio::test]
    async fn clear_where_keeps_session() {
        let (store, _) = store_with_limit(10_000);
        store.set(&StoreKey::Session, &json!({"user": "u1"})).await.unwrap();
        store.set(&StoreKey::PendingQueue, &json!([])).await.unwrap();
        store.set(&StoreKey::collection("items"), &json!([])).await.unwrap();

        store
            .clear_where(|key| *key != StoreKey::Session)
            .await
            .unwrap();
        assert_eq!(store.keys().await.unwrap(), vec![StoreKey::Session]);
    }

    #[tokio::test]
    async fn usage_sums_key_and_value_lengths() {
        let (store, medium) = store_with_limit(1000);
        store.set(&StoreKey::collection("a"), &blob(10)).await.unwrap();
        medium.insert_raw("elsewhere", "ignored").await;

        let usage = store.estimate_usage().await.unwrap();
        assert_eq!(usage.used_bytes, "t:collection:a".len() + 40 + 10);
        assert_eq!(usage.limit_bytes, 1000);
        assert!(usage.ratio() > 0.0 && usage.ratio() < 1.0);
    }
}
