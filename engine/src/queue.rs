//! Pending mutation queue - durable, ordered, at-least-once.
//!
//! The queue lives in the durable store under [`StoreKey::PendingQueue`] as
//! an array of [`PendingMutation`]s, oldest first. Mutations that the backend
//! keeps rejecting are moved to a sidecar list under
//! [`StoreKey::DeadLetters`] so they cannot wedge the queue.
//!
//! Entries are never merged: two updates to the same record are both kept
//! and replayed in order, which is how the last write wins at the backend.

use crate::{
    store::{DurableStore, StoreKey},
    DeadLetter, MutationId, NewMutation, PendingMutation, Result,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Durable queue of mutations not yet confirmed by the backend.
#[derive(Debug)]
pub struct MutationQueue {
    store: Arc<DurableStore>,
    /// Serializes read-modify-write cycles on the persisted lists
    lock: Mutex<()>,
}

impl MutationQueue {
    /// Open the queue persisted in `store`.
    ///
    /// Advances the store's clock past the newest persisted stamp so entries
    /// enqueued by this process always sort after those of earlier ones.
    pub async fn open(store: Arc<DurableStore>) -> Self {
        let queue = Self {
            store,
            lock: Mutex::new(()),
        };

        let entries = queue.snapshot().await;
        if let Some(newest) = entries.iter().map(|m| m.enqueued_at).max() {
            queue.store.clock().observe(newest);
        }
        if !entries.is_empty() {
            tracing::info!(pending = entries.len(), "Loaded pending mutations");
        }

        queue
    }

    /// The persisted entries, or an error if the medium could not be read.
    ///
    /// Every read-modify-write goes through here: writing back an empty list
    /// after a failed read would wipe the queue.
    async fn load(&self) -> Result<Vec<PendingMutation>> {
        Ok(self
            .store
            .try_get(&StoreKey::PendingQueue)
            .await?
            .unwrap_or_default())
    }

    /// Read-only view; an unreadable medium shows as empty.
    async fn snapshot(&self) -> Vec<PendingMutation> {
        self.load().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read pending mutations");
            Vec::new()
        })
    }

    async fn save(&self, entries: &[PendingMutation]) -> Result<()> {
        self.store.set(&StoreKey::PendingQueue, entries).await
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self
            .store
            .try_get(&StoreKey::DeadLetters)
            .await?
            .unwrap_or_default())
    }

    async fn save_dead_letters(&self, letters: &[DeadLetter]) -> Result<()> {
        self.store.set(&StoreKey::DeadLetters, letters).await
    }

    /// Append a mutation. Assigns its id and `enqueuedAt` stamp.
    pub async fn enqueue(&self, new: NewMutation) -> Result<MutationId> {
        new.validate()?;

        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let id = Uuid::new_v4().to_string();
        let mutation = PendingMutation::from_new(new, id.clone(), self.store.clock().tick());
        tracing::debug!(
            id = %id,
            kind = %mutation.kind,
            resource = %mutation.resource,
            key = ?mutation.key,
            "Enqueued mutation"
        );
        entries.push(mutation);

        self.save(&entries).await?;
        Ok(id)
    }

    /// Remove one entry after the backend confirmed it.
    ///
    /// Returns whether an entry was removed.
    pub async fn dequeue_by_id(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let before = entries.len();
        entries.retain(|m| m.id != id);
        if entries.len() == before {
            return Ok(false);
        }

        self.save(&entries).await?;
        Ok(true)
    }

    /// All entries, oldest first.
    pub async fn list(&self) -> Vec<PendingMutation> {
        let mut entries = self.snapshot().await;
        // Stable: equal stamps keep insertion order.
        entries.sort_by_key(|m| m.enqueued_at);
        entries
    }

    /// Number of pending entries.
    pub async fn count(&self) -> usize {
        self.snapshot().await.len()
    }

    /// Pending entries targeting `resource`, oldest first.
    pub async fn pending_for(&self, resource: &str) -> Vec<PendingMutation> {
        self.list()
            .await
            .into_iter()
            .filter(|m| m.resource == resource)
            .collect()
    }

    /// Like [`pending_for`](Self::pending_for), failing if the medium could
    /// not be read.
    pub async fn try_pending_for(&self, resource: &str) -> Result<Vec<PendingMutation>> {
        let mut entries = self.load().await?;
        entries.retain(|m| m.resource == resource);
        entries.sort_by_key(|m| m.enqueued_at);
        Ok(entries)
    }

    /// Count a backend rejection against an entry.
    ///
    /// Returns the updated attempt count, or `None` if the entry is gone.
    pub async fn record_rejection(&self, id: &str, reason: &str) -> Result<Option<u32>> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let Some(entry) = entries.iter_mut().find(|m| m.id == id) else {
            return Ok(None);
        };
        entry.attempts += 1;
        entry.last_error = Some(reason.to_string());
        let attempts = entry.attempts;

        self.save(&entries).await?;
        Ok(Some(attempts))
    }

    /// Move an entry from the queue to the dead letters.
    ///
    /// Returns whether the entry was found.
    pub async fn dead_letter(&self, id: &str, reason: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let Some(index) = entries.iter().position(|m| m.id == id) else {
            return Ok(false);
        };
        let mutation = entries.remove(index);

        // Park first: a crash between the two writes must not lose the entry.
        self.push_dead_letter(mutation, reason).await?;
        self.save(&entries).await?;
        Ok(true)
    }

    /// Park a mutation that never entered the queue (rejected on first try).
    pub async fn park(&self, new: NewMutation, reason: &str) -> Result<MutationId> {
        let _guard = self.lock.lock().await;
        let id = Uuid::new_v4().to_string();
        let mut mutation = PendingMutation::from_new(new, id.clone(), self.store.clock().tick());
        mutation.attempts = 1;
        mutation.last_error = Some(reason.to_string());
        self.push_dead_letter(mutation, reason).await?;
        Ok(id)
    }

    async fn push_dead_letter(&self, mutation: PendingMutation, reason: &str) -> Result<()> {
        tracing::warn!(
            id = %mutation.id,
            kind = %mutation.kind,
            resource = %mutation.resource,
            reason,
            "Mutation moved to dead letters"
        );
        let mut letters = self.load_dead_letters().await?;
        letters.push(DeadLetter {
            mutation,
            reason: reason.to_string(),
            parked_at: self.store.clock().tick(),
        });
        self.save_dead_letters(&letters).await
    }

    /// Mutations parked after repeated rejections, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.load_dead_letters().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read dead letters");
            Vec::new()
        })
    }

    /// Put a dead letter back at the tail of the queue with a clean slate.
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut letters = self.load_dead_letters().await?;

        let Some(index) = letters.iter().position(|l| l.mutation.id == id) else {
            return Ok(false);
        };
        let mut mutation = letters.remove(index).mutation;
        mutation.enqueued_at = self.store.clock().tick();
        mutation.attempts = 0;
        mutation.last_error = None;

        let mut entries = self.load().await?;
        entries.push(mutation);
        self.save(&entries).await?;
        self.save_dead_letters(&letters).await?;

        tracing::info!(id, "Dead letter requeued");
        Ok(true)
    }

    /// Drop a dead letter for good.
    pub async fn discard_dead_letter(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut letters = self.load_dead_letters().await?;

        let before = letters.len();
        letters.retain(|l| l.mutation.id != id);
        if letters.len() == before {
            return Ok(false);
        }
        self.save_dead_letters(&letters).await?;
        Ok(true)
    }

    /// Drop every pending entry and dead letter.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.remove(&StoreKey::PendingQueue).await?;
        self.store.remove(&StoreKey::DeadLetters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMedium;
    use crate::{Error, MutationKind, SyncConfig};
    use serde_json::json;

    fn store_on(medium: &MemoryMedium) -> Arc<DurableStore> {
        Arc::new(DurableStore::new(
            Arc::new(medium.clone()),
            &SyncConfig::default(),
        ))
    }

    async fn new_queue() -> MutationQueue {
        MutationQueue::open(store_on(&MemoryMedium::new())).await
    }

    fn update(key: &str, qty: u32) -> NewMutation {
        NewMutation::update("items", key, json!({"qty": qty}))
    }

    #[tokio::test]
    async fn enqueue_assigns_unique_ids() {
        let queue = new_queue().await;
        let a = queue.enqueue(update("1", 1)).await.unwrap();
        let b = queue.enqueue(update("1", 1)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(queue.count().await, 2);
    }

    #[tokio::test]
    async fn list_is_oldest_first() {
        let queue = new_queue().await;
        let ids: Vec<_> = {
            let mut ids = Vec::new();
            for qty in 0..5 {
                ids.push(queue.enqueue(update("1", qty)).await.unwrap());
            }
            ids
        };

        let listed: Vec<_> = queue.list().await.into_iter().map(|m| m.id).collect();
        assert_eq!(listed, ids);

        let stamps: Vec<_> = queue.list().await.iter().map(|m| m.enqueued_at).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn duplicates_are_preserved() {
        let queue = new_queue().await;
        queue.enqueue(update("1", 3)).await.unwrap();
        queue.enqueue(update("1", 3)).await.unwrap();

        let listed = queue.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].payload, listed[1].payload);
    }

    #[tokio::test]
    async fn dequeue_keeps_relative_order() {
        let queue = new_queue().await;
        let a = queue.enqueue(update("a", 1)).await.unwrap();
        let b = queue.enqueue(update("b", 1)).await.unwrap();
        let c = queue.enqueue(update("c", 1)).await.unwrap();

        assert!(queue.dequeue_by_id(&b).await.unwrap());
        assert!(!queue.dequeue_by_id(&b).await.unwrap());

        let listed: Vec<_> = queue.list().await.into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec![a, c]);
    }

    #[tokio::test]
    async fn invalid_mutation_is_refused() {
        let queue = new_queue().await;
        let mut bad = update("1", 1);
        bad.key = None;
        assert!(queue.enqueue(bad).await.is_err());
        assert_eq!(queue.count().await, 0);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let medium = MemoryMedium::new();
        let id = {
            let queue = MutationQueue::open(store_on(&medium)).await;
            queue.enqueue(update("1", 9)).await.unwrap()
        };

        let queue = MutationQueue::open(store_on(&medium)).await;
        let listed = queue.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].kind, MutationKind::Update);
    }

    #[tokio::test]
    async fn reopen_orders_after_persisted_stamps() {
        let medium = MemoryMedium::new();
        let far_future = 32_503_680_000_000; // year 3000
        {
            let store = store_on(&medium);
            let seeded = vec![PendingMutation::from_new(update("1", 1), "old", far_future)];
            store.set(&StoreKey::PendingQueue, &seeded).await.unwrap();
        }

        let queue = MutationQueue::open(store_on(&medium)).await;
        let new_id = queue.enqueue(update("1", 2)).await.unwrap();

        let listed: Vec<_> = queue.list().await.into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec!["old".to_string(), new_id]);
    }

    #[tokio::test]
    async fn concurrent_enqueues_are_all_kept() {
        let queue = Arc::new(new_queue().await);
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.enqueue(update(&i.to_string(), i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(queue.count().await, 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueue_and_dequeue_lose_nothing() {
        let queue = Arc::new(new_queue().await);
        let mut doomed = Vec::new();
        for i in 0..16 {
            doomed.push(queue.enqueue(update(&format!("old-{i}"), i)).await.unwrap());
        }

        let mut handles = Vec::new();
        for (i, id) in doomed.into_iter().enumerate() {
            let remover = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                assert!(remover.dequeue_by_id(&id).await.unwrap());
            }));
            let adder = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                adder.enqueue(update(&format!("new-{i}"), 1)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let listed = queue.list().await;
        assert_eq!(listed.len(), 16);
        assert!(listed
            .iter()
            .all(|m| m.key.as_deref().is_some_and(|k| k.starts_with("new-"))));
    }

    #[tokio::test]
    async fn unreadable_queue_is_not_overwritten() {
        let medium = MemoryMedium::new();
        let queue = MutationQueue::open(store_on(&medium)).await;
        let a = queue.enqueue(update("a", 1)).await.unwrap();
        queue.enqueue(update("b", 1)).await.unwrap();

        medium.fail_next_reads(1);
        let err = queue.enqueue(update("c", 1)).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(queue.count().await, 2);

        medium.fail_next_reads(1);
        assert!(queue.dequeue_by_id(&a).await.is_err());
        medium.fail_next_reads(1);
        assert!(queue.record_rejection(&a, "bad").await.is_err());
        medium.fail_next_reads(1);
        assert!(queue.dead_letter(&a, "bad").await.is_err());

        let listed = queue.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a);
        assert_eq!(listed[0].attempts, 0);

        queue.enqueue(update("c", 1)).await.unwrap();
        assert_eq!(queue.count().await, 3);
    }

    #[tokio::test]
    async fn unreadable_dead_letters_are_not_overwritten() {
        let medium = MemoryMedium::new();
        let queue = MutationQueue::open(store_on(&medium)).await;
        let parked = queue.park(update("a", 1), "refused").await.unwrap();
        let id = queue.enqueue(update("b", 1)).await.unwrap();

        assert!(queue.record_rejection(&id, "refused").await.is_ok());
        medium.fail_next_reads(1);
        assert!(queue.park(update("c", 1), "refused").await.is_err());
        medium.fail_next_reads(1);
        assert!(queue.requeue_dead_letter(&parked).await.is_err());

        let letters = queue.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].mutation.id, parked);
        assert_eq!(queue.count().await, 1);
    }

    #[tokio::test]
    async fn rejections_accumulate() {
        let queue = new_queue().await;
        let id = queue.enqueue(update("1", 1)).await.unwrap();

        assert_eq!(queue.record_rejection(&id, "qty invalid").await.unwrap(), Some(1));
        assert_eq!(queue.record_rejection(&id, "still invalid").await.unwrap(), Some(2));
        assert_eq!(queue.record_rejection("missing", "x").await.unwrap(), None);

        let entry = &queue.list().await[0];
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_error.as_deref(), Some("still invalid"));
    }

    #[tokio::test]
    async fn dead_letter_round_trip() {
        let queue = new_queue().await;
        let keep = queue.enqueue(update("1", 1)).await.unwrap();
        let bad = queue.enqueue(update("2", 1)).await.unwrap();

        assert!(queue.dead_letter(&bad, "validation failed").await.unwrap());
        assert_eq!(queue.count().await, 1);

        let letters = queue.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].mutation.id, bad);
        assert_eq!(letters[0].reason, "validation failed");

        assert!(queue.requeue_dead_letter(&bad).await.unwrap());
        assert!(queue.dead_letters().await.is_empty());

        let listed = queue.list().await;
        assert_eq!(listed[0].id, keep);
        assert_eq!(listed[1].id, bad);
        assert_eq!(listed[1].attempts, 0);
    }

    #[tokio::test]
    async fn park_and_discard() {
        let queue = new_queue().await;
        let id = queue
            .park(NewMutation::create("items", json!({"qty": -1})), "qty must be positive")
            .await
            .unwrap();

        assert_eq!(queue.count().await, 0);
        assert_eq!(queue.dead_letters().await[0].mutation.attempts, 1);

        assert!(queue.discard_dead_letter(&id).await.unwrap());
        assert!(!queue.discard_dead_letter(&id).await.unwrap());
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn pending_for_filters_by_resource() {
        let queue = new_queue().await;
        queue.enqueue(update("1", 1)).await.unwrap();
        queue
            .enqueue(NewMutation::delete("transfers", "t-1"))
            .await
            .unwrap();

        let items = queue.pending_for("items").await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resource, "items");
    }
}
