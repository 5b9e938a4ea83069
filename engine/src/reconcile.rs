//! Reconciliation between the local cache, the pending queue and the backend.
//!
//! # Drain algorithm
//!
//! 1. Skip if the backend is believed unreachable or a drain is running
//! 2. Snapshot the queue, oldest first
//! 3. Dispatch each mutation sequentially
//!    - success: dequeue it
//!    - transient failure: keep it for the next drain
//!    - rejection: count it; after `max_rejections` move it to dead letters
//! 4. Once a mutation for a record fails, later ones for the same record
//!    wait for the next drain so the backend never sees them out of order
//! 5. Re-fetch every resource that received a successful write
//!
//! Successes are only dequeued after the backend confirmed them. A crash
//! in between replays the mutation on the next drain (at-least-once).

use crate::connectivity::Transition;
use crate::remote::{self, RemoteBackend, RemoteError};
use crate::store::{DurableStore, StoreKey};
use crate::{
    CachedCollection, ConnectivityMonitor, MutationId, MutationQueue, PendingMutation,
    RecordKey, ResourceName, Result, SignalHandle, SyncConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Snapshot for a status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub reachable: bool,
    pub draining: bool,
}

/// A mutation that did not go through during a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationFailure {
    pub id: MutationId,
    pub resource: ResourceName,
    pub reason: String,
    /// Whether the mutation stays queued for another attempt
    pub transient: bool,
}

/// Result of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    /// Mutations confirmed by the backend and dequeued
    pub succeeded: usize,
    /// Mutations that failed in this pass (dead-lettered ones included)
    pub failed: usize,
    /// Mutations moved to dead letters in this pass
    pub dead_lettered: usize,
    /// The drain did not run (unreachable, or another drain was active)
    pub skipped: bool,
    pub failures: Vec<MutationFailure>,
}

impl SyncOutcome {
    /// Outcome of a drain that did not run.
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Ran and every mutation went through.
    pub fn is_clean(&self) -> bool {
        !self.skipped && self.failed == 0
    }

    fn fail(&mut self, mutation: &PendingMutation, reason: impl Into<String>, transient: bool) {
        self.failed += 1;
        self.failures.push(MutationFailure {
            id: mutation.id.clone(),
            resource: mutation.resource.clone(),
            reason: reason.into(),
            transient,
        });
    }
}

/// Clears the draining flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exclusive hold on one resource's cache and backend traffic.
///
/// Taken by local writes, by each drained mutation and by refreshes, so a
/// refresh never rebases over a change that is half recorded.
pub(crate) struct ResourceLock {
    _guard: OwnedMutexGuard<()>,
}

/// Drives pending mutations to the backend and keeps the cache current.
pub struct SyncManager {
    store: Arc<DurableStore>,
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteBackend>,
    monitor: ConnectivityMonitor,
    config: SyncConfig,
    draining: AtomicBool,
    last_outcome: watch::Sender<Option<SyncOutcome>>,
    resource_locks: Mutex<HashMap<ResourceName, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    pub fn new(
        store: Arc<DurableStore>,
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteBackend>,
        monitor: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        let (last_outcome, _) = watch::channel(None);
        Self {
            store,
            queue,
            remote,
            monitor,
            config,
            draining: AtomicBool::new(false),
            last_outcome,
            resource_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<dyn RemoteBackend> {
        &self.remote
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SyncState {
        SyncState {
            reachable: self.monitor.is_reachable(),
            draining: self.is_draining(),
        }
    }

    /// Wait for exclusive access to `resource`. Not reentrant.
    pub(crate) async fn lock_resource(&self, resource: &str) -> ResourceLock {
        let lock = {
            let mut locks = self.resource_locks.lock().await;
            Arc::clone(locks.entry(resource.to_string()).or_default())
        };
        ResourceLock {
            _guard: lock.lock_owned().await,
        }
    }

    /// Watch the outcome of the most recent drain that ran.
    pub fn outcomes(&self) -> watch::Receiver<Option<SyncOutcome>> {
        self.last_outcome.subscribe()
    }

    /// Replay pending mutations against the backend.
    ///
    /// At most one drain runs at a time; a concurrent call returns a skipped
    /// outcome without touching the queue.
    pub async fn drain(&self) -> SyncOutcome {
        if !self.monitor.is_reachable() {
            tracing::debug!("Skipping drain, backend unreachable");
            return SyncOutcome::skipped();
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Skipping drain, another drain is running");
            return SyncOutcome::skipped();
        }
        let _guard = DrainGuard(&self.draining);

        let (outcome, touched) = self.drain_pass().await;

        if self.config.refresh_after_drain {
            for resource in &touched {
                if let Err(e) = self.refresh(resource).await {
                    tracing::warn!(resource = %resource, error = %e, "Refresh after drain failed");
                }
            }
        }

        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            dead_lettered = outcome.dead_lettered,
            "Drain finished"
        );
        self.last_outcome.send_replace(Some(outcome.clone()));
        outcome
    }

    async fn drain_pass(&self) -> (SyncOutcome, BTreeSet<ResourceName>) {
        let mut outcome = SyncOutcome::default();
        let mut touched = BTreeSet::new();
        let mut blocked: HashSet<(ResourceName, RecordKey)> = HashSet::new();

        let entries = self.queue.list().await;
        if entries.is_empty() {
            return (outcome, touched);
        }
        tracing::info!(pending = entries.len(), "Draining pending mutations");

        for mutation in entries {
            let target = mutation
                .target()
                .map(|(resource, key)| (resource.to_string(), key.to_string()));

            if target.as_ref().is_some_and(|t| blocked.contains(t)) {
                outcome.fail(&mutation, "waiting on an earlier change to the same record", true);
                continue;
            }

            let _held = self.lock_resource(&mutation.resource).await;
            match remote::dispatch(self.remote.as_ref(), &mutation).await {
                Ok(()) => {
                    if let Err(e) = self.queue.dequeue_by_id(&mutation.id).await {
                        // Stays queued and is replayed next time.
                        tracing::error!(id = %mutation.id, error = %e, "Failed to dequeue applied mutation");
                    }
                    tracing::debug!(
                        id = %mutation.id,
                        kind = %mutation.kind,
                        resource = %mutation.resource,
                        "Mutation applied"
                    );
                    outcome.succeeded += 1;
                    touched.insert(mutation.resource.clone());
                }
                Err(err) => {
                    if let Some(target) = target {
                        blocked.insert(target);
                    }
                    self.handle_failure(&mutation, err, &mut outcome).await;
                }
            }
        }

        (outcome, touched)
    }

    async fn handle_failure(
        &self,
        mutation: &PendingMutation,
        err: RemoteError,
        outcome: &mut SyncOutcome,
    ) {
        let reason = err.to_string();
        if err.is_transient() {
            tracing::debug!(id = %mutation.id, error = %reason, "Mutation deferred");
            outcome.fail(mutation, reason, true);
            return;
        }

        tracing::warn!(id = %mutation.id, resource = %mutation.resource, error = %reason, "Mutation rejected");
        let attempts = match self.queue.record_rejection(&mutation.id, &reason).await {
            Ok(attempts) => attempts.unwrap_or(mutation.attempts + 1),
            Err(e) => {
                tracing::error!(id = %mutation.id, error = %e, "Failed to record rejection");
                mutation.attempts + 1
            }
        };

        if attempts >= self.config.max_rejections {
            match self.queue.dead_letter(&mutation.id, &reason).await {
                Ok(true) => {
                    outcome.dead_lettered += 1;
                    outcome.fail(mutation, reason, false);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(id = %mutation.id, error = %e, "Failed to dead-letter mutation");
                }
            }
        }
        outcome.fail(mutation, reason, false);
    }

    /// The cached copy of `resource`, empty if nothing is cached.
    pub async fn cached(&self, resource: &str) -> CachedCollection {
        self.store
            .get(&StoreKey::collection(resource))
            .await
            .unwrap_or_default()
    }

    /// Apply one local change to the cached copy of its resource.
    pub(crate) async fn patch_cache(
        &self,
        _held: &ResourceLock,
        mutation: &crate::NewMutation,
    ) -> Result<()> {
        let key = StoreKey::collection(mutation.resource.as_str());
        // An unreadable cache must not be replaced by a one-record copy.
        let mut collection: CachedCollection = self.store.try_get(&key).await?.unwrap_or_default();
        collection.apply_change(
            mutation.kind,
            mutation.key.as_deref(),
            &mutation.payload,
            &self.config.key_field,
        );
        self.store.set(&key, &collection).await
    }

    /// Fetch `resource` from the backend and replace the cached copy.
    ///
    /// Mutations still pending for the resource are re-applied on top so
    /// the cache keeps showing them. Holds the resource for the whole cycle,
    /// so writes to it wait until the refreshed copy is stored. A failure to
    /// persist the result is logged; the fetched records are returned either
    /// way.
    pub async fn refresh(&self, resource: &str) -> std::result::Result<Vec<Value>, RemoteError> {
        let _held = self.lock_resource(resource).await;
        let records = self.remote.fetch_all(resource).await?;

        let mut collection = CachedCollection::from_remote(records, self.store.clock().tick());
        let pending = match self.queue.try_pending_for(resource).await {
            Ok(pending) => pending,
            Err(e) => {
                // Caching without the pending changes would hide them.
                tracing::warn!(resource, error = %e, "Pending mutations unreadable, cache left as is");
                return Ok(collection.into_records());
            }
        };
        for mutation in &pending {
            collection.apply(mutation, &self.config.key_field);
        }

        if let Err(e) = self
            .store
            .set(&StoreKey::collection(resource), &collection)
            .await
        {
            tracing::warn!(resource, error = %e, "Failed to cache fetched records");
        }
        tracing::debug!(resource, records = collection.len(), "Collection refreshed");
        Ok(collection.into_records())
    }

    /// Start draining automatically.
    ///
    /// Drains once right away if anything is pending, then after every
    /// `Unreachable -> Reachable` transition. Probes the backend as well
    /// when `probe_interval_ms` is configured.
    pub fn start(self: &Arc<Self>) -> AutoSyncHandle {
        let mut subscription = self.monitor.subscribe();
        let manager = Arc::clone(self);

        let task = tokio::spawn(async move {
            if manager.queue.count().await > 0 {
                manager.drain().await;
            }
            while let Some(transition) = subscription.next_transition().await {
                if transition == Transition::Reconnected {
                    manager.drain().await;
                }
            }
        });

        let probe = self
            .config
            .probe_interval()
            .map(|interval| self.monitor.spawn_probe(Arc::clone(&self.remote), interval));

        AutoSyncHandle {
            task,
            _probe: probe,
        }
    }
}

/// Handle to the automatic drain task. Dropping it stops automatic syncing.
#[derive(Debug)]
pub struct AutoSyncHandle {
    task: JoinHandle<()>,
    _probe: Option<SignalHandle>,
}

impl AutoSyncHandle {
    pub fn stop(self) {}
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Call;
    use crate::store::MemoryMedium;
    use crate::{MemoryBackend, NewMutation};
    use serde_json::json;
    use std::time::Duration;

    async fn manager_with(backend: &MemoryBackend, config: SyncConfig) -> Arc<SyncManager> {
        manager_on(backend, MemoryMedium::new(), config).await
    }

    async fn manager_on(
        backend: &MemoryBackend,
        medium: MemoryMedium,
        config: SyncConfig,
    ) -> Arc<SyncManager> {
        let store = Arc::new(DurableStore::new(Arc::new(medium), &config));
        let queue = Arc::new(MutationQueue::open(Arc::clone(&store)).await);
        Arc::new(SyncManager::new(
            store,
            queue,
            Arc::new(backend.clone()),
            ConnectivityMonitor::default(),
            config,
        ))
    }

    async fn manager(backend: &MemoryBackend) -> Arc<SyncManager> {
        manager_with(backend, SyncConfig::default()).await
    }

    fn create(id: &str, qty: i64) -> NewMutation {
        NewMutation::create("items", json!({"id": id, "qty": qty})).with_key(id)
    }

    fn reject_negative_qty(call: &Call) -> Option<String> {
        match call {
            Call::Insert { payload, .. } | Call::Update { payload, .. }
                if payload["qty"].as_i64().is_some_and(|q| q < 0) =>
            {
                Some("qty must not be negative".into())
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn drain_applies_in_order_and_empties_queue() {
        let backend = MemoryBackend::new();
        let mgr = manager(&backend).await;
        mgr.queue().enqueue(create("1", 1)).await.unwrap();
        mgr.queue()
            .enqueue(NewMutation::update("items", "1", json!({"qty": 2})))
            .await
            .unwrap();
        mgr.queue().enqueue(create("2", 5)).await.unwrap();

        let outcome = mgr.drain().await;
        assert_eq!(outcome.succeeded, 3);
        assert!(outcome.is_clean());
        assert_eq!(mgr.queue().count().await, 0);

        let records = backend.records("items").await;
        assert_eq!(records, vec![json!({"id": "1", "qty": 2}), json!({"id": "2", "qty": 5})]);
    }

    #[tokio::test]
    async fn drain_skips_when_unreachable() {
        let backend = MemoryBackend::new();
        let mgr = manager(&backend).await;
        mgr.queue().enqueue(create("1", 1)).await.unwrap();
        mgr.monitor().set_reachable(false);

        let outcome = mgr.drain().await;
        assert!(outcome.skipped);
        assert_eq!(mgr.queue().count().await, 1);
        assert!(backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn only_one_drain_runs_at_a_time() {
        let backend = MemoryBackend::new();
        backend.set_latency(Duration::from_millis(20));
        let config = SyncConfig::default().with_refresh_after_drain(false);
        let mgr = manager_with(&backend, config).await;
        mgr.queue().enqueue(create("1", 1)).await.unwrap();

        let (a, b) = tokio::join!(mgr.drain(), mgr.drain());
        assert!(a.skipped != b.skipped);
        assert_eq!(a.succeeded + b.succeeded, 1);
        assert_eq!(backend.write_calls().await.len(), 1);
        assert!(!mgr.is_draining());
    }

    #[tokio::test]
    async fn partial_failure_keeps_rejected_mutation() {
        let backend = MemoryBackend::new();
        backend.reject_when(reject_negative_qty).await;
        let mgr = manager(&backend).await;
        mgr.queue().enqueue(create("a", 1)).await.unwrap();
        let b = mgr.queue().enqueue(create("b", -1)).await.unwrap();
        mgr.queue().enqueue(create("c", 1)).await.unwrap();

        let outcome = mgr.drain().await;
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.failures[0].id, b);
        assert!(!outcome.failures[0].transient);

        let remaining = mgr.queue().list().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b);
        assert_eq!(remaining[0].attempts, 1);
    }

    #[tokio::test]
    async fn transient_failures_leave_queue_untouched() {
        let backend = MemoryBackend::new();
        let mgr = manager(&backend).await;
        mgr.queue().enqueue(create("1", 1)).await.unwrap();
        // Monitor still believes the backend is reachable.
        backend.set_offline(true);

        let outcome = mgr.drain().await;
        assert_eq!(outcome.failed, 1);
        assert!(outcome.failures[0].transient);
        assert_eq!(mgr.queue().list().await[0].attempts, 0);
    }

    #[tokio::test]
    async fn repeated_rejections_dead_letter() {
        let backend = MemoryBackend::new();
        backend.reject_when(reject_negative_qty).await;
        let config = SyncConfig::default().with_max_rejections(2);
        let mgr = manager_with(&backend, config).await;
        let id = mgr.queue().enqueue(create("x", -5)).await.unwrap();

        let first = mgr.drain().await;
        assert_eq!(first.dead_lettered, 0);
        assert_eq!(mgr.queue().count().await, 1);

        let second = mgr.drain().await;
        assert_eq!(second.dead_lettered, 1);
        assert_eq!(mgr.queue().count().await, 0);
        assert_eq!(mgr.queue().dead_letters().await[0].mutation.id, id);
    }

    #[tokio::test]
    async fn failed_record_blocks_its_later_mutations() {
        let backend = MemoryBackend::new();
        backend.reject_when(reject_negative_qty).await;
        let mgr = manager(&backend).await;
        mgr.queue().enqueue(create("1", -1)).await.unwrap();
        mgr.queue()
            .enqueue(NewMutation::update("items", "1", json!({"qty": 3})))
            .await
            .unwrap();
        mgr.queue().enqueue(create("2", 1)).await.unwrap();

        let outcome = mgr.drain().await;
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 2);
        assert!(outcome.failures[1].transient);

        // The blocked update never reached the backend.
        let updates = backend
            .write_calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, Call::Update { .. }))
            .count();
        assert_eq!(updates, 0);
        assert_eq!(mgr.queue().count().await, 2);
    }

    #[tokio::test]
    async fn drain_refreshes_touched_collections() {
        let backend = MemoryBackend::new();
        backend.seed("items", vec![json!({"id": "srv", "qty": 9})]).await;
        let mgr = manager(&backend).await;
        mgr.queue().enqueue(create("1", 1)).await.unwrap();

        mgr.drain().await;

        let cached = mgr.cached("items").await;
        assert_eq!(cached.len(), 2);
        assert!(cached.fetched_at().is_some());
    }

    #[tokio::test]
    async fn refresh_rebases_pending_mutations() {
        let backend = MemoryBackend::new();
        backend.seed("items", vec![json!({"id": "1", "qty": 1})]).await;
        let mgr = manager(&backend).await;
        mgr.queue()
            .enqueue(NewMutation::update("items", "1", json!({"qty": 7})))
            .await
            .unwrap();

        let records = mgr.refresh("items").await.unwrap();
        assert_eq!(records, vec![json!({"id": "1", "qty": 7})]);
        assert_eq!(backend.records("items").await[0]["qty"], 1);
    }

    #[tokio::test]
    async fn refresh_keeps_cache_when_queue_is_unreadable() {
        let backend = MemoryBackend::new();
        backend.seed("items", vec![json!({"id": "1", "qty": 1})]).await;
        let medium = MemoryMedium::new();
        let mgr = manager_on(&backend, medium.clone(), SyncConfig::default()).await;
        mgr.queue()
            .enqueue(NewMutation::update("items", "1", json!({"qty": 7})))
            .await
            .unwrap();
        let key = StoreKey::collection("items");
        let optimistic = CachedCollection::from_remote(vec![json!({"id": "1", "qty": 7})], 1);
        mgr.store().set(&key, &optimistic).await.unwrap();

        medium.fail_next_reads(1);
        let records = mgr.refresh("items").await.unwrap();
        assert_eq!(records, vec![json!({"id": "1", "qty": 1})]);
        assert_eq!(mgr.cached("items").await.records()[0]["qty"], 7);
    }

    #[tokio::test]
    async fn outcome_is_published() {
        let backend = MemoryBackend::new();
        let mgr = manager(&backend).await;
        let outcomes = mgr.outcomes();
        mgr.queue().enqueue(create("1", 1)).await.unwrap();

        mgr.drain().await;
        let last = outcomes.borrow().clone().unwrap();
        assert_eq!(last.succeeded, 1);
    }

    #[tokio::test]
    async fn reconnect_triggers_drain() {
        let backend = MemoryBackend::new();
        let mgr = manager(&backend).await;
        let mut outcomes = mgr.outcomes();
        mgr.monitor().set_reachable(false);
        let _auto = mgr.start();

        mgr.queue().enqueue(create("1", 1)).await.unwrap();
        mgr.monitor().set_reachable(true);

        tokio::time::timeout(Duration::from_secs(5), outcomes.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mgr.queue().count().await, 0);
        assert_eq!(backend.records("items").await.len(), 1);
    }

    #[tokio::test]
    async fn start_drains_leftovers() {
        let backend = MemoryBackend::new();
        let mgr = manager(&backend).await;
        let mut outcomes = mgr.outcomes();
        mgr.queue().enqueue(create("1", 1)).await.unwrap();

        let _auto = mgr.start();
        tokio::time::timeout(Duration::from_secs(5), outcomes.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mgr.queue().count().await, 0);
    }

    #[test]
    fn outcome_serialization() {
        let json = serde_json::to_value(SyncOutcome::skipped()).unwrap();
        assert_eq!(json["skipped"], true);
        assert_eq!(json["deadLettered"], 0);
    }
}
