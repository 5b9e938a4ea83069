//! Wiring of the sync core's components.

use crate::store::{DurableStore, StorageMedium};
use crate::{
    AutoSyncHandle, ConnectivityMonitor, MutationQueue, RemoteBackend, ResourceAccessor, Result,
    SyncConfig, SyncManager,
};
use std::sync::Arc;

/// One fully wired sync core.
///
/// Owns the store, queue, monitor and manager so that every feature of the
/// client shares them. Nothing runs in the background until
/// [`start`](Self::start) is called.
#[derive(Debug)]
pub struct SyncContext {
    store: Arc<DurableStore>,
    queue: Arc<MutationQueue>,
    monitor: ConnectivityMonitor,
    manager: Arc<SyncManager>,
}

impl SyncContext {
    /// Validate `config` and wire the components over `medium` and `backend`.
    pub async fn new(
        medium: impl StorageMedium + 'static,
        backend: impl RemoteBackend + 'static,
        config: SyncConfig,
    ) -> Result<Self> {
        Self::from_parts(Arc::new(medium), Arc::new(backend), config).await
    }

    /// Like [`new`](Self::new) for already shared components.
    pub async fn from_parts(
        medium: Arc<dyn StorageMedium>,
        backend: Arc<dyn RemoteBackend>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(DurableStore::new(medium, &config));
        let queue = Arc::new(MutationQueue::open(Arc::clone(&store)).await);
        let monitor = ConnectivityMonitor::default();
        let manager = Arc::new(SyncManager::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            backend,
            monitor.clone(),
            config,
        ));

        tracing::info!(
            namespace = store.namespace(),
            pending = queue.count().await,
            "Sync core ready"
        );

        Ok(Self {
            store,
            queue,
            monitor,
            manager,
        })
    }

    pub fn accessor(&self) -> ResourceAccessor {
        ResourceAccessor::new(Arc::clone(&self.manager))
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// Start automatic draining (and probing, if configured).
    pub fn start(&self) -> AutoSyncHandle {
        self.manager.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, MemoryBackend, MemoryMedium};
    use serde_json::json;

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let config = SyncConfig::default().with_namespace("");
        let err = SyncContext::new(MemoryMedium::new(), MemoryBackend::new(), config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn components_share_state() {
        let ctx = SyncContext::new(MemoryMedium::new(), MemoryBackend::new(), SyncConfig::default())
            .await
            .unwrap();
        ctx.monitor().set_reachable(false);
        assert!(!ctx.accessor().sync_state().reachable);

        ctx.accessor().create("items", json!({"id": "1"})).await.unwrap();
        assert_eq!(ctx.queue().count().await, 1);
        assert_eq!(ctx.manager().cached("items").await.len(), 1);
    }
}
