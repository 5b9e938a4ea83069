//! # Depot Engine
//!
//! The offline-first synchronization core of the Depot client.
//!
//! Every feature of the client reads and writes through this crate. Writes
//! land in a local cache immediately and are either applied remotely right
//! away or recorded as pending mutations. Pending mutations survive restarts
//! and are replayed, oldest first, when the backend becomes reachable again.
//!
//! ## Components
//!
//! - [`DurableStore`] - persisted key/JSON-value map over a [`StorageMedium`],
//!   with size accounting and eviction of the oldest unprotected entries when
//!   the medium runs out of room.
//! - [`MutationQueue`] - ordered, durable list of [`PendingMutation`]s with
//!   at-least-once delivery and a dead-letter sidecar.
//! - [`ConnectivityMonitor`] - best-effort reachable/unreachable view of the
//!   backend, fed by a platform signal or by probing.
//! - [`ResourceAccessor`] - per-resource read/write surface: remote first when
//!   reachable, cache otherwise; writes are local first.
//! - [`SyncManager`] - drains the queue against a [`RemoteBackend`], one drain
//!   at a time.
//!
//! ## Quick Start
//!
//! ```rust
//! use depot_engine::{MemoryBackend, MemoryMedium, SyncConfig, SyncContext, WriteOutcome};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> depot_engine::Result<()> {
//! let backend = MemoryBackend::new();
//! let ctx = SyncContext::new(MemoryMedium::new(), backend.clone(), SyncConfig::default()).await?;
//! let items = ctx.accessor();
//!
//! // Offline: the write is cached and queued.
//! ctx.monitor().set_reachable(false);
//! let outcome = items.create("items", json!({"barcode": "123", "qty": 5})).await?;
//! assert!(matches!(outcome, WriteOutcome::Queued(_)));
//! assert_eq!(items.read("items").await.len(), 1);
//! assert_eq!(items.pending_count().await, 1);
//!
//! // Back online: a manual drain replays the queued insert.
//! ctx.monitor().set_reachable(true);
//! let report = items.trigger_sync().await;
//! assert_eq!(report.succeeded, 1);
//! assert_eq!(items.pending_count().await, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Consistency
//!
//! Mutations are delivered at least once and in enqueue order. There is no
//! cross-device conflict resolution: the last write to reach the backend wins.

pub mod accessor;
pub mod clock;
pub mod collection;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod error;
pub mod mutation;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod store;

// Re-export main types at crate root
pub use accessor::{ResourceAccessor, WriteOutcome};
pub use clock::MonotonicClock;
pub use collection::{record_key, CachedCollection};
pub use config::SyncConfig;
pub use connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivitySubscription, Reachability, SignalHandle,
    Transition,
};
pub use context::SyncContext;
pub use error::{Error, Result};
pub use mutation::{DeadLetter, MutationKind, NewMutation, PendingMutation};
pub use queue::MutationQueue;
pub use reconcile::{AutoSyncHandle, MutationFailure, SyncManager, SyncOutcome, SyncState};
#[cfg(feature = "http")]
pub use remote::HttpBackend;
pub use remote::{MemoryBackend, RemoteBackend, RemoteError};
pub use store::{
    DurableStore, FileMedium, MediumError, MemoryMedium, StorageMedium, StorageUsage, StoreKey,
};

/// Type aliases for clarity
pub type MutationId = String;
pub type ResourceName = String;
pub type RecordKey = String;
pub type Timestamp = u64;
