//! Connectivity monitor - best-effort view of whether the backend is reachable.
//!
//! The platform's network signal is a hint, not a guarantee (captive portals,
//! dead upstreams). The reconciliation engine treats each remote call's
//! result as the truth and only uses this monitor to decide *when* to try.
//!
//! State machine:
//!
//! ```text
//!   Unreachable --(online)--> Reachable      fires Transition::Reconnected
//!   Reachable  --(offline)--> Unreachable    fires Transition::Disconnected
//! ```
//!
//! Without any signal source the monitor stays in its initial state, which
//! defaults to `Reachable`.

use crate::remote::RemoteBackend;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const TRANSITION_CAPACITY: usize = 16;

/// Current belief about the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Reachable,
    Unreachable,
}

impl Reachability {
    pub fn from_bool(reachable: bool) -> Self {
        if reachable {
            Reachability::Reachable
        } else {
            Reachability::Unreachable
        }
    }

    pub fn is_reachable(self) -> bool {
        self == Reachability::Reachable
    }
}

/// A platform network-state event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// A change of [`Reachability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `Unreachable -> Reachable`: a drain is requested
    Reconnected,
    /// `Reachable -> Unreachable`: state update only
    Disconnected,
}

/// Holds the reachable/unreachable state and announces transitions.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<Reachability>>,
    transitions: broadcast::Sender<Transition>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Reachability::Reachable)
    }
}

impl ConnectivityMonitor {
    /// Create a monitor in `initial` state.
    pub fn new(initial: Reachability) -> Self {
        let (state, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            state: Arc::new(state),
            transitions,
        }
    }

    pub fn current(&self) -> Reachability {
        *self.state.borrow()
    }

    pub fn is_reachable(&self) -> bool {
        self.current().is_reachable()
    }

    /// Record the latest reachability. Returns the transition, if any.
    pub fn set_reachable(&self, reachable: bool) -> Option<Transition> {
        let next = Reachability::from_bool(reachable);
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if !changed {
            return None;
        }

        let transition = if reachable {
            tracing::info!("Backend reachable again");
            Transition::Reconnected
        } else {
            tracing::warn!("Backend unreachable, working offline");
            Transition::Disconnected
        };
        // No subscribers is fine.
        let _ = self.transitions.send(transition);
        Some(transition)
    }

    /// Feed a platform event into the monitor.
    pub fn apply(&self, event: ConnectivityEvent) -> Option<Transition> {
        self.set_reachable(event == ConnectivityEvent::Online)
    }

    /// Subscribe to transitions. Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        ConnectivitySubscription {
            transitions: self.transitions.subscribe(),
            state: self.state.subscribe(),
        }
    }

    /// Watch the raw state, e.g. for a status indicator.
    pub fn watch(&self) -> watch::Receiver<Reachability> {
        self.state.subscribe()
    }

    /// Forward a stream of platform events into the monitor.
    pub fn attach<S>(&self, events: S) -> SignalHandle
    where
        S: Stream<Item = ConnectivityEvent> + Send + 'static,
    {
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                monitor.apply(event);
            }
            tracing::debug!("Connectivity signal ended");
        });
        SignalHandle { task }
    }

    /// Probe `backend` every `interval` and feed the results in.
    pub fn spawn_probe(&self, backend: Arc<dyn RemoteBackend>, interval: Duration) -> SignalHandle {
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = backend.probe().await;
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "Backend probe failed");
                }
                monitor.set_reachable(result.is_ok());
            }
        });
        SignalHandle { task }
    }
}

/// A subscription to reachability transitions.
#[derive(Debug)]
pub struct ConnectivitySubscription {
    transitions: broadcast::Receiver<Transition>,
    state: watch::Receiver<Reachability>,
}

impl ConnectivitySubscription {
    /// Wait for the next transition. Returns `None` once the monitor is gone.
    ///
    /// If the subscriber fell behind and transitions were dropped, the
    /// current state is reported as a transition so a reconnect is never
    /// missed.
    pub async fn next_transition(&mut self) -> Option<Transition> {
        match self.transitions.recv().await {
            Ok(transition) => Some(transition),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Connectivity subscriber lagged");
                let current = *self.state.borrow_and_update();
                Some(if current.is_reachable() {
                    Transition::Reconnected
                } else {
                    Transition::Disconnected
                })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Current state as seen by this subscriber.
    pub fn current(&self) -> Reachability {
        *self.state.borrow()
    }

    /// Stop receiving transitions.
    pub fn unsubscribe(self) {}
}

/// Handle to a running signal source. Dropping it detaches the source.
#[derive(Debug)]
pub struct SignalHandle {
    task: JoinHandle<()>,
}

impl SignalHandle {
    /// Detach the signal source.
    pub fn stop(self) {}

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SignalHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
