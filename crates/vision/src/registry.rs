//! Set of connected viewers.
//!
//! Membership is guarded by a single `RwLock`; the broadcaster iterates over a
//! point-in-time [`ViewerRegistry::snapshot`] so viewers can join or leave
//! while a broadcast is in flight.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;

/// Process-unique viewer identity, allocated in connection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewerId(u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The viewer's outbound queue is full; it is not keeping up.
    #[error("viewer backlog full")]
    Backlogged,
    /// The viewer's connection is gone.
    #[error("viewer connection closed")]
    Closed,
}

/// Outbound side of one viewer connection.
///
/// `deliver` must not block: it either enqueues the payload or fails.
pub trait ViewerSink: Send + Sync {
    fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryError>;

    /// Ask the connection to shut down. Called once the viewer is pruned.
    fn close(&self);
}

#[derive(Default)]
pub struct ViewerRegistry {
    viewers: RwLock<BTreeMap<ViewerId, Arc<dyn ViewerSink>>>,
    next_id: AtomicU64,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sink: Arc<dyn ViewerSink>) -> ViewerId {
        let id = ViewerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut viewers = self.viewers.write().unwrap_or_else(PoisonError::into_inner);
            viewers.insert(id, sink);
            viewers.len()
        };
        metrics::gauge!("relay_viewers_connected").set(count as f64);
        tracing::info!(viewer = %id, viewers = count, "viewer registered");
        id
    }

    /// Remove a viewer. Returns `false` if it was already gone.
    pub fn remove(&self, id: ViewerId) -> bool {
        let (removed, count) = {
            let mut viewers = self.viewers.write().unwrap_or_else(PoisonError::into_inner);
            (viewers.remove(&id).is_some(), viewers.len())
        };
        if removed {
            metrics::gauge!("relay_viewers_connected").set(count as f64);
            tracing::info!(viewer = %id, viewers = count, "viewer unregistered");
        }
        removed
    }

    /// Point-in-time copy of the membership, in connection order.
    pub fn snapshot(&self) -> Vec<(ViewerId, Arc<dyn ViewerSink>)> {
        self.viewers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.viewers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ViewerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerRegistry")
            .field("viewers", &self.len())
            .finish()
    }
}
