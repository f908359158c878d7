//! Shared state containers.
//!
//! Every container has exactly one [`Writer`], held by the task that owns
//! the value, and any number of [`Shared`] readers. Readers receive an
//! `Arc<T>` snapshot; the writer replaces the whole value under the lock.
//! `Writer` is deliberately not `Clone`, so the single-writer rule is held
//! by ownership rather than by convention.

mod counter;
mod events;
mod history;
mod readiness;
mod types;

use std::sync::Arc;

use parking_lot::RwLock;

pub use counter::{Counter, Counters};
pub use events::{Event, EventLog};
pub use history::{History, HistoryMap, HistoryRecord, HistoryWriter};
pub use readiness::{Readiness, ReadinessWriter};
pub use types::{
    AvailabilityStatus, CacheState, CacheStatus, CrStates, DeliveryServiceState, DsGroupStat,
    DsStat, DsStats, PeerState, PeerStates, Tps,
};

/// Read handle to a shared container.
pub struct Shared<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Shared<T> {
    /// Current value. Callers that need to change it must copy first.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner.read())
    }
}

/// The sole write handle to a shared container.
pub struct Writer<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Writer<T> {
    /// Current value, as readers see it.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner.read())
    }

    /// Atomically replace the whole value.
    pub fn set(&self, value: T) {
        *self.inner.write() = Arc::new(value);
    }

    /// A new read handle for the same container.
    pub fn reader(&self) -> Shared<T> {
        Shared {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Create a container holding `initial`.
pub fn container<T>(initial: T) -> (Writer<T>, Shared<T>) {
    let inner = Arc::new(RwLock::new(Arc::new(initial)));
    (
        Writer {
            inner: Arc::clone(&inner),
        },
        Shared { inner },
    )
}
