use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free scalar counter shared between one or more writers and readers.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one, returning the new value.
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Process-wide fetch and error totals reported by the stats summary.
#[derive(Clone, Debug, Default)]
pub struct Counters {
    /// Poll attempts started by any fetcher.
    pub fetches: Counter,
    /// Poll, vitals, and query errors.
    pub errors: Counter,
}
