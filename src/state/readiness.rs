use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Unpolled {
    initialized: bool,
    unpolled: BTreeSet<String>,
    known: BTreeSet<String>,
}

/// Write side of the readiness gate, owned by one aggregation pipeline.
pub struct ReadinessWriter {
    inner: Arc<RwLock<Unpolled>>,
}

/// Read side of the readiness gate.
#[derive(Clone)]
pub struct Readiness {
    inner: Arc<RwLock<Unpolled>>,
}

impl ReadinessWriter {
    pub fn new() -> (Self, Readiness) {
        let inner = Arc::new(RwLock::new(Unpolled::default()));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            Readiness { inner },
        )
    }

    /// Apply the configured target set. Targets present before and after are
    /// untouched, new ones start unpolled, removed ones are forgotten.
    pub fn set_targets<I, S>(&self, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets: BTreeSet<String> = targets.into_iter().map(Into::into).collect();
        let mut state = self.inner.write();

        let added: Vec<String> = targets.difference(&state.known).cloned().collect();
        state.unpolled.retain(|id| targets.contains(id));
        state.unpolled.extend(added);
        state.known = targets;
        state.initialized = true;
    }

    /// Record a processed poll. The target counts as polled once a poll
    /// succeeds with an available result, or it reports nonzero bandwidth.
    pub fn record(&self, id: &str, succeeded: bool, bandwidth_nonzero: bool) {
        if !succeeded && !bandwidth_nonzero {
            return;
        }
        if !self.inner.read().unpolled.contains(id) {
            return;
        }
        self.inner.write().unpolled.remove(id);
    }

    pub fn reader(&self) -> Readiness {
        Readiness {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Readiness {
    /// True once every known target has been polled. Never true before the
    /// target set was first applied.
    pub fn is_ready(&self) -> bool {
        let state = self.inner.read();
        state.initialized && state.unpolled.is_empty()
    }

    pub fn unpolled(&self) -> Vec<String> {
        self.inner.read().unpolled.iter().cloned().collect()
    }

    pub fn unpolled_count(&self) -> usize {
        self.inner.read().unpolled.len()
    }
}
