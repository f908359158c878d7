use tokio::time::Instant;

use super::PollTarget;

/// A pending poller start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub target: PollTarget,
    pub next_fire: Instant,
}

/// Binary min-heap of schedule entries keyed by `next_fire`.
///
/// Every non-root entry fires no earlier than its parent, so the earliest
/// entry is always at index 0.
#[derive(Debug, Default)]
pub struct ScheduleHeap {
    entries: Vec<ScheduleEntry>,
}

impl ScheduleHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry. The new leaf starts out as an infinitely late
    /// placeholder and rises while the entry fires earlier than its parent.
    pub fn push(&mut self, entry: ScheduleEntry) {
        self.entries.push(entry);
        let mut child = self.entries.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if self.entries[child].next_fire >= self.entries[parent].next_fire {
                break;
            }
            self.entries.swap(child, parent);
            child = parent;
        }
    }

    pub fn peek_earliest(&self) -> Option<&ScheduleEntry> {
        self.entries.first()
    }

    /// Remove and return the earliest entry, or `None` when empty.
    pub fn pop_earliest(&mut self) -> Option<ScheduleEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let earliest = self.entries.pop();
        self.sift_down(0);
        earliest
    }

    /// Pop the earliest entry only if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<ScheduleEntry> {
        match self.peek_earliest() {
            Some(entry) if entry.next_fire <= now => self.pop_earliest(),
            _ => None,
        }
    }

    /// Remove every entry for target `id`. Returns how many were removed.
    pub fn remove(&mut self, id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.target.id != id);
        let removed = before - self.entries.len();
        if removed > 0 {
            for i in (0..self.entries.len() / 2).rev() {
                self.sift_down(i);
            }
        }
        removed
    }

    fn sift_down(&mut self, mut parent: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * parent + 1;
            let right = left + 1;
            let mut earliest = parent;

            if left < len && self.entries[left].next_fire < self.entries[earliest].next_fire {
                earliest = left;
            }
            if right < len && self.entries[right].next_fire < self.entries[earliest].next_fire {
                earliest = right;
            }
            if earliest == parent {
                return;
            }
            self.entries.swap(parent, earliest);
            parent = earliest;
        }
    }
}
