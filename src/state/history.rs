use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::health::Vitals;

/// Bounded sequence of records, newest first. Once `max` is exceeded the
/// oldest record is dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct History<T> {
    max: usize,
    entries: VecDeque<T>,
}

impl<T> History<T> {
    /// A history holding at most `max` records (at least one).
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            entries: VecDeque::with_capacity(max),
        }
    }

    pub fn push(&mut self, record: T) {
        self.entries.push_front(record);
        self.entries.truncate(self.max);
    }

    /// Change the bound, pruning immediately if it shrank.
    pub fn set_max(&mut self, max: usize) {
        self.max = max.max(1);
        self.entries.truncate(self.max);
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Records from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

/// Summary of one poll kept in a target's history.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub time: DateTime<Utc>,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub query_time_ms: u64,
    pub vitals: Vitals,
    /// Raw stats reported by the cache, by name.
    pub stats: BTreeMap<String, serde_json::Value>,
}

type Histories = DashMap<String, History<HistoryRecord>>;

/// Write side of the per-target history map. Owned by one pipeline.
pub struct HistoryWriter {
    map: Arc<Histories>,
}

/// Read side of the per-target history map.
#[derive(Clone)]
pub struct HistoryMap {
    map: Arc<Histories>,
}

impl HistoryWriter {
    pub fn new() -> (Self, HistoryMap) {
        let map = Arc::new(DashMap::new());
        (
            Self {
                map: Arc::clone(&map),
            },
            HistoryMap { map },
        )
    }

    /// Append a record for `id`, bounding its history at `max`.
    pub fn push(&self, id: &str, record: HistoryRecord, max: usize) {
        let mut entry = self
            .map
            .entry(id.to_string())
            .or_insert_with(|| History::new(max));
        if entry.max() != max.max(1) {
            entry.set_max(max);
        }
        entry.push(record);
    }

    /// Drop the histories of targets no longer configured.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.map.retain(|id, _| keep(id));
    }
}

impl HistoryMap {
    pub fn get(&self, id: &str) -> Option<History<HistoryRecord>> {
        self.map.get(id).map(|h| h.value().clone())
    }

    pub fn latest(&self, id: &str) -> Option<HistoryRecord> {
        self.map.get(id).and_then(|h| h.latest().cloned())
    }

    /// Copy of every history, ordered by target id.
    pub fn snapshot(&self) -> BTreeMap<String, History<HistoryRecord>> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seconds: i64) -> HistoryRecord {
        HistoryRecord {
            time: DateTime::from_timestamp(seconds, 0).unwrap_or_default(),
            available: true,
            error: None,
            query_time_ms: 5,
            vitals: Vitals::default(),
            stats: BTreeMap::new(),
        }
    }

    #[test]
    fn test_history_prunes_oldest_first() {
        let max = 4;
        let mut history = History::new(max);
        for i in 0..=max {
            history.push(i);
        }

        assert_eq!(history.len(), max);
        let values: Vec<_> = history.iter().copied().collect();
        assert_eq!(values, vec![4, 3, 2, 1]);
        assert_eq!(history.latest(), Some(&4));
    }

    #[test]
    fn test_history_never_exceeds_bound() {
        let mut history = History::new(3);
        for i in 0..100 {
            history.push(i);
            assert!(history.len() <= 3);
        }
    }

    #[test]
    fn test_history_zero_bound_keeps_one() {
        let mut history = History::new(0);
        history.push("a");
        history.push("b");
        assert_eq!(history.len(), 1);
        assert_eq!(history.latest(), Some(&"b"));
    }

    #[test]
    fn test_set_max_shrinks() {
        let mut history = History::new(5);
        for i in 0..5 {
            history.push(i);
        }
        history.set_max(2);
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![4, 3]);
    }

    #[test]
    fn test_history_map_push_and_retain() {
        let (writer, reader) = HistoryWriter::new();
        writer.push("edge-1", record(1), 2);
        writer.push("edge-1", record(2), 2);
        writer.push("edge-1", record(3), 2);
        writer.push("edge-2", record(1), 2);

        let history = reader.get("edge-1").expect("history should exist");
        assert_eq!(history.len(), 2);
        assert_eq!(reader.latest("edge-1").map(|r| r.time.timestamp()), Some(3));

        writer.retain(|id| id != "edge-2");
        assert_eq!(reader.len(), 1);
        assert!(reader.get("edge-2").is_none());
    }

    #[test]
    fn test_history_map_follows_bound_changes() {
        let (writer, reader) = HistoryWriter::new();
        for i in 0..5 {
            writer.push("edge-1", record(i), 5);
        }
        writer.push("edge-1", record(6), 2);
        assert_eq!(reader.get("edge-1").map(|h| h.len()), Some(2));
    }
}
