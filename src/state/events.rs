use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{container, Shared, Writer};

/// An availability change of one target.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub index: u64,
    pub time: DateTime<Utc>,
    pub name: String,
    /// Server type from the topology, e.g. "EDGE".
    #[serde(rename = "type")]
    pub server_type: String,
    pub available: bool,
    pub description: String,
}

/// Bounded event log, newest first. Oldest events are dropped silently once
/// the capacity is reached.
pub struct EventLog {
    writer: Writer<Vec<Event>>,
    capacity: usize,
    next_index: AtomicU64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (writer, _) = container(Vec::with_capacity(capacity));
        Self {
            writer,
            capacity,
            next_index: AtomicU64::new(0),
        }
    }

    /// Record a new event. The index and time are assigned here.
    pub fn add(&self, name: &str, server_type: &str, available: bool, description: String) {
        let event = Event {
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            time: Utc::now(),
            name: name.to_string(),
            server_type: server_type.to_string(),
            available,
            description,
        };

        let current = self.writer.get();
        let mut events = Vec::with_capacity(self.capacity);
        events.push(event);
        events.extend(current.iter().take(self.capacity.saturating_sub(1)).cloned());
        self.writer.set(events);
    }

    pub fn reader(&self) -> Shared<Vec<Event>> {
        self.writer.reader()
    }
}
