//! Poll scheduling: the supervisor turns target-set changes into per-target
//! poller starts and stops.
//!
//! New targets are not started at once. They are pushed onto a
//! [`ScheduleHeap`] with start times spread across one interval, and the
//! supervisor starts each poller when its entry comes due. A target id is
//! either pending in the heap or running, never both, and removing a target
//! cancels its task and drops its pending entry.

pub mod heap;
mod task;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::fetch::Fetcher;
use crate::metrics::MonitorMetrics;
use crate::topology::{Topology, TopologyRx};

pub use heap::{ScheduleEntry, ScheduleHeap};
use task::PollerTask;

/// Which pipeline a poller feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollerKind {
    Health,
    Stat,
    Peer,
}

impl PollerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Stat => "stat",
            Self::Peer => "peer",
        }
    }

    /// The `{id -> url}` map this kind polls.
    pub fn targets(self, topology: &Topology) -> BTreeMap<String, String> {
        match self {
            Self::Health => topology.health_targets(),
            Self::Stat => topology.stat_targets(),
            Self::Peer => topology.peer_targets(),
        }
    }

    /// The interval the topology sets for this kind, if any.
    pub fn interval(self, topology: &Topology) -> Option<Duration> {
        match self {
            Self::Health => topology.polling.health,
            Self::Stat => topology.polling.stat,
            Self::Peer => topology.polling.peer,
        }
    }
}

impl fmt::Display for PollerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollTarget {
    pub id: String,
    pub url: String,
    pub interval: Duration,
}

/// A complete target configuration: every id with its url, and the shared
/// poll interval.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetSet {
    pub urls: BTreeMap<String, String>,
    pub interval: Duration,
}

/// Changes needed to move from one target set to another.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub deletions: Vec<String>,
    pub additions: Vec<PollTarget>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.additions.is_empty()
    }
}

/// Diff two target sets by id. A changed url is a delete plus an add; a
/// changed interval deletes and re-adds everything.
pub fn diff(old: &TargetSet, new: &TargetSet) -> ConfigDiff {
    let target = |(id, url): (&String, &String)| PollTarget {
        id: id.clone(),
        url: url.clone(),
        interval: new.interval,
    };

    if old.interval != new.interval {
        return ConfigDiff {
            deletions: old.urls.keys().cloned().collect(),
            additions: new.urls.iter().map(target).collect(),
        };
    }

    let mut out = ConfigDiff::default();
    for (id, url) in &old.urls {
        match new.urls.get(id) {
            None => out.deletions.push(id.clone()),
            Some(new_url) if new_url != url => {
                out.deletions.push(id.clone());
                out.additions.push(target((id, new_url)));
            }
            Some(_) => {}
        }
    }
    out.additions.extend(
        new.urls
            .iter()
            .filter(|(id, _)| !old.urls.contains_key(*id))
            .map(target),
    );
    out
}

/// Start offset of the `index`th of `count` new targets, spreading starts
/// evenly over one interval.
fn stagger(interval: Duration, index: usize, count: usize) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = interval.as_nanos() * index as u128 / count as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Owns the target set of one pipeline and its per-target poller tasks.
pub struct Supervisor<F: Fetcher> {
    kind: PollerKind,
    fetcher: Arc<F>,
    interval: Duration,
    drift_tolerance: Duration,
    current: TargetSet,
    running: HashMap<String, CancellationToken>,
    schedule: ScheduleHeap,
    metrics: Arc<MonitorMetrics>,
}

impl<F: Fetcher> Supervisor<F> {
    pub fn new(
        kind: PollerKind,
        fetcher: Arc<F>,
        interval: Duration,
        drift_tolerance: Duration,
        metrics: Arc<MonitorMetrics>,
    ) -> Self {
        Self {
            kind,
            fetcher,
            interval,
            drift_tolerance,
            current: TargetSet::default(),
            running: HashMap::new(),
            schedule: ScheduleHeap::new(),
            metrics,
        }
    }

    /// Number of poller tasks currently running.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Number of targets waiting for their scheduled start.
    pub fn pending(&self) -> usize {
        self.schedule.len()
    }

    /// Apply a new target set. Stops are signalled without waiting for the
    /// tasks to exit; additions are scheduled, not started.
    pub fn apply(&mut self, next: TargetSet, now: Instant) -> ConfigDiff {
        let changes = diff(&self.current, &next);

        for id in &changes.deletions {
            self.stop(id);
        }

        let count = changes.additions.len();
        for (index, target) in changes.additions.iter().enumerate() {
            self.schedule.push(ScheduleEntry {
                next_fire: now + stagger(target.interval, index, count),
                target: target.clone(),
            });
        }

        if !changes.is_empty() {
            info!(
                poller = self.kind.as_str(),
                added = changes.additions.len(),
                removed = changes.deletions.len(),
                targets = next.urls.len(),
                "poll targets updated",
            );
        }

        self.current = next;
        self.update_gauge();
        changes
    }

    /// Start every poller whose entry is due at `now`.
    pub fn start_due(&mut self, now: Instant, cancel: &CancellationToken) {
        while let Some(entry) = self.schedule.pop_due(now) {
            self.spawn(entry.target, cancel);
        }
        self.update_gauge();
    }

    fn spawn(&mut self, target: PollTarget, cancel: &CancellationToken) {
        let token = cancel.child_token();
        if let Some(stale) = self.running.insert(target.id.clone(), token.clone()) {
            stale.cancel();
        }
        debug!(poller = self.kind.as_str(), target_id = %target.id, "starting poller");

        let task = PollerTask {
            target,
            fetcher: Arc::clone(&self.fetcher),
            cancel: token,
            drift_tolerance: self.drift_tolerance,
            slow_polls: self
                .metrics
                .slow_polls
                .with_label_values(&[self.kind.as_str()]),
        };
        tokio::spawn(task.run());
    }

    fn stop(&mut self, id: &str) {
        if let Some(token) = self.running.remove(id) {
            token.cancel();
        }
        self.schedule.remove(id);
        debug!(poller = self.kind.as_str(), target_id = id, "stopping poller");
    }

    fn stop_all(&mut self) {
        for (_, token) in self.running.drain() {
            token.cancel();
        }
        self.schedule = ScheduleHeap::new();
        self.update_gauge();
    }

    fn update_gauge(&self) {
        self.metrics
            .active_pollers
            .with_label_values(&[self.kind.as_str()])
            .set(self.running.len() as f64);
    }

    fn target_set(&self, topology: &Topology) -> TargetSet {
        TargetSet {
            urls: self.kind.targets(topology),
            interval: self.kind.interval(topology).unwrap_or(self.interval),
        }
    }

    /// Follow topology updates until cancelled or the topology channel
    /// closes, then stop every poller.
    pub async fn run(mut self, mut topology: TopologyRx, cancel: CancellationToken) {
        let initial = topology.borrow_and_update().clone();
        if let Some(initial) = initial {
            let set = self.target_set(&initial);
            self.apply(set, Instant::now());
        }

        loop {
            let next_fire = self.schedule.peek_earliest().map(|e| e.next_fire);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = topology.changed() => {
                    if changed.is_err() {
                        debug!(poller = self.kind.as_str(), "topology channel closed");
                        break;
                    }
                    let latest = topology.borrow_and_update().clone();
                    if let Some(latest) = latest {
                        let set = self.target_set(&latest);
                        self.apply(set, Instant::now());
                    }
                }
                _ = wait_until(next_fire) => {
                    self.start_due(Instant::now(), &cancel);
                }
            }
        }

        self.stop_all();
        info!(poller = self.kind.as_str(), "poller supervisor stopped");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
