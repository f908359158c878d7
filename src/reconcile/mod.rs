//! Availability reconciliation.
//!
//! The reconciler is the only writer of the cache statuses, the local and
//! peer views, the combined view and the event log. Pipelines send it
//! [`StateUpdate`]s and it recomputes the combined view from scratch after
//! every one.

mod combine;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::health::{evaluate, EvalInput, Vitals};
use crate::metrics::MonitorMetrics;
use crate::state::{
    container, AvailabilityStatus, CacheStatus, CrStates, Event, EventLog, PeerState, PeerStates,
    Shared, Writer,
};
use crate::topology::{ServerStatus, Topology, TopologyRx};

pub use combine::{combine, combine_cache, intersection, local_states};

/// Poller name recorded for statuses that come from the topology rather
/// than from a poll.
const CONFIG_POLLER: &str = "config";

/// A change sent to the reconciler.
#[derive(Debug)]
pub enum StateUpdate {
    /// Fresh statuses for polled caches.
    Local(Vec<(String, CacheStatus)>),
    /// Fresh views from peer monitors.
    Peers(Vec<(String, PeerState)>),
    /// Answered once every update sent before it has been applied and
    /// published.
    Flush(oneshot::Sender<()>),
}

/// Read handles to everything the reconciler owns.
#[derive(Clone)]
pub struct ReconcilerReaders {
    pub statuses: Shared<BTreeMap<String, CacheStatus>>,
    pub local: Shared<CrStates>,
    pub peers: Shared<PeerStates>,
    pub combined: Shared<CrStates>,
    pub events: Shared<Vec<Event>>,
}

pub struct Reconciler {
    topology_rx: TopologyRx,
    topology: Option<Arc<Topology>>,
    updates: mpsc::Receiver<StateUpdate>,
    statuses: Writer<BTreeMap<String, CacheStatus>>,
    local: Writer<CrStates>,
    peers: Writer<PeerStates>,
    combined: Writer<CrStates>,
    events: EventLog,
    optimistic: bool,
    metrics: Arc<MonitorMetrics>,
}

impl Reconciler {
    pub fn new(
        topology_rx: TopologyRx,
        updates: mpsc::Receiver<StateUpdate>,
        max_events: usize,
        optimistic: bool,
        metrics: Arc<MonitorMetrics>,
    ) -> (Self, ReconcilerReaders) {
        let (statuses, statuses_rx) = container(BTreeMap::new());
        let (local, local_rx) = container(CrStates::default());
        let (peers, peers_rx) = container(PeerStates::new());
        let (combined, combined_rx) = container(CrStates::default());
        let events = EventLog::new(max_events);

        let readers = ReconcilerReaders {
            statuses: statuses_rx,
            local: local_rx,
            peers: peers_rx,
            combined: combined_rx,
            events: events.reader(),
        };

        let reconciler = Self {
            topology_rx,
            topology: None,
            updates,
            statuses,
            local,
            peers,
            combined,
            events,
            optimistic,
            metrics,
        };
        (reconciler, readers)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let initial = self.topology_rx.borrow_and_update().clone();
        if let Some(topology) = initial {
            self.apply_topology(topology);
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = self.topology_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = self.topology_rx.borrow_and_update().clone();
                    if let Some(topology) = next {
                        self.apply_topology(topology);
                    }
                }
                update = self.updates.recv() => match update {
                    Some(update) => self.apply(update),
                    None => break,
                },
            }
        }

        info!("reconciler stopped");
    }

    /// Apply one update and publish the recomputed views.
    pub fn apply(&mut self, update: StateUpdate) {
        let update = match update {
            StateUpdate::Flush(done) => {
                // The sender may have stopped waiting.
                let _ = done.send(());
                return;
            }
            other => other,
        };

        let Some(topology) = self.topology.clone() else {
            debug!("state update before topology load, ignoring");
            return;
        };

        match update {
            StateUpdate::Local(updates) => {
                let mut statuses = (*self.statuses.get()).clone();
                for (id, status) in updates {
                    // Results can race a topology change: the server may be
                    // gone or pinned to its administrative status by now.
                    let polled = topology
                        .servers
                        .get(&id)
                        .is_some_and(|s| s.status.is_polled());
                    if !polled {
                        continue;
                    }
                    self.record_status(&topology, &mut statuses, id, status);
                }
                self.statuses.set(statuses);
            }
            StateUpdate::Peers(updates) => {
                let mut peers = (*self.peers.get()).clone();
                for (id, state) in updates {
                    if topology.peers.contains_key(&id) {
                        peers.insert(id, state);
                    }
                }
                self.peers.set(peers);
            }
            StateUpdate::Flush(_) => return,
        }

        self.publish(&topology);
    }

    /// Adopt a new topology: drop state for removed servers and peers, and
    /// pin servers that are not polled to their administrative status.
    pub fn apply_topology(&mut self, topology: Arc<Topology>) {
        let mut statuses = (*self.statuses.get()).clone();
        statuses.retain(|id, _| topology.servers.contains_key(id));

        for (id, server) in &topology.servers {
            if server.status.is_polled() {
                continue;
            }
            let status = forced_status(server.status);
            self.record_status(&topology, &mut statuses, id.clone(), status);
        }
        self.statuses.set(statuses);

        let mut peers = (*self.peers.get()).clone();
        peers.retain(|id, _| topology.peers.contains_key(id));
        self.peers.set(peers);

        self.topology = Some(topology.clone());
        self.publish(&topology);
    }

    fn record_status(
        &self,
        topology: &Topology,
        statuses: &mut BTreeMap<String, CacheStatus>,
        id: String,
        status: CacheStatus,
    ) {
        // A cache with no status yet counts as unavailable.
        let was = statuses
            .get(&id)
            .is_some_and(|s| s.availability.available);
        let now = status.availability.available;

        if was != now {
            let server_type = topology
                .servers
                .get(&id)
                .map_or("", |s| s.server_type.as_str());
            self.events
                .add(&id, server_type, now, status.availability.reason.clone());
            self.metrics.availability_changes.inc();
            info!(
                cache = %id,
                available = now,
                reason = %status.availability.reason,
                "availability changed",
            );
        }

        statuses.insert(id, status);
    }

    fn publish(&self, topology: &Topology) {
        let statuses = self.statuses.get();
        let peers = self.peers.get();

        let local = local_states(topology, &statuses);
        let combined = combine(&local, &peers, self.optimistic);

        let up = combined.caches.values().filter(|c| c.is_available).count();
        self.metrics.caches_available.set(up as f64);
        self.metrics
            .peers_available
            .set(peers.values().filter(|p| p.available).count() as f64);

        self.local.set(local);
        self.combined.set(combined);
    }
}

fn forced_status(status: ServerStatus) -> CacheStatus {
    let vitals = Vitals::default();
    let stats = BTreeMap::new();
    let verdict = evaluate(
        &EvalInput {
            status,
            error: None,
            available: status == ServerStatus::Online,
            vitals: &vitals,
            stats: &stats,
        },
        &BTreeMap::new(),
    );

    CacheStatus {
        availability: AvailabilityStatus {
            available: verdict.available,
            status: status.to_string(),
            reason: verdict.reason,
            poller: CONFIG_POLLER.to_string(),
        },
        last_poll: Some(Utc::now()),
        ..CacheStatus::default()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::*;
    use crate::state::DeliveryServiceState;

    const TOPOLOGY: &str = r#"
servers:
  edge-1:
    url: http://edge-1/health
    status: REPORTED
    profile: EDGE
    cachegroup: east
    type: EDGE
    delivery_services: [video]
  edge-2:
    url: http://edge-2/health
    status: REPORTED
    profile: EDGE
    cachegroup: west
    type: EDGE
    delivery_services: [video]
  mid-1:
    url: http://mid-1/health
    status: OFFLINE
    profile: EDGE
    cachegroup: mid
    type: MID
profiles:
  EDGE: {}
peers:
  tm-2:
    url: http://tm-2/publish/CrStates
"#;

    fn status(available: bool) -> CacheStatus {
        CacheStatus {
            availability: AvailabilityStatus {
                available,
                status: "REPORTED".to_string(),
                reason: format!("REPORTED - {}", if available { "available" } else { "down" }),
                poller: "health".to_string(),
            },
            last_poll: Some(Utc::now()),
            ..CacheStatus::default()
        }
    }

    fn peer(available: bool, up: &[&str]) -> PeerState {
        PeerState {
            available,
            last_poll: Utc::now(),
            error: None,
            states: CrStates {
                caches: up
                    .iter()
                    .map(|id| (id.to_string(), crate::state::CacheState { is_available: true }))
                    .collect(),
                delivery_services: BTreeMap::from([(
                    "video".to_string(),
                    DeliveryServiceState {
                        is_available: true,
                        disabled_locations: vec!["west".to_string()],
                    },
                )]),
            },
        }
    }

    fn reconciler() -> (Reconciler, ReconcilerReaders, mpsc::Sender<StateUpdate>) {
        let topology = Arc::new(Topology::parse(TOPOLOGY).expect("valid topology"));
        let (_tx, rx) = watch::channel(Some(topology.clone()));
        let (updates_tx, updates_rx) = mpsc::channel(16);
        let metrics = Arc::new(MonitorMetrics::new().expect("metrics"));
        let (mut reconciler, readers) = Reconciler::new(rx, updates_rx, 10, true, metrics);
        reconciler.apply_topology(topology);
        (reconciler, readers, updates_tx)
    }

    #[test]
    fn test_unpolled_servers_are_pinned() {
        let (_reconciler, readers, _tx) = reconciler();
        let statuses = readers.statuses.get();
        let mid = &statuses["mid-1"];
        assert!(!mid.availability.available);
        assert_eq!(mid.availability.poller, CONFIG_POLLER);
        assert_eq!(mid.availability.reason, "OFFLINE - unavailable");

        // Starting out unavailable is not a change.
        assert!(readers.events.get().is_empty());
    }

    #[test]
    fn test_first_available_status_is_logged() {
        let (mut reconciler, readers, _tx) = reconciler();
        reconciler.apply(StateUpdate::Local(vec![
            ("edge-1".to_string(), status(true)),
            ("edge-2".to_string(), status(false)),
        ]));

        let events = readers.events.get();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "edge-1");
        assert_eq!(events[0].server_type, "EDGE");
        assert!(events[0].available);
    }

    #[test]
    fn test_flush_is_answered() {
        let (mut reconciler, _readers, _tx) = reconciler();
        let (done, mut applied) = oneshot::channel();
        reconciler.apply(StateUpdate::Flush(done));
        assert!(applied.try_recv().is_ok());
    }

    #[test]
    fn test_local_update_flips_and_logs() {
        let (mut reconciler, readers, _tx) = reconciler();
        reconciler.apply(StateUpdate::Local(vec![
            ("edge-1".to_string(), status(true)),
            ("edge-2".to_string(), status(false)),
            ("gone".to_string(), status(true)),
        ]));

        let combined = readers.combined.get();
        assert!(combined.is_cache_available("edge-1"));
        assert!(!combined.is_cache_available("edge-2"));
        assert!(!readers.statuses.get().contains_key("gone"));
        assert_eq!(
            readers.local.get().delivery_services["video"].disabled_locations,
            vec!["west".to_string()]
        );

        // Same availability again adds no event.
        let before = readers.events.get().len();
        reconciler.apply(StateUpdate::Local(vec![("edge-1".to_string(), status(true))]));
        assert_eq!(readers.events.get().len(), before);

        reconciler.apply(StateUpdate::Local(vec![("edge-1".to_string(), status(false))]));
        let events = readers.events.get();
        assert_eq!(events.len(), before + 1);
        assert_eq!(events[0].name, "edge-1");
        assert!(!events[0].available);
    }

    #[test]
    fn test_peer_vote_overrides_local_down() {
        let (mut reconciler, readers, _tx) = reconciler();
        reconciler.apply(StateUpdate::Local(vec![
            ("edge-1".to_string(), status(false)),
            ("edge-2".to_string(), status(false)),
        ]));
        assert!(!readers.combined.get().is_cache_available("edge-2"));

        reconciler.apply(StateUpdate::Peers(vec![
            ("tm-2".to_string(), peer(true, &["edge-2"])),
            ("unknown".to_string(), peer(true, &["edge-1"])),
        ]));

        let combined = readers.combined.get();
        assert!(combined.is_cache_available("edge-2"));
        assert!(!combined.is_cache_available("edge-1"));
        assert!(!readers.local.get().is_cache_available("edge-2"));
        assert_eq!(readers.peers.get().len(), 1);

        let video = &combined.delivery_services["video"];
        assert!(video.is_available);
        assert_eq!(video.disabled_locations, vec!["west".to_string()]);

        // An unreachable peer stops voting.
        reconciler.apply(StateUpdate::Peers(vec![(
            "tm-2".to_string(),
            peer(false, &["edge-2"]),
        )]));
        assert!(!readers.combined.get().is_cache_available("edge-2"));
    }

    #[test]
    fn test_late_result_for_pinned_server_is_ignored() {
        let (mut reconciler, readers, _tx) = reconciler();
        reconciler.apply(StateUpdate::Local(vec![("mid-1".to_string(), status(true))]));

        let statuses = readers.statuses.get();
        assert!(!statuses["mid-1"].availability.available);
        assert_eq!(statuses["mid-1"].availability.poller, CONFIG_POLLER);
    }

    #[tokio::test]
    async fn test_run_applies_updates_until_cancelled() {
        let topology = Arc::new(Topology::parse(TOPOLOGY).expect("valid topology"));
        let (_topology_tx, topology_rx) = watch::channel(Some(topology));
        let (tx, rx) = mpsc::channel(16);
        let metrics = Arc::new(MonitorMetrics::new().expect("metrics"));
        let (reconciler, readers) = Reconciler::new(topology_rx, rx, 10, true, metrics);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reconciler.run(cancel.clone()));

        tx.send(StateUpdate::Local(vec![("edge-1".to_string(), status(true))]))
            .await
            .expect("reconciler running");

        for _ in 0..100 {
            if readers.combined.get().is_cache_available("edge-1") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(readers.combined.get().is_cache_available("edge-1"));

        cancel.cancel();
        handle.await.expect("reconciler exits");
    }
}
