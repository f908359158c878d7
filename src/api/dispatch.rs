use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::filter::{Filter, FilterError, QueryKind};
use crate::config::Config;
use crate::metrics::MonitorMetrics;
use crate::poller::PollerKind;
use crate::reconcile::ReconcilerReaders;
use crate::state::{Counters, DsStats, HistoryMap, HistoryRecord, Readiness, Shared};
use crate::topology::{Topology, TopologyRx};
use crate::version;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("service unavailable: {0} targets not yet polled")]
    NotReady(usize),
    #[error("no topology has been loaded yet")]
    NoTopology,
    #[error(transparent)]
    BadRequest(#[from] FilterError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoTopology | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Read handles to everything a query can look at.
pub struct QueryContext {
    pub topology: TopologyRx,
    pub state: ReconcilerReaders,
    pub health_history: HistoryMap,
    /// Present when the stat pipeline runs; cache stats are served from it.
    pub stat_history: Option<HistoryMap>,
    pub ds_stats: Shared<DsStats>,
    /// The gate of the stat pipeline when it runs, else the health one.
    pub readiness: Readiness,
    pub counters: Counters,
    pub config: Arc<Config>,
    pub metrics: Arc<MonitorMetrics>,
    pub started: DateTime<Utc>,
}

impl QueryContext {
    /// Answer one query. Fails while no topology is loaded or the readiness
    /// gate is closed.
    pub fn dispatch(&self, kind: QueryKind, filter: &Filter) -> Result<Value, QueryError> {
        let topology = self
            .topology
            .borrow()
            .clone()
            .ok_or(QueryError::NoTopology)?;

        if !self.readiness.is_ready() {
            return Err(QueryError::NotReady(self.readiness.unpolled_count()));
        }

        match kind {
            QueryKind::CrStates => {
                let states = if filter.local {
                    self.state.local.get()
                } else {
                    self.state.combined.get()
                };
                to_value(&*states)
            }
            QueryKind::CacheStats => Ok(self.cache_stats(&topology, filter)),
            QueryKind::DsStats => Ok(self.ds_stats(filter)),
            QueryKind::PeerStates => Ok(self.peer_states(filter)),
            QueryKind::EventLog => Ok(json!({ "events": &*self.state.events.get() })),
            QueryKind::Stats => Ok(self.stats(&topology)),
            QueryKind::ConfigDoc => to_value(&*self.config),
            QueryKind::CacheCount => Ok(json!(topology.servers.len())),
            QueryKind::CacheAvailableCount => Ok(json!(self.available_count())),
            QueryKind::CacheDownCount => {
                // The combined view can briefly lag a topology change.
                let down = topology.servers.len().saturating_sub(self.available_count());
                Ok(json!(down))
            }
            QueryKind::CacheStatuses => to_value(&*self.state.statuses.get()),
            QueryKind::BandwidthKbps => {
                let total: u64 = self.state.statuses.get().values().map(|s| s.kbps).sum();
                Ok(json!(total))
            }
            QueryKind::BandwidthCapacityKbps => {
                let total: u64 = self.state.statuses.get().values().map(|s| s.max_kbps).sum();
                Ok(json!(total))
            }
            QueryKind::MonitorConfig => to_value(&*topology),
            QueryKind::Version => Ok(json!(format!("fleetmon-{}", version::full()))),
        }
    }

    fn available_count(&self) -> usize {
        self.state
            .combined
            .get()
            .caches
            .values()
            .filter(|c| c.is_available)
            .count()
    }

    /// `{"caches": {id: {stat: [{value, time}, ...]}}}`, newest first.
    fn cache_stats(&self, topology: &Topology, filter: &Filter) -> Value {
        let history = self.stat_history.as_ref().unwrap_or(&self.health_history);

        let mut caches = Map::new();
        for (id, records) in history.snapshot() {
            let Some(server) = topology.servers.get(&id) else {
                continue;
            };
            if !filter.includes_target(&id) || !filter.includes_type(&server.server_type) {
                continue;
            }

            let mut stats: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for (n, record) in records.iter().enumerate() {
                if !filter.within_history_limit(n) {
                    break;
                }
                for (name, value) in record_stats(record) {
                    if filter.includes_stat(&name) {
                        stats
                            .entry(name)
                            .or_default()
                            .push(sample(value, record.time));
                    }
                }
            }
            caches.insert(id, json!(stats));
        }

        json!({ "caches": caches })
    }

    /// `{"deliveryService": {name: {stat: [{value, time}, ...]}}}`.
    fn ds_stats(&self, filter: &Filter) -> Value {
        let mut services = Map::new();
        for (name, history) in self.ds_stats.get().iter() {
            if !filter.includes_target(name) {
                continue;
            }

            let mut stats: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
            for (n, stat) in history.iter().enumerate() {
                if !filter.within_history_limit(n) {
                    break;
                }
                let time = stat.time.unwrap_or(self.started);
                for (key, value) in stat.stat_values() {
                    if filter.includes_stat(key) {
                        stats.entry(key).or_default().push(sample(value, time));
                    }
                }
            }
            services.insert(name.clone(), json!(stats));
        }

        json!({ "deliveryService": services })
    }

    /// Latest view of every included peer. Only one snapshot is kept per
    /// peer, so any history count returns it alone.
    fn peer_states(&self, filter: &Filter) -> Value {
        let peers: Map<String, Value> = self
            .state
            .peers
            .get()
            .iter()
            .filter(|(id, _)| filter.includes_target(id))
            .map(|(id, peer)| (id.clone(), json!(peer)))
            .collect();

        json!({ "peers": peers })
    }

    fn stats(&self, topology: &Topology) -> Value {
        let polling = &self.config.polling;
        let interval_ms = |kind: PollerKind, configured: Duration| {
            kind.interval(topology).unwrap_or(configured).as_millis() as u64
        };
        let pollers: Map<String, Value> = [PollerKind::Health, PollerKind::Stat, PollerKind::Peer]
            .into_iter()
            .map(|kind| {
                let active = self
                    .metrics
                    .active_pollers
                    .with_label_values(&[kind.as_str()])
                    .get();
                (kind.to_string(), json!(active as u64))
            })
            .collect();

        json!({
            "stats": {
                "version": version::RELEASE,
                "gitCommit": version::git_commit(),
                "startTime": self.started,
                "uptimeSeconds": (Utc::now() - self.started).num_seconds(),
                "fetchCount": self.counters.fetches.get(),
                "errorCount": self.counters.errors.get(),
                "healthPollIntervalMs": interval_ms(PollerKind::Health, polling.health_interval),
                "statPollIntervalMs": interval_ms(PollerKind::Stat, polling.stat_interval),
                "peerPollIntervalMs": interval_ms(PollerKind::Peer, polling.peer_interval),
                "activePollers": pollers,
                "unpolledTargets": self.readiness.unpolled_count(),
            }
        })
    }
}

/// Stats reported for one history record: the computed ones followed by
/// whatever the cache reported itself.
fn record_stats(record: &HistoryRecord) -> Vec<(String, Value)> {
    let mut stats = vec![
        ("isAvailable".to_string(), json!(record.available)),
        ("queryTimeMilliseconds".to_string(), json!(record.query_time_ms)),
        ("loadavg".to_string(), json!(record.vitals.load_average)),
        ("kbps".to_string(), json!(record.vitals.kbps_out)),
        ("maxKbps".to_string(), json!(record.vitals.max_kbps_out)),
    ];
    if let Some(error) = &record.error {
        stats.push(("error".to_string(), json!(error)));
    }
    stats.extend(record.stats.iter().map(|(k, v)| (k.clone(), v.clone())));
    stats
}

fn sample(value: Value, time: DateTime<Utc>) -> Value {
    json!({ "value": value, "time": time.timestamp_millis() })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, QueryError> {
    serde_json::to_value(value).map_err(|e| QueryError::Internal(e.to_string()))
}
