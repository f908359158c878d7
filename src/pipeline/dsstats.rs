use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::state::{
    CrStates, DsGroupStat, DsStat, DsStats, History, HistoryMap, HistoryRecord, Shared, Tps,
    Writer,
};
use crate::topology::Topology;

/// Prefix of the per remap rule counters a cache reports, as in
/// `plugin.remap_stats.<remap host>.<counter>`.
const REMAP_STATS: &str = "plugin.remap_stats.";

/// Response counters a cache reports for one delivery service.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct StatusCounts([u64; 4]);

impl StatusCounts {
    /// Sum the remap counters that belong to `ds`: those whose remap host
    /// has `ds` as one of its labels. `None` when there are none.
    fn from_stats(stats: &BTreeMap<String, Value>, ds: &str) -> Option<Self> {
        let mut counts = [0u64; 4];
        let mut found = false;
        for (key, value) in stats {
            let Some((host, name)) = key
                .strip_prefix(REMAP_STATS)
                .and_then(|rest| rest.rsplit_once('.'))
            else {
                continue;
            };
            if !host.split('.').any(|label| label == ds) {
                continue;
            }
            let class = match name {
                "status_2xx" => 0,
                "status_3xx" => 1,
                "status_4xx" => 2,
                "status_5xx" => 3,
                _ => continue,
            };
            let Some(count) = value.as_u64().or_else(|| value.as_f64().map(|f| f as u64)) else {
                continue;
            };
            counts[class] += count;
            found = true;
        }
        found.then_some(Self(counts))
    }
}

/// Per-second rates for `ds` between two polls of one cache. A counter that
/// went backwards was reset and contributes nothing.
fn remap_tps(ds: &str, newer: &HistoryRecord, older: &HistoryRecord) -> Option<Tps> {
    let elapsed = (newer.time - older.time).num_milliseconds() as f64 / 1_000.0;
    if elapsed <= 0.0 {
        return None;
    }
    let now = StatusCounts::from_stats(&newer.stats, ds)?;
    let before = StatusCounts::from_stats(&older.stats, ds)?;

    let rate = |class: usize| {
        now.0[class]
            .checked_sub(before.0[class])
            .map_or(0.0, |delta| delta as f64 / elapsed)
    };
    Some(Tps::new(rate(0), rate(1), rate(2), rate(3)))
}

/// What one cache contributes to a delivery service.
fn cache_contribution(
    ds: &str,
    available: bool,
    history: Option<History<HistoryRecord>>,
) -> DsGroupStat {
    let mut stat = DsGroupStat {
        is_available: available,
        ..DsGroupStat::default()
    };
    let Some(history) = history else {
        return stat;
    };

    let mut records = history.iter();
    if let Some(latest) = records.next().filter(|r| r.error.is_none()) {
        stat.caches_reporting = 1;
        stat.kbps = latest.vitals.kbps_out;
        if let Some(tps) = records
            .next()
            .filter(|r| r.error.is_none())
            .and_then(|older| remap_tps(ds, latest, older))
        {
            stat.tps = tps;
        }
    }
    stat
}

/// Compute per delivery service stats from the combined availability view
/// and the recent stat polls of every assigned cache.
pub fn compute_ds_stats(
    topology: &Topology,
    combined: &CrStates,
    history: &HistoryMap,
    time: DateTime<Utc>,
) -> BTreeMap<String, DsStat> {
    topology
        .delivery_service_servers()
        .into_iter()
        .map(|(ds, servers)| {
            let mut stat = DsStat {
                time: Some(time),
                caches_configured: servers.len() as u64,
                ..DsStat::default()
            };

            for id in &servers {
                let Some(server) = topology.servers.get(id) else {
                    continue;
                };
                let available = combined.is_cache_available(id);
                let cache = cache_contribution(&ds, available, history.get(id));

                if available {
                    stat.caches_available += 1;
                }
                stat.caches_reporting += cache.caches_reporting;
                stat.total_kbps += cache.kbps;
                stat.tps.add(&cache.tps);
                stat.cachegroups
                    .entry(server.cachegroup.clone())
                    .or_default()
                    .merge(&cache);
                stat.types
                    .entry(server.server_type.clone())
                    .or_default()
                    .merge(&cache);
            }

            match combined.delivery_services.get(&ds) {
                Some(state) => {
                    stat.is_available = state.is_available;
                    stat.disabled_locations = state.disabled_locations.clone();
                }
                None => stat.is_available = stat.caches_available > 0,
            }

            (ds, stat)
        })
        .collect()
}

/// Keeps the delivery service stats container current. Owned by the stat
/// pipeline.
pub struct DsStatsTracker {
    writer: Writer<DsStats>,
    combined: Shared<CrStates>,
    history: HistoryMap,
    max_history: usize,
}

impl DsStatsTracker {
    pub fn new(
        writer: Writer<DsStats>,
        combined: Shared<CrStates>,
        history: HistoryMap,
        max_history: usize,
    ) -> Self {
        Self {
            writer,
            combined,
            history,
            max_history,
        }
    }

    /// Append a fresh stat for every delivery service, dropping services
    /// that are no longer configured.
    pub fn update(&self, topology: &Topology, time: DateTime<Utc>) {
        let combined = self.combined.get();
        let fresh = compute_ds_stats(topology, &combined, &self.history, time);

        let current = self.writer.get();
        let mut next = DsStats::new();
        for (ds, stat) in fresh {
            let mut history = current
                .get(&ds)
                .cloned()
                .unwrap_or_else(|| History::new(self.max_history));
            history.push(stat);
            next.insert(ds, history);
        }
        self.writer.set(next);
    }
}
