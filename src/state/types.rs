use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::History;

/// Availability of one cache as published to peers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
    #[serde(rename = "isAvailable")]
    pub is_available: bool,
}

/// Availability of one delivery service as published to peers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryServiceState {
    #[serde(rename = "isAvailable")]
    pub is_available: bool,
    /// Cachegroups with no available cache for this delivery service. Sorted.
    #[serde(rename = "disabledLocations", default)]
    pub disabled_locations: Vec<String>,
}

/// A full availability view: the local one, a peer's, or the combined one.
///
/// This is also the document served at `/publish/CrStates` and the payload
/// decoded from peer monitors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrStates {
    #[serde(default)]
    pub caches: BTreeMap<String, CacheState>,
    #[serde(rename = "deliveryServices", default)]
    pub delivery_services: BTreeMap<String, DeliveryServiceState>,
}

impl CrStates {
    pub fn is_cache_available(&self, id: &str) -> bool {
        self.caches.get(id).is_some_and(|c| c.is_available)
    }
}

/// The verdict of the last evaluation for a target. Always replaced whole.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AvailabilityStatus {
    pub available: bool,
    /// Administrative status label of the server (REPORTED, ONLINE, ...).
    pub status: String,
    pub reason: String,
    /// Which pipeline produced the verdict ("health" or "stat").
    pub poller: String,
}

/// Per-cache status record served by `/api/cache-statuses`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CacheStatus {
    #[serde(flatten)]
    pub availability: AvailabilityStatus,
    pub last_poll: Option<DateTime<Utc>>,
    pub query_time_ms: u64,
    pub load_average: f64,
    pub kbps: u64,
    pub max_kbps: u64,
}

/// Latest snapshot received from one peer monitor.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeerState {
    /// Whether the last poll of the peer succeeded.
    pub available: bool,
    pub last_poll: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub states: CrStates,
}

/// Peer id to its latest snapshot.
pub type PeerStates = BTreeMap<String, PeerState>;

/// Per-second transactions by response class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Tps {
    pub tps_2xx: f64,
    pub tps_3xx: f64,
    pub tps_4xx: f64,
    pub tps_5xx: f64,
    pub tps_total: f64,
}

impl Tps {
    pub fn new(tps_2xx: f64, tps_3xx: f64, tps_4xx: f64, tps_5xx: f64) -> Self {
        Self {
            tps_2xx,
            tps_3xx,
            tps_4xx,
            tps_5xx,
            tps_total: tps_2xx + tps_3xx + tps_4xx + tps_5xx,
        }
    }

    pub fn add(&mut self, other: &Tps) {
        *self = Self::new(
            self.tps_2xx + other.tps_2xx,
            self.tps_3xx + other.tps_3xx,
            self.tps_4xx + other.tps_4xx,
            self.tps_5xx + other.tps_5xx,
        );
    }
}

/// Traffic of the caches of one delivery service that share a cachegroup
/// or a server type.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DsGroupStat {
    /// Whether any cache in the group is available.
    pub is_available: bool,
    pub caches_reporting: u64,
    pub kbps: u64,
    #[serde(flatten)]
    pub tps: Tps,
}

impl DsGroupStat {
    pub fn merge(&mut self, other: &DsGroupStat) {
        self.is_available |= other.is_available;
        self.caches_reporting += other.caches_reporting;
        self.kbps += other.kbps;
        self.tps.add(&other.tps);
    }
}

/// Derived traffic statistics for one delivery service.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DsStat {
    pub time: Option<DateTime<Utc>>,
    pub caches_configured: u64,
    pub caches_available: u64,
    pub caches_reporting: u64,
    pub total_kbps: u64,
    pub is_available: bool,
    pub disabled_locations: Vec<String>,
    #[serde(flatten)]
    pub tps: Tps,
    pub cachegroups: BTreeMap<String, DsGroupStat>,
    pub types: BTreeMap<String, DsGroupStat>,
}

impl DsStat {
    /// Named stat values, used by the query filter to select fields.
    pub fn stat_values(&self) -> Vec<(&'static str, serde_json::Value)> {
        vec![
            ("caches_configured", self.caches_configured.into()),
            ("caches_available", self.caches_available.into()),
            ("caches_reporting", self.caches_reporting.into()),
            ("total_kbps", self.total_kbps.into()),
            ("is_available", self.is_available.into()),
            (
                "disabled_locations",
                serde_json::Value::from(self.disabled_locations.clone()),
            ),
            ("tps_2xx", self.tps.tps_2xx.into()),
            ("tps_3xx", self.tps.tps_3xx.into()),
            ("tps_4xx", self.tps.tps_4xx.into()),
            ("tps_5xx", self.tps.tps_5xx.into()),
            ("tps_total", self.tps.tps_total.into()),
            ("cachegroups", serde_json::json!(self.cachegroups)),
            ("types", serde_json::json!(self.types)),
        ]
    }
}

/// Delivery service name to its recent stats, newest first.
pub type DsStats = BTreeMap<String, History<DsStat>>;
