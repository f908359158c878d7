//! The monitored fleet: servers, their health profiles, and peer monitors.
//!
//! The topology is read from a YAML (or JSON) document on disk and re-read
//! periodically by [`TopologySource`]; every successful read replaces the
//! previous topology wholesale.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::Threshold;
use crate::metrics::MonitorMetrics;
use crate::state::Counter;

/// Receiving side of the topology channel. `None` until the first load.
pub type TopologyRx = watch::Receiver<Option<Arc<Topology>>>;

/// Administrative status of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    /// Forced available, not polled.
    Online,
    /// Forced unavailable, not polled.
    Offline,
    /// Availability decided by polling.
    Reported,
    /// Polled, but always reported unavailable.
    AdminDown,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Reported => "REPORTED",
            Self::AdminDown => "ADMIN_DOWN",
        }
    }

    /// Whether servers with this status are polled at all.
    pub fn is_polled(self) -> bool {
        matches!(self, Self::Reported | Self::AdminDown)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cache server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Health poll URL.
    pub url: String,
    /// Full stats URL. Falls back to `url` when empty.
    #[serde(default)]
    pub stat_url: String,
    pub status: ServerStatus,
    pub profile: String,
    #[serde(default)]
    pub cachegroup: String,
    #[serde(default, rename = "type")]
    pub server_type: String,
    #[serde(default)]
    pub delivery_services: Vec<String>,
}

impl Server {
    pub fn stat_url(&self) -> &str {
        if self.stat_url.is_empty() {
            &self.url
        } else {
            &self.stat_url
        }
    }
}

/// Health settings shared by servers of one profile.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Results kept per server; the configured default when unset.
    #[serde(default)]
    pub history_count: Option<usize>,
    /// Stat name to threshold.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Threshold>,
}

/// Another monitor instance, polled for its local view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// The peer's raw CrStates endpoint.
    pub url: String,
}

/// Poll intervals published with the topology. A kind left unset polls at
/// its configured interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollIntervals {
    #[serde(default, with = "humantime_serde")]
    pub health: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub stat: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub peer: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub servers: BTreeMap<String, Server>,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    pub peers: BTreeMap<String, Peer>,
    #[serde(default)]
    pub polling: PollIntervals,
}

static NO_THRESHOLDS: BTreeMap<String, Threshold> = BTreeMap::new();

impl Topology {
    /// Parse and validate a topology document. JSON is accepted as YAML.
    pub fn parse(data: &str) -> Result<Self> {
        let topology: Topology = serde_yaml::from_str(data).context("parsing topology")?;
        topology.validate()?;
        Ok(topology)
    }

    /// Check the topology for problems that would make verdicts wrong.
    pub fn validate(&self) -> Result<()> {
        for (id, server) in &self.servers {
            if server.url.is_empty() {
                bail!("server {id}: url is required");
            }
            if !self.profiles.contains_key(&server.profile) {
                bail!("server {id}: unknown profile {:?}", server.profile);
            }
        }

        for (name, profile) in &self.profiles {
            if profile.history_count == Some(0) {
                bail!("profile {name}: history_count must be positive");
            }
            for (stat, threshold) in &profile.thresholds {
                if !threshold.value.is_finite() {
                    bail!("profile {name}: threshold for {stat} must be a finite number");
                }
            }
        }

        for (id, peer) in &self.peers {
            if peer.url.is_empty() {
                bail!("peer {id}: url is required");
            }
        }

        let PollIntervals { health, stat, peer } = self.polling;
        for (kind, interval) in [("health", health), ("stat", stat), ("peer", peer)] {
            if interval == Some(Duration::ZERO) {
                bail!("polling.{kind} must be positive");
            }
        }

        Ok(())
    }

    /// Health poll targets: polled servers by id.
    pub fn health_targets(&self) -> BTreeMap<String, String> {
        self.polled_servers()
            .map(|(id, s)| (id.clone(), s.url.clone()))
            .collect()
    }

    /// Stat poll targets: polled servers by id.
    pub fn stat_targets(&self) -> BTreeMap<String, String> {
        self.polled_servers()
            .map(|(id, s)| (id.clone(), s.stat_url().to_string()))
            .collect()
    }

    pub fn peer_targets(&self) -> BTreeMap<String, String> {
        self.peers
            .iter()
            .map(|(id, p)| (id.clone(), p.url.clone()))
            .collect()
    }

    /// Ids of servers that must be polled before the monitor is ready.
    pub fn polled_ids(&self) -> BTreeSet<String> {
        self.polled_servers().map(|(id, _)| id.clone()).collect()
    }

    fn polled_servers(&self) -> impl Iterator<Item = (&String, &Server)> {
        self.servers.iter().filter(|(_, s)| s.status.is_polled())
    }

    /// Delivery service name to the ids of the servers assigned to it.
    pub fn delivery_service_servers(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, server) in &self.servers {
            for ds in &server.delivery_services {
                out.entry(ds.clone()).or_default().push(id.clone());
            }
        }
        out
    }

    pub fn thresholds(&self, id: &str) -> &BTreeMap<String, Threshold> {
        self.servers
            .get(id)
            .and_then(|s| self.profiles.get(&s.profile))
            .map_or(&NO_THRESHOLDS, |p| &p.thresholds)
    }

    /// History length for a server: its profile's, else `default`.
    pub fn history_count(&self, id: &str, default: usize) -> usize {
        self.servers
            .get(id)
            .and_then(|s| self.profiles.get(&s.profile))
            .and_then(|p| p.history_count)
            .unwrap_or(default)
    }
}

/// Periodically re-reads the topology file and publishes changes.
pub struct TopologySource {
    path: PathBuf,
    interval: Duration,
    tx: watch::Sender<Option<Arc<Topology>>>,
    metrics: Arc<MonitorMetrics>,
    errors: Counter,
}

impl TopologySource {
    pub fn new(
        path: PathBuf,
        interval: Duration,
        metrics: Arc<MonitorMetrics>,
        errors: Counter,
    ) -> (Self, TopologyRx) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                path,
                interval,
                tx,
                metrics,
                errors,
            },
            rx,
        )
    }

    /// Read the file once. Returns whether the published topology changed.
    pub async fn reload(&self) -> Result<bool> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading topology file {}", self.path.display()))?;
        let topology = Topology::parse(&data)
            .with_context(|| format!("loading topology {}", self.path.display()))?;

        Ok(self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(&topology) {
                return false;
            }
            *current = Some(Arc::new(topology));
            true
        }))
    }

    /// Reload on every interval until cancelled. A failed read keeps the
    /// previously published topology.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("topology source stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.reload().await {
                Ok(changed) => {
                    self.metrics
                        .topology_reloads
                        .with_label_values(&["ok"])
                        .inc();
                    if changed {
                        if let Some(topology) = self.tx.borrow().as_deref() {
                            info!(
                                servers = topology.servers.len(),
                                profiles = topology.profiles.len(),
                                peers = topology.peers.len(),
                                "topology updated",
                            );
                        }
                    }
                }
                Err(e) => {
                    self.metrics
                        .topology_reloads
                        .with_label_values(&["error"])
                        .inc();
                    self.errors.inc();
                    let error = format!("{e:#}");
                    warn!(
                        error = %error,
                        path = %self.path.display(),
                        "topology load failed, keeping previous",
                    );
                }
            }
        }
    }
}
