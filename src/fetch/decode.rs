use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::PollError;
use crate::state::CrStates;

/// Turns a raw response body into a typed payload.
pub trait Decoder: Send + Sync + 'static {
    type Output: Send + 'static;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, PollError>;

    /// Raw availability flag carried by the payload itself.
    fn available(&self, _output: &Self::Output) -> bool {
        true
    }
}

/// The `system` section of a cache stats document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    /// Contents of `/proc/loadavg`.
    #[serde(rename = "proc.loadavg", default)]
    pub proc_loadavg: String,
    /// The line of `/proc/net/dev` for the monitored interface.
    #[serde(rename = "proc.net.dev", default)]
    pub proc_net_dev: String,
    #[serde(rename = "inf.name", default)]
    pub inf_name: String,
    /// Interface speed in Mbps.
    #[serde(rename = "inf.speed", default)]
    pub inf_speed: u64,
    #[serde(rename = "notAvailable", default)]
    pub not_available: bool,
}

/// Stats document served by a cache.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Application stats by name.
    #[serde(default)]
    pub ats: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub system: SystemStats,
}

/// Decoder for cache health and stat polls.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStatsDecoder;

impl Decoder for CacheStatsDecoder {
    type Output = CacheStats;

    fn decode(&self, body: &[u8]) -> Result<CacheStats, PollError> {
        serde_json::from_slice(body).map_err(|e| PollError::Decode(e.to_string()))
    }

    fn available(&self, output: &CacheStats) -> bool {
        !output.system.not_available
    }
}

/// Decoder for peer monitor polls.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrStatesDecoder;

impl Decoder for CrStatesDecoder {
    type Output = CrStates;

    fn decode(&self, body: &[u8]) -> Result<CrStates, PollError> {
        serde_json::from_slice(body).map_err(|e| PollError::Decode(e.to_string()))
    }
}
