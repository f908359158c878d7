use std::fmt;

use thiserror::Error;

/// The kinds of query served by the API, one per route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryKind {
    CrStates,
    CacheStats,
    DsStats,
    PeerStates,
    EventLog,
    Stats,
    ConfigDoc,
    CacheCount,
    CacheAvailableCount,
    CacheDownCount,
    CacheStatuses,
    BandwidthKbps,
    BandwidthCapacityKbps,
    MonitorConfig,
    Version,
}

const HISTORY_PARAMS: [&str; 2] = ["hc", "historyCount"];

impl QueryKind {
    pub const ALL: [QueryKind; 15] = [
        Self::CrStates,
        Self::CacheStats,
        Self::DsStats,
        Self::PeerStates,
        Self::EventLog,
        Self::Stats,
        Self::ConfigDoc,
        Self::CacheCount,
        Self::CacheAvailableCount,
        Self::CacheDownCount,
        Self::CacheStatuses,
        Self::BandwidthKbps,
        Self::BandwidthCapacityKbps,
        Self::MonitorConfig,
        Self::Version,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Self::CrStates => "/publish/CrStates",
            Self::CacheStats => "/publish/CacheStats",
            Self::DsStats => "/publish/DsStats",
            Self::PeerStates => "/publish/PeerStates",
            Self::EventLog => "/publish/EventLog",
            Self::Stats => "/publish/Stats",
            Self::ConfigDoc => "/publish/ConfigDoc",
            Self::CacheCount => "/api/cache-count",
            Self::CacheAvailableCount => "/api/cache-available-count",
            Self::CacheDownCount => "/api/cache-down-count",
            Self::CacheStatuses => "/api/cache-statuses",
            Self::BandwidthKbps => "/api/bandwidth-kbps",
            Self::BandwidthCapacityKbps => "/api/bandwidth-capacity-kbps",
            Self::MonitorConfig => "/api/monitor-config",
            Self::Version => "/api/version",
        }
    }

    /// Name of the parameter listing the ids to include, if the kind has one.
    fn target_param(self) -> Option<&'static str> {
        match self {
            Self::CacheStats => Some("hosts"),
            Self::DsStats => Some("deliveryservices"),
            Self::PeerStates => Some("peers"),
            _ => None,
        }
    }

    fn accepts(self, param: &str) -> bool {
        let history = HISTORY_PARAMS.contains(&param);
        match self {
            Self::CrStates => matches!(param, "raw" | "local"),
            Self::CacheStats => {
                history || matches!(param, "stats" | "wildcard" | "type" | "hosts")
            }
            Self::DsStats => {
                history || matches!(param, "stats" | "wildcard" | "deliveryservices")
            }
            Self::PeerStates => history || param == "peers",
            _ => false,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unknown query parameter {param:?} for {kind}")]
    UnknownParam { kind: QueryKind, param: String },
    #[error("invalid value {value:?} for query parameter {param:?}")]
    InvalidValue { param: String, value: String },
}

/// What a query should include, built from its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Results per target; 0 means unlimited.
    history_count: usize,
    stats: Vec<String>,
    targets: Vec<String>,
    server_types: Vec<String>,
    wildcard: bool,
    /// Asks for the local view instead of the combined one.
    pub local: bool,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            history_count: 1,
            stats: Vec::new(),
            targets: Vec::new(),
            server_types: Vec::new(),
            wildcard: false,
            local: false,
        }
    }
}

impl Filter {
    /// Build the filter for `kind`. Any parameter the kind does not know is
    /// an error.
    pub fn parse<K, V>(kind: QueryKind, params: &[(K, V)]) -> Result<Self, FilterError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut filter = Self::default();

        for (param, value) in params {
            let (param, value) = (param.as_ref(), value.as_ref());
            if !kind.accepts(param) {
                return Err(FilterError::UnknownParam {
                    kind,
                    param: param.to_string(),
                });
            }

            let invalid = || FilterError::InvalidValue {
                param: param.to_string(),
                value: value.to_string(),
            };

            match param {
                "hc" | "historyCount" => {
                    filter.history_count = value.trim().parse().map_err(|_| invalid())?;
                }
                "stats" => filter.stats = list(value),
                "type" => filter.server_types = list(value),
                "wildcard" => filter.wildcard = flag(value).ok_or_else(invalid)?,
                "raw" | "local" => filter.local = flag(value).ok_or_else(invalid)?,
                _ if Some(param) == kind.target_param() => filter.targets = list(value),
                _ => {
                    return Err(FilterError::UnknownParam {
                        kind,
                        param: param.to_string(),
                    })
                }
            }
        }

        Ok(filter)
    }

    pub fn includes_stat(&self, name: &str) -> bool {
        self.matches(&self.stats, name)
    }

    /// Whether the cache, delivery service or peer `id` is included.
    pub fn includes_target(&self, id: &str) -> bool {
        self.matches(&self.targets, id)
    }

    pub fn includes_type(&self, server_type: &str) -> bool {
        self.server_types.is_empty() || self.server_types.iter().any(|t| t == server_type)
    }

    /// Whether a target's `n`th result (0 is the newest) is wanted.
    pub fn within_history_limit(&self, n: usize) -> bool {
        self.history_count == 0 || n < self.history_count
    }

    fn matches(&self, list: &[String], name: &str) -> bool {
        if list.is_empty() {
            return true;
        }
        if self.wildcard {
            list.iter().any(|item| name.contains(item.as_str()))
        } else {
            list.iter().any(|item| item == name)
        }
    }
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A present flag with no value counts as set.
fn flag(value: &str) -> Option<bool> {
    match value.trim() {
        "" | "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
