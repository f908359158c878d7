use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the fleet monitor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path of the topology document describing servers, profiles and peers.
    #[serde(default)]
    pub topology_path: PathBuf,

    /// How often the topology document is re-read. Default: 30s.
    #[serde(default = "default_topology_poll_interval", with = "humantime_serde")]
    pub topology_poll_interval: Duration,

    /// Trust any peer that reports a cache available. When false the
    /// combined view is the local view. Default: true.
    #[serde(default = "default_true")]
    pub peer_optimistic: bool,

    /// Poller and pipeline configuration.
    #[serde(default)]
    pub polling: PollingConfig,

    /// History and event log retention.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Query API server configuration.
    #[serde(default)]
    pub api: ApiConfig,
}

/// Poller and pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    /// Interval between health polls of one cache. Default: 6s.
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub health_interval: Duration,

    /// Interval between full stat polls of one cache. Default: 20s.
    #[serde(default = "default_stat_interval", with = "humantime_serde")]
    pub stat_interval: Duration,

    /// Interval between polls of one peer monitor. Default: 5s.
    #[serde(default = "default_peer_interval", with = "humantime_serde")]
    pub peer_interval: Duration,

    /// Network timeout of a single poll attempt. Default: 2s.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Longest a health batch is held open. Default: 200ms.
    #[serde(default = "default_health_flush_interval", with = "humantime_serde")]
    pub health_flush_interval: Duration,

    /// Longest a stat batch is held open. Default: 1s.
    #[serde(default = "default_stat_flush_interval", with = "humantime_serde")]
    pub stat_flush_interval: Duration,

    /// Longest a peer batch is held open. Default: 200ms.
    #[serde(default = "default_peer_flush_interval", with = "humantime_serde")]
    pub peer_flush_interval: Duration,

    /// Tick lateness above which a poll is counted as slow. Default: 100ms.
    #[serde(default = "default_drift_tolerance", with = "humantime_serde")]
    pub drift_tolerance: Duration,

    /// Capacity of each pipeline's result queue. Default: 4096.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Run the full stat pipeline. Default: true.
    #[serde(default = "default_true")]
    pub stat_polling: bool,

    /// Poll peer monitors. Default: true.
    #[serde(default = "default_true")]
    pub peer_polling: bool,
}

/// History and event log retention.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    /// Event log capacity. Default: 200.
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Results kept per cache when its profile sets no history count.
    /// Default: 5.
    #[serde(default = "default_history_count")]
    pub default_history_count: usize,
}

/// Query API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_api_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_topology_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> Duration {
    Duration::from_secs(6)
}

fn default_stat_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_peer_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_health_flush_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_stat_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_peer_flush_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_drift_tolerance() -> Duration {
    Duration::from_millis(100)
}

fn default_queue_size() -> usize {
    4096
}

fn default_max_events() -> usize {
    200
}

fn default_history_count() -> usize {
    5
}

fn default_api_addr() -> String {
    ":8080".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            topology_path: PathBuf::new(),
            topology_poll_interval: default_topology_poll_interval(),
            peer_optimistic: true,
            polling: PollingConfig::default(),
            history: HistoryConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            health_interval: default_health_interval(),
            stat_interval: default_stat_interval(),
            peer_interval: default_peer_interval(),
            timeout: default_timeout(),
            health_flush_interval: default_health_flush_interval(),
            stat_flush_interval: default_stat_flush_interval(),
            peer_flush_interval: default_peer_flush_interval(),
            drift_tolerance: default_drift_tolerance(),
            queue_size: default_queue_size(),
            stat_polling: true,
            peer_polling: true,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            default_history_count: default_history_count(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.topology_path.as_os_str().is_empty() {
            bail!("topology_path is required");
        }

        if self.topology_poll_interval.is_zero() {
            bail!("topology_poll_interval must be positive");
        }

        let polling = &self.polling;
        for (name, interval) in [
            ("polling.health_interval", polling.health_interval),
            ("polling.stat_interval", polling.stat_interval),
            ("polling.peer_interval", polling.peer_interval),
            ("polling.timeout", polling.timeout),
        ] {
            if interval.is_zero() {
                bail!("{name} must be positive");
            }
        }

        if polling.queue_size == 0 {
            bail!("polling.queue_size must be positive");
        }

        if self.history.max_events == 0 {
            bail!("history.max_events must be positive");
        }

        if self.history.default_history_count == 0 {
            bail!("history.default_history_count must be positive");
        }

        self.api.socket_addr().with_context(|| {
            format!("api.addr {:?} is not a valid listen address", self.api.addr)
        })?;

        Ok(())
    }
}

impl ApiConfig {
    /// The listen address. A bare ":port" binds every interface.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        addr.parse()
            .with_context(|| format!("parsing listen address {addr}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            topology_path: PathBuf::from("/etc/fleetmon/topology.yaml"),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.topology_poll_interval, Duration::from_secs(30));
        assert!(cfg.peer_optimistic);
        assert_eq!(cfg.polling.health_interval, Duration::from_secs(6));
        assert_eq!(cfg.polling.stat_interval, Duration::from_secs(20));
        assert_eq!(cfg.polling.peer_interval, Duration::from_secs(5));
        assert_eq!(cfg.polling.timeout, Duration::from_secs(2));
        assert_eq!(cfg.polling.health_flush_interval, Duration::from_millis(200));
        assert_eq!(cfg.polling.drift_tolerance, Duration::from_millis(100));
        assert_eq!(cfg.polling.queue_size, 4096);
        assert_eq!(cfg.history.max_events, 200);
        assert_eq!(cfg.history.default_history_count, 5);
        assert_eq!(cfg.api.addr, ":8080");
    }

    #[test]
    fn test_parse_yaml_with_humantime_durations() {
        let cfg: Config = serde_yaml::from_str(
            r#"
topology_path: /tmp/topology.yaml
polling:
  health_interval: 1s 500ms
  stat_flush_interval: 250ms
  stat_polling: false
history:
  max_events: 10
"#,
        )
        .expect("config should parse");

        assert_eq!(cfg.polling.health_interval, Duration::from_millis(1500));
        assert_eq!(cfg.polling.stat_flush_interval, Duration::from_millis(250));
        assert!(!cfg.polling.stat_polling);
        assert!(cfg.polling.peer_polling);
        assert_eq!(cfg.history.max_events, 10);
        assert_eq!(cfg.history.default_history_count, 5);
        cfg.validate().expect("config should be valid");
    }

    #[test]
    fn test_validation_accepts_valid_config() {
        valid_config().validate().expect("config should be valid");
    }

    #[test]
    fn test_validation_missing_topology_path() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("topology_path"));
    }

    #[test]
    fn test_validation_zero_interval() {
        let mut cfg = valid_config();
        cfg.polling.stat_interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("polling.stat_interval"));
    }

    #[test]
    fn test_validation_zero_history_count() {
        let mut cfg = valid_config();
        cfg.history.default_history_count = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("default_history_count"));
    }

    #[test]
    fn test_validation_zero_queue_size() {
        let mut cfg = valid_config();
        cfg.polling.queue_size = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("queue_size"));
    }

    #[test]
    fn test_validation_bad_listen_address() {
        let mut cfg = valid_config();
        cfg.api.addr = "not-an-address".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("api.addr"));
    }

    #[test]
    fn test_socket_addr_bare_port() {
        let api = ApiConfig {
            addr: ":9100".to_string(),
        };
        let addr = api.socket_addr().expect("should parse");
        assert_eq!(addr.port(), 9100);
        assert!(addr.ip().is_unspecified());

        let api = ApiConfig {
            addr: "127.0.0.1:8081".to_string(),
        };
        assert_eq!(
            api.socket_addr().expect("should parse").to_string(),
            "127.0.0.1:8081"
        );
    }
}
