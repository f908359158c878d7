use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "fleetmon";

/// Prometheus metrics for the monitor itself.
///
/// All metrics use the "fleetmon" namespace and live in a private registry
/// served by the query API on `/metrics`.
pub struct MonitorMetrics {
    registry: Registry,

    // === Polling ===
    /// Poll attempts started, by poller (health/stat/peer).
    pub fetches: CounterVec,
    /// Failed poll attempts by poller and error kind.
    pub fetch_errors: CounterVec,
    /// Ticks that arrived later than interval + drift tolerance, by poller.
    pub slow_polls: CounterVec,
    /// Per-target poller tasks currently running, by poller.
    pub active_pollers: GaugeVec,
    /// Request duration of poll attempts, by poller.
    pub poll_duration: HistogramVec,

    // === Aggregation ===
    /// Result batches processed, by pipeline.
    pub batches_processed: CounterVec,
    /// Number of results in each processed batch, by pipeline.
    pub batch_size: HistogramVec,
    /// Targets never successfully polled, by pipeline.
    pub unpolled_targets: GaugeVec,
    /// Cache availability flips recorded in the event log.
    pub availability_changes: Counter,
    /// Caches currently available in the combined view.
    pub caches_available: Gauge,
    /// Peer monitors whose last poll succeeded.
    pub peers_available: Gauge,

    // === Configuration and API ===
    /// Topology loads by result (ok/error).
    pub topology_reloads: CounterVec,
    /// Query API requests by endpoint and HTTP status.
    pub query_requests: CounterVec,
}

impl MonitorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let fetches = CounterVec::new(
            Opts::new("fetches_total", "Total poll attempts started.").namespace(NAMESPACE),
            &["poller"],
        )?;
        let fetch_errors = CounterVec::new(
            Opts::new("fetch_errors_total", "Total failed poll attempts.").namespace(NAMESPACE),
            &["poller", "error_type"],
        )?;
        let slow_polls = CounterVec::new(
            Opts::new(
                "slow_polls_total",
                "Poll ticks delivered later than the interval plus drift tolerance.",
            )
            .namespace(NAMESPACE),
            &["poller"],
        )?;
        let active_pollers = GaugeVec::new(
            Opts::new("active_pollers", "Per-target poller tasks currently running.")
                .namespace(NAMESPACE),
            &["poller"],
        )?;
        let poll_duration = HistogramVec::new(
            HistogramOpts::new("poll_duration_seconds", "Request duration of poll attempts.")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["poller"],
        )?;

        let batches_processed = CounterVec::new(
            Opts::new("batches_processed_total", "Result batches processed.").namespace(NAMESPACE),
            &["pipeline"],
        )?;
        let batch_size = HistogramVec::new(
            HistogramOpts::new("batch_size", "Number of results per processed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
            &["pipeline"],
        )?;
        let unpolled_targets = GaugeVec::new(
            Opts::new(
                "unpolled_targets",
                "Configured targets not yet successfully polled.",
            )
            .namespace(NAMESPACE),
            &["pipeline"],
        )?;
        let availability_changes = Counter::with_opts(
            Opts::new(
                "availability_changes_total",
                "Cache availability changes recorded in the event log.",
            )
            .namespace(NAMESPACE),
        )?;
        let caches_available = Gauge::with_opts(
            Opts::new(
                "caches_available",
                "Caches available in the combined view.",
            )
            .namespace(NAMESPACE),
        )?;
        let peers_available = Gauge::with_opts(
            Opts::new(
                "peers_available",
                "Peer monitors whose last poll succeeded.",
            )
            .namespace(NAMESPACE),
        )?;

        let topology_reloads = CounterVec::new(
            Opts::new("topology_reloads_total", "Topology loads by result.").namespace(NAMESPACE),
            &["result"],
        )?;
        let query_requests = CounterVec::new(
            Opts::new("query_requests_total", "Query API requests.").namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;

        registry.register(Box::new(fetches.clone()))?;
        registry.register(Box::new(fetch_errors.clone()))?;
        registry.register(Box::new(slow_polls.clone()))?;
        registry.register(Box::new(active_pollers.clone()))?;
        registry.register(Box::new(poll_duration.clone()))?;

        registry.register(Box::new(batches_processed.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(unpolled_targets.clone()))?;
        registry.register(Box::new(availability_changes.clone()))?;
        registry.register(Box::new(caches_available.clone()))?;
        registry.register(Box::new(peers_available.clone()))?;

        registry.register(Box::new(topology_reloads.clone()))?;
        registry.register(Box::new(query_requests.clone()))?;

        Ok(Self {
            registry,
            fetches,
            fetch_errors,
            slow_polls,
            active_pollers,
            poll_duration,
            batches_processed,
            batch_size,
            unpolled_targets,
            availability_changes,
            caches_available,
            peers_available,
            topology_reloads,
            query_requests,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }
}
