//! Process lifecycle: builds every component, wires the channels between
//! them, and shuts them down in order.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{ApiServer, QueryContext};
use crate::config::Config;
use crate::fetch::{
    CacheStats, CacheStatsDecoder, CrStatesDecoder, Handler, HttpFetcher, PollResult,
};
use crate::metrics::MonitorMetrics;
use crate::pipeline::{Batcher, CacheProcessor, PeerProcessor, Pipeline};
use crate::poller::{PollerKind, Supervisor};
use crate::reconcile::{Reconciler, StateUpdate};
use crate::state::{
    container, Counters, CrStates, DsStats, HistoryMap, Readiness, Shared, Writer,
};
use crate::topology::{TopologyRx, TopologySource};

/// Monitor orchestrates all components: topology source, pollers,
/// aggregation pipelines, reconciler and query API.
pub struct Monitor {
    cfg: Arc<Config>,
    metrics: Arc<MonitorMetrics>,
    counters: Counters,
    api: Option<ApiServer>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    cancel: CancellationToken,
}

/// Read handles produced by one cache pipeline.
struct CachePipeline {
    history: HistoryMap,
    readiness: Readiness,
}

impl Monitor {
    /// Creates a new Monitor, initializing metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(MonitorMetrics::new().context("creating monitor metrics")?);

        Ok(Self {
            cfg: Arc::new(cfg),
            metrics,
            counters: Counters::default(),
            api: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start every component. Returns the address the query API is bound
    /// to.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let cfg = Arc::clone(&self.cfg);
        let polling = &cfg.polling;
        let api_addr = cfg.api.socket_addr().context("resolving api.addr")?;

        // 1. Topology source. The first load happens on its first tick;
        // until then nothing is polled and the API reports not ready.
        let (source, topology) = TopologySource::new(
            cfg.topology_path.clone(),
            cfg.topology_poll_interval,
            Arc::clone(&self.metrics),
            self.counters.errors.clone(),
        );
        self.spawn("topology", source.run(self.cancel.child_token()));

        // 2. Reconciler, the only writer of the availability views.
        let (updates_tx, updates_rx) = mpsc::channel(polling.queue_size);
        let (reconciler, state) = Reconciler::new(
            topology.clone(),
            updates_rx,
            cfg.history.max_events,
            cfg.peer_optimistic,
            Arc::clone(&self.metrics),
        );
        self.spawn("reconciler", reconciler.run(self.cancel.child_token()));

        // 3. Cache pipelines. Delivery service stats follow whichever
        // pipeline serves cache stats.
        let (ds_writer, ds_stats) = container(DsStats::new());
        let mut ds_writer = Some((ds_writer, state.combined.clone()));

        let stat = if polling.stat_polling {
            Some(self.start_cache_pipeline(
                PollerKind::Stat,
                &topology,
                &updates_tx,
                ds_writer.take(),
            )?)
        } else {
            info!("stat polling disabled");
            None
        };
        let health = self.start_cache_pipeline(
            PollerKind::Health,
            &topology,
            &updates_tx,
            ds_writer.take(),
        )?;

        // 4. Peer pipeline.
        if polling.peer_polling {
            self.start_peer_pipeline(&topology, &updates_tx)?;
        } else {
            info!("peer polling disabled");
        }

        // 5. Query API, gated on the pipeline that serves cache stats.
        let readiness = stat
            .as_ref()
            .map_or_else(|| health.readiness.clone(), |s| s.readiness.clone());
        let ctx = QueryContext {
            topology,
            state,
            health_history: health.history,
            stat_history: stat.map(|s| s.history),
            ds_stats,
            readiness,
            counters: self.counters.clone(),
            config: Arc::clone(&self.cfg),
            metrics: Arc::clone(&self.metrics),
            started: Utc::now(),
        };
        let api = ApiServer::new(api_addr, ctx, self.counters.errors.clone());
        let bound = api.start().await.context("starting query API server")?;
        self.api = Some(api);

        info!(
            api = %bound,
            topology = %cfg.topology_path.display(),
            stat_polling = polling.stat_polling,
            peer_polling = polling.peer_polling,
            "monitor started",
        );

        Ok(bound)
    }

    /// Stop every component and wait for the background tasks to exit.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        for (name, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "task failed during shutdown");
            }
        }

        // Stop query API server.
        if let Some(api) = self.api.take() {
            api.stop().await?;
        }

        info!("monitor stopped");
        Ok(())
    }

    /// Process-wide fetch and error counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Registry-backed metrics, as served on `/metrics`.
    pub fn metrics(&self) -> &Arc<MonitorMetrics> {
        &self.metrics
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    fn start_cache_pipeline(
        &mut self,
        kind: PollerKind,
        topology: &TopologyRx,
        updates: &mpsc::Sender<StateUpdate>,
        ds_stats: Option<(Writer<DsStats>, Shared<CrStates>)>,
    ) -> Result<CachePipeline> {
        let polling = &self.cfg.polling;
        let (interval, flush_interval) = match kind {
            PollerKind::Stat => (polling.stat_interval, polling.stat_flush_interval),
            _ => (polling.health_interval, polling.health_flush_interval),
        };

        let (results_tx, results_rx) = mpsc::channel::<PollResult<CacheStats>>(polling.queue_size);
        let handler = Handler::new(CacheStatsDecoder, results_tx, self.counters.errors.clone());
        let fetcher = HttpFetcher::new(
            kind,
            polling.timeout,
            handler,
            self.counters.fetches.clone(),
            Arc::clone(&self.metrics),
        )
        .with_context(|| format!("creating {kind} fetcher"))?;
        let supervisor = Supervisor::new(
            kind,
            Arc::new(fetcher),
            interval,
            polling.drift_tolerance,
            Arc::clone(&self.metrics),
        );

        let default_history = self.cfg.history.default_history_count;
        let (mut processor, history, readiness) = CacheProcessor::new(
            kind,
            updates.clone(),
            self.counters.errors.clone(),
            default_history,
            Arc::clone(&self.metrics),
        );
        if let Some((writer, combined)) = ds_stats {
            processor = processor.with_ds_stats(writer, combined, history.clone(), default_history);
        }
        let pipeline = Pipeline::new(
            kind.as_str(),
            Batcher::new(results_rx, flush_interval),
            processor,
            topology.clone(),
            Arc::clone(&self.metrics),
        );

        let name = kind.as_str();
        self.spawn(name, supervisor.run(topology.clone(), self.cancel.child_token()));
        self.spawn(name, pipeline.run(self.cancel.child_token()));

        Ok(CachePipeline { history, readiness })
    }

    fn start_peer_pipeline(
        &mut self,
        topology: &TopologyRx,
        updates: &mpsc::Sender<StateUpdate>,
    ) -> Result<()> {
        let polling = &self.cfg.polling;
        let kind = PollerKind::Peer;

        let (results_tx, results_rx) = mpsc::channel(polling.queue_size);
        let handler = Handler::new(CrStatesDecoder, results_tx, self.counters.errors.clone());
        let fetcher = HttpFetcher::new(
            kind,
            polling.timeout,
            handler,
            self.counters.fetches.clone(),
            Arc::clone(&self.metrics),
        )
        .context("creating peer fetcher")?;
        let supervisor = Supervisor::new(
            kind,
            Arc::new(fetcher),
            polling.peer_interval,
            polling.drift_tolerance,
            Arc::clone(&self.metrics),
        );
        let pipeline = Pipeline::new(
            kind.as_str(),
            Batcher::new(results_rx, polling.peer_flush_interval),
            PeerProcessor::new(updates.clone()),
            topology.clone(),
            Arc::clone(&self.metrics),
        );

        self.spawn("peer", supervisor.run(topology.clone(), self.cancel.child_token()));
        self.spawn("peer", pipeline.run(self.cancel.child_token()));
        Ok(())
    }
}
