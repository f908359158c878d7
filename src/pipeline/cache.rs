use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{DsStatsTracker, Process};
use crate::fetch::{CacheStats, PollResult};
use crate::health::{compute_vitals, evaluate, EvalInput, Vitals, VitalsSample};
use crate::metrics::MonitorMetrics;
use crate::poller::PollerKind;
use crate::reconcile::StateUpdate;
use crate::state::{
    AvailabilityStatus, CacheStatus, CrStates, Counter, DsStats, HistoryMap, HistoryRecord,
    HistoryWriter, Readiness, ReadinessWriter, Shared, Writer,
};
use crate::topology::Topology;

/// Turns health or stat poll results into cache statuses.
///
/// For every result it computes vitals against the previous sample, judges
/// availability against the server's profile, appends to the history and
/// feeds the readiness gate. The batch's statuses go to the reconciler in
/// one update. Once the reconciler has applied it, every poller in the batch
/// is released.
pub struct CacheProcessor {
    kind: PollerKind,
    topology: Option<Arc<Topology>>,
    default_history: usize,
    last: HashMap<String, VitalsSample>,
    history: HistoryWriter,
    readiness: ReadinessWriter,
    updates: mpsc::Sender<StateUpdate>,
    errors: Counter,
    ds_stats: Option<DsStatsTracker>,
    metrics: Arc<MonitorMetrics>,
}

impl CacheProcessor {
    /// Returns the processor with read handles to its history and readiness
    /// gate.
    pub fn new(
        kind: PollerKind,
        updates: mpsc::Sender<StateUpdate>,
        errors: Counter,
        default_history: usize,
        metrics: Arc<MonitorMetrics>,
    ) -> (Self, HistoryMap, Readiness) {
        let (history, history_rx) = HistoryWriter::new();
        let (readiness, readiness_rx) = ReadinessWriter::new();
        let processor = Self {
            kind,
            topology: None,
            default_history,
            last: HashMap::new(),
            history,
            readiness,
            updates,
            errors,
            ds_stats: None,
            metrics,
        };
        (processor, history_rx, readiness_rx)
    }

    /// Also maintain delivery service stats from this processor's history.
    pub fn with_ds_stats(
        mut self,
        writer: Writer<DsStats>,
        combined: Shared<CrStates>,
        history: HistoryMap,
        max_history: usize,
    ) -> Self {
        self.ds_stats = Some(DsStatsTracker::new(writer, combined, history, max_history));
        self
    }

    /// Hand the statuses to the reconciler and wait until the combined view
    /// reflects them.
    async fn publish(&self, statuses: Vec<(String, CacheStatus)>) {
        let (done, applied) = oneshot::channel();
        let sent = self.updates.send(StateUpdate::Local(statuses)).await.is_ok()
            && self.updates.send(StateUpdate::Flush(done)).await.is_ok();
        if !sent || applied.await.is_err() {
            debug!(poller = %self.kind, "reconciler gone, statuses discarded");
        }
    }

    fn evaluate(
        &mut self,
        topology: &Topology,
        result: &PollResult<CacheStats>,
    ) -> Option<(String, CacheStatus)> {
        let PollResult {
            id,
            time,
            request_duration,
            available,
            error,
            payload,
            ..
        } = result;
        let (time, available) = (*time, *available);

        let Some(server) = topology.servers.get(id) else {
            debug!(target_id = %id, "result for unknown server, ignoring");
            return None;
        };

        let mut error = error.as_ref().map(|e| e.to_string());
        let mut vitals = Vitals::default();
        if let Some(stats) = payload {
            match compute_vitals(&stats.system, time, self.last.get(id)) {
                Ok(computed) => {
                    vitals = computed;
                    self.last.insert(id.clone(), VitalsSample { time, vitals });
                }
                Err(e) => {
                    self.errors.inc();
                    warn!(target_id = %id, error = %e, "vitals unavailable");
                    error = Some(e.to_string());
                }
            }
        }

        let empty = BTreeMap::new();
        let stats = payload.as_ref().map_or(&empty, |p| &p.ats);
        let verdict = evaluate(
            &EvalInput {
                status: server.status,
                error: error.as_deref(),
                available,
                vitals: &vitals,
                stats,
            },
            topology.thresholds(id),
        );

        let succeeded = error.is_none() && available;
        self.readiness.record(id, succeeded, vitals.kbps_out != 0);

        let query_time_ms = request_duration.as_millis() as u64;
        let record = HistoryRecord {
            time,
            available: succeeded,
            error,
            query_time_ms,
            vitals,
            stats: match self.kind {
                PollerKind::Stat => stats.clone(),
                _ => BTreeMap::new(),
            },
        };
        self.history
            .push(id, record, topology.history_count(id, self.default_history));

        let status = CacheStatus {
            availability: AvailabilityStatus {
                available: verdict.available,
                status: server.status.to_string(),
                reason: verdict.reason,
                poller: self.kind.to_string(),
            },
            last_poll: Some(time),
            query_time_ms,
            load_average: vitals.load_average,
            kbps: vitals.kbps_out,
            max_kbps: vitals.max_kbps_out,
        };
        Some((id.clone(), status))
    }
}

impl Process for CacheProcessor {
    type Item = PollResult<CacheStats>;

    async fn process(&mut self, batch: Vec<PollResult<CacheStats>>) {
        let Some(topology) = self.topology.clone() else {
            debug!(poller = %self.kind, size = batch.len(), "no topology yet, dropping batch");
            return;
        };

        let mut finished = Vec::with_capacity(batch.len());
        let mut statuses = Vec::with_capacity(batch.len());
        for result in batch {
            statuses.extend(self.evaluate(&topology, &result));
            finished.push(result.finished);
        }

        self.metrics
            .unpolled_targets
            .with_label_values(&[self.kind.as_str()])
            .set(self.readiness.reader().unpolled_count() as f64);

        if !statuses.is_empty() {
            self.publish(statuses).await;
        }

        if let Some(tracker) = &self.ds_stats {
            tracker.update(&topology, Utc::now());
        }

        // Pollers resume only once their results are visible.
        for done in finished {
            done.fire();
        }
    }

    fn reconfigure(&mut self, topology: &Arc<Topology>) {
        let targets = self.kind.targets(topology);
        self.readiness.set_targets(targets.keys().cloned());
        self.history.retain(|id| targets.contains_key(id));
        self.last.retain(|id, _| targets.contains_key(id));
        self.topology = Some(Arc::clone(topology));

        self.metrics
            .unpolled_targets
            .with_label_values(&[self.kind.as_str()])
            .set(self.readiness.reader().unpolled_count() as f64);
    }
}
