//! Result aggregation loops.
//!
//! Each pipeline drains its result queue in batches: it blocks for the first
//! result, then keeps taking results without waiting until the queue is
//! empty or the flush interval has passed since the first one, and hands
//! the batch to its processor. Batches are processed in arrival order.
//! Topology changes reach the processor between batches.

mod cache;
mod dsstats;
mod peer;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::MonitorMetrics;
use crate::topology::{Topology, TopologyRx};

pub use cache::CacheProcessor;
pub use dsstats::{compute_ds_stats, DsStatsTracker};
pub use peer::PeerProcessor;

/// Pulls batches off a result queue.
pub struct Batcher<T> {
    rx: mpsc::Receiver<T>,
    flush_interval: Duration,
}

impl<T> Batcher<T> {
    pub fn new(rx: mpsc::Receiver<T>, flush_interval: Duration) -> Self {
        Self { rx, flush_interval }
    }

    /// The next batch, or `None` once cancelled or every sender is gone.
    pub async fn next_batch(&mut self, cancel: &CancellationToken) -> Option<Vec<T>> {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            first = self.rx.recv() => first?,
        };

        // The flush deadline is checked before every read so a queue that
        // never empties still yields a batch per interval.
        let deadline = tokio::time::Instant::now() + self.flush_interval;
        let mut batch = vec![first];
        while tokio::time::Instant::now() < deadline {
            match self.rx.try_recv() {
                Ok(result) => batch.push(result),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Close the queue and drop everything still in it. Returns how many
    /// results were discarded.
    pub fn drain(&mut self) -> usize {
        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Processes one batch of results for a pipeline.
pub trait Process: Send {
    type Item: Send;

    fn process(&mut self, batch: Vec<Self::Item>) -> impl Future<Output = ()> + Send;

    /// Called with every newly loaded topology, before any batch that
    /// follows it.
    fn reconfigure(&mut self, _topology: &Arc<Topology>) {}
}

/// A batching loop bound to its processor.
pub struct Pipeline<P: Process> {
    name: &'static str,
    batcher: Batcher<P::Item>,
    processor: P,
    topology: TopologyRx,
    metrics: Arc<MonitorMetrics>,
}

impl<P: Process> Pipeline<P> {
    pub fn new(
        name: &'static str,
        batcher: Batcher<P::Item>,
        processor: P,
        topology: TopologyRx,
        metrics: Arc<MonitorMetrics>,
    ) -> Self {
        Self {
            name,
            batcher,
            processor,
            topology,
            metrics,
        }
    }

    /// Process batches until cancelled, then discard whatever is queued so
    /// the pollers waiting on those results are released.
    pub async fn run(mut self, cancel: CancellationToken) {
        let batches = self
            .metrics
            .batches_processed
            .with_label_values(&[self.name]);
        let sizes = self.metrics.batch_size.with_label_values(&[self.name]);

        let initial = self.topology.borrow_and_update().clone();
        if let Some(topology) = initial {
            self.processor.reconfigure(&topology);
        }

        let mut watching = true;
        loop {
            let batch = tokio::select! {
                biased;
                changed = self.topology.changed(), if watching => {
                    match changed {
                        Ok(()) => {
                            let next = self.topology.borrow_and_update().clone();
                            if let Some(topology) = next {
                                self.processor.reconfigure(&topology);
                            }
                        }
                        Err(_) => watching = false,
                    }
                    continue;
                }
                batch = self.batcher.next_batch(&cancel) => batch,
            };
            let Some(batch) = batch else {
                break;
            };

            let size = batch.len();
            let start = Instant::now();
            self.processor.process(batch).await;

            batches.inc();
            sizes.observe(size as f64);
            debug!(
                pipeline = self.name,
                size,
                elapsed_us = start.elapsed().as_micros() as u64,
                "batch processed",
            );
        }

        let dropped = self.batcher.drain();
        info!(pipeline = self.name, dropped, "pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::sync::watch;

    use super::*;

    #[tokio::test]
    async fn test_burst_is_one_batch() {
        let (tx, rx) = mpsc::channel(256);
        for i in 0..100 {
            tx.send(i).await.expect("queue open");
        }

        let mut batcher = Batcher::new(rx, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let batch = batcher.next_batch(&cancel).await.expect("batch");
        assert_eq!(batch, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickle_is_many_batches() {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).await.expect("queue open");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });

        let mut batcher = Batcher::new(rx, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let mut batches = Vec::new();
        while let Some(batch) = batcher.next_batch(&cancel).await {
            batches.push(batch);
        }

        assert_eq!(batches, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn test_expired_flush_timer_cuts_batch_short() {
        let (tx, rx) = mpsc::channel(16);
        for i in 0..3 {
            tx.send(i).await.expect("queue open");
        }
        drop(tx);

        // A zero flush interval has always expired by the first check.
        let mut batcher = Batcher::new(rx, Duration::ZERO);
        let cancel = CancellationToken::new();
        let mut batches = Vec::new();
        while let Some(batch) = batcher.next_batch(&cancel).await {
            batches.push(batch);
        }
        assert_eq!(batches, vec![vec![0], vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let (_tx, rx) = mpsc::channel::<u32>(1);
        let mut batcher = Batcher::new(rx, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(batcher.next_batch(&cancel).await.is_none());
    }

    struct Collect(Arc<Mutex<Vec<Vec<u32>>>>);

    impl Process for Collect {
        type Item = u32;

        async fn process(&mut self, batch: Vec<u32>) {
            self.0.lock().push(batch);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_processes_every_result_once() {
        let (tx, rx) = mpsc::channel(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let metrics = Arc::new(MonitorMetrics::new().expect("metrics"));
        let (_topology_tx, topology_rx) = watch::channel(None);
        let pipeline = Pipeline::new(
            "test",
            Batcher::new(rx, Duration::from_millis(50)),
            Collect(Arc::clone(&seen)),
            topology_rx,
            Arc::clone(&metrics),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pipeline.run(cancel.clone()));

        for round in 0..4u32 {
            for i in 0..10 {
                tx.send(round * 10 + i).await.expect("queue open");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        cancel.cancel();
        handle.await.expect("pipeline panicked");

        let batches = seen.lock();
        let mut all: Vec<u32> = batches.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..40).collect::<Vec<_>>());
        assert!(batches.len() >= 4);
        assert_eq!(
            metrics
                .batches_processed
                .with_label_values(&["test"])
                .get() as usize,
            batches.len()
        );
    }
}
