use std::sync::Arc;
use std::time::Duration;

use prometheus::Counter;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PollTarget;
use crate::fetch::{Fetcher, PollFinished};

/// Polls one target on its interval until cancelled.
///
/// Missed ticks are skipped, not queued: when a poll takes longer than the
/// interval the next one starts at the following tick boundary, so a slow
/// target is polled at most once per completed attempt.
pub(crate) struct PollerTask<F> {
    pub target: PollTarget,
    pub fetcher: Arc<F>,
    pub cancel: CancellationToken,
    pub drift_tolerance: Duration,
    pub slow_polls: Counter,
}

impl<F: Fetcher> PollerTask<F> {
    pub async fn run(self) {
        let PollTarget { id, url, interval } = self.target;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_tick: Option<Instant> = None;
        let mut poll_id: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            if let Some(prev) = last_tick {
                let elapsed = now.duration_since(prev);
                if elapsed > interval + self.drift_tolerance {
                    self.slow_polls.inc();
                    warn!(
                        target_id = %id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        interval_ms = interval.as_millis() as u64,
                        "poll started late",
                    );
                }
            }
            last_tick = Some(now);

            poll_id += 1;
            let (finished, done) = PollFinished::new(poll_id);
            let fetcher = Arc::clone(&self.fetcher);
            let (fetch_id, fetch_url) = (id.clone(), url.clone());
            tokio::spawn(async move {
                fetcher.fetch(&fetch_id, &fetch_url, poll_id, finished).await;
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = done => {}
            }
        }

        debug!(target_id = %id, polls = poll_id, "poller stopped");
    }
}
