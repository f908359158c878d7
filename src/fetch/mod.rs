//! One poll round trip.
//!
//! A [`Fetcher`] performs the GET and hands the outcome to a [`Handler`],
//! which decodes it and queues exactly one [`PollResult`]. Every result
//! carries the attempt's [`PollFinished`] signal; the signal fires when the
//! aggregation loop is done with the result, or when the result is dropped
//! for any other reason, so the poller that started the attempt is always
//! released.

mod decode;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::metrics::MonitorMetrics;
use crate::poller::PollerKind;
use crate::state::Counter;

pub use decode::{CacheStats, CacheStatsDecoder, CrStatesDecoder, Decoder, SystemStats};

/// Why a poll attempt produced no usable payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("decoding payload: {0}")]
    Decode(String),
}

impl PollError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Status(_) => "status",
            Self::Decode(_) => "decode",
        }
    }
}

/// Completion signal of one poll attempt. Fires exactly once: explicitly
/// through [`PollFinished::fire`] or implicitly on drop.
#[derive(Debug)]
pub struct PollFinished {
    poll_id: u64,
    tx: Option<oneshot::Sender<u64>>,
}

impl PollFinished {
    pub fn new(poll_id: u64) -> (Self, oneshot::Receiver<u64>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                poll_id,
                tx: Some(tx),
            },
            rx,
        )
    }

    pub fn poll_id(&self) -> u64 {
        self.poll_id
    }

    pub fn fire(mut self) {
        self.send();
    }

    fn send(&mut self) {
        if let Some(tx) = self.tx.take() {
            // The poller may already be gone.
            let _ = tx.send(self.poll_id);
        }
    }
}

impl Drop for PollFinished {
    fn drop(&mut self) {
        self.send();
    }
}

/// Outcome of one poll attempt.
#[derive(Debug)]
pub struct PollResult<T> {
    pub id: String,
    /// When the response (or failure) was observed.
    pub time: DateTime<Utc>,
    pub request_duration: Duration,
    /// Raw availability flag from the payload; false whenever `error` is set.
    pub available: bool,
    pub error: Option<PollError>,
    pub payload: Option<T>,
    pub poll_id: u64,
    pub finished: PollFinished,
}

/// Performs one poll attempt for a target.
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch `url` and hand the outcome to the handler. Must release
    /// `finished` on every path, including timeouts.
    fn fetch(
        &self,
        id: &str,
        url: &str,
        poll_id: u64,
        finished: PollFinished,
    ) -> impl std::future::Future<Output = ()> + Send;
}

/// Decodes fetch outcomes and queues them for aggregation.
pub struct Handler<D: Decoder> {
    decoder: D,
    results: mpsc::Sender<PollResult<D::Output>>,
    errors: Counter,
}

impl<D: Decoder> Handler<D> {
    pub fn new(decoder: D, results: mpsc::Sender<PollResult<D::Output>>, errors: Counter) -> Self {
        Self {
            decoder,
            results,
            errors,
        }
    }

    /// Queue exactly one result for this attempt. Decode failures become the
    /// result's error rather than dropping it.
    pub async fn handle(
        &self,
        id: &str,
        body: Result<&[u8], PollError>,
        request_duration: Duration,
        finished: PollFinished,
    ) {
        let (available, error, payload) = match body.and_then(|b| self.decoder.decode(b)) {
            Ok(payload) => (self.decoder.available(&payload), None, Some(payload)),
            Err(e) => (false, Some(e), None),
        };

        if let Some(e) = &error {
            self.errors.inc();
            debug!(target_id = id, error = %e, "poll failed");
        }

        let result = PollResult {
            id: id.to_string(),
            time: Utc::now(),
            request_duration,
            available,
            error,
            payload,
            poll_id: finished.poll_id(),
            finished,
        };

        if self.results.send(result).await.is_err() {
            // Dropping the result releases the poller.
            debug!(target_id = id, "result queue closed, discarding result");
        }
    }
}

/// HTTP fetcher backed by a shared reqwest client.
pub struct HttpFetcher<D: Decoder> {
    http: reqwest::Client,
    timeout: Duration,
    kind: PollerKind,
    handler: Handler<D>,
    fetches: Counter,
    metrics: Arc<MonitorMetrics>,
}

impl<D: Decoder> HttpFetcher<D> {
    pub fn new(
        kind: PollerKind,
        timeout: Duration,
        handler: Handler<D>,
        fetches: Counter,
        metrics: Arc<MonitorMetrics>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fleetmon/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            timeout,
            kind,
            handler,
            fetches,
            metrics,
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, PollError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }
        Ok(response)
    }

    fn classify(&self, e: reqwest::Error) -> PollError {
        if e.is_timeout() {
            PollError::Timeout(self.timeout)
        } else {
            PollError::Transport(e.to_string())
        }
    }
}

impl<D: Decoder> Fetcher for HttpFetcher<D> {
    async fn fetch(&self, id: &str, url: &str, poll_id: u64, finished: PollFinished) {
        let kind = self.kind.as_str();
        self.fetches.inc();
        self.metrics.fetches.with_label_values(&[kind]).inc();
        debug!(target_id = id, poll_id, poller = kind, "polling");

        let start = Instant::now();
        let body = match self.get(url).await {
            Ok(response) => response.bytes().await.map_err(|e| self.classify(e)),
            Err(e) => Err(e),
        };
        let elapsed = start.elapsed();

        self.metrics
            .poll_duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
        if let Err(e) = &body {
            self.metrics
                .fetch_errors
                .with_label_values(&[kind, e.kind()])
                .inc();
        }

        match body {
            Ok(bytes) => {
                self.handler
                    .handle(id, Ok(&bytes[..]), elapsed, finished)
                    .await
            }
            Err(e) => self.handler.handle(id, Err(e), elapsed, finished).await,
        }
    }
}
