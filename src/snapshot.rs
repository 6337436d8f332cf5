//! REST order-book snapshots.
//!
//! Stream diffs alone cannot rebuild a book; the reconstructor needs a full
//! snapshot to start from and periodically to resync against. The
//! [`SnapshotBootstrapper`] fetches those through a [`SnapshotEndpoint`] and
//! puts them on the same output channel as the stream data.

use crate::auth::AuthProvider;
use crate::catalog::PairSource;
use crate::config::{BackoffConfig, RebalanceSchedule, SnapshotConfig};
use crate::error::Error;
use crate::handler::VenueHandler;
use crate::metrics::Metrics;
use crate::rest::RestClient;
use crate::types::{NormalizedMessage, OutputSender, TradingPair};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Fetches one raw order-book snapshot per call.
#[async_trait]
pub trait SnapshotEndpoint: Send + Sync {
    async fn get(&self, pair: &TradingPair) -> Result<Value, Error>;
}

/// [`SnapshotEndpoint`] over HTTP GET.
///
/// `url_template` must contain a `{pair}` placeholder, e.g.
/// `https://api.venue.com/depth?symbol={pair}`.
pub struct RestSnapshotEndpoint {
    rest: RestClient,
    url_template: String,
}

impl RestSnapshotEndpoint {
    pub fn new(url_template: impl Into<String>, request_timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            rest: RestClient::new(request_timeout)?,
            url_template: url_template.into(),
        })
    }

    /// Sign every request with `auth`
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.rest.set_auth(auth);
        self
    }

    pub fn url_for(&self, pair: &TradingPair) -> String {
        self.url_template.replace("{pair}", pair.as_str())
    }
}

#[async_trait]
impl SnapshotEndpoint for RestSnapshotEndpoint {
    async fn get(&self, pair: &TradingPair) -> Result<Value, Error> {
        self.rest.get_json(&self.url_for(pair)).await
    }
}

/// Seeds and periodically refreshes order books from REST snapshots.
pub struct SnapshotBootstrapper<H: VenueHandler> {
    handler: Arc<H>,
    endpoint: Arc<dyn SnapshotEndpoint>,
    output: OutputSender,
    config: SnapshotConfig,
    schedule: RebalanceSchedule,
    backoff: BackoffConfig,
    metrics: Arc<Metrics>,
}

impl<H: VenueHandler> SnapshotBootstrapper<H> {
    pub fn new(
        handler: Arc<H>,
        endpoint: Arc<dyn SnapshotEndpoint>,
        output: OutputSender,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            handler,
            endpoint,
            output,
            config,
            schedule: RebalanceSchedule::default(),
            backoff: BackoffConfig::default(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// When sweeps happen (top of the hour by default)
    pub fn with_schedule(mut self, schedule: RebalanceSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Delay before retrying a sweep that could not start
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Raw snapshot payload for `pair`
    pub async fn fetch(&self, pair: &TradingPair) -> Result<Value, Error> {
        self.endpoint.get(pair).await
    }

    /// Convert a raw payload into a Snapshot message
    pub fn snapshot_message(
        &self,
        pair: &TradingPair,
        payload: Value,
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedMessage, Error> {
        self.handler.decode_snapshot(pair, payload, received_at)
    }

    /// Fetch and convert one snapshot without publishing it.
    pub async fn initial_snapshot(&self, pair: &TradingPair) -> Result<NormalizedMessage, Error> {
        let payload = self.fetch(pair).await?;
        self.snapshot_message(pair, payload, Utc::now())
    }

    /// Refresh snapshots until cancelled.
    ///
    /// Every scheduled window all desired pairs are swept. Pairs that show up
    /// in the tracked list between windows are fetched right away. Failures
    /// for single pairs are logged and skipped; failing to resolve the pair
    /// list backs off and retries. Returns [`Error::ShuttingDown`] once
    /// `cancel` fires.
    pub async fn refresh_loop(&self, pairs: &PairSource, cancel: &CancellationToken) -> Result<(), Error> {
        let mut tracked_rx = pairs.subscribe();
        let mut attempt: u32 = 0;

        loop {
            tracked_rx.borrow_and_update();

            let desired = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ShuttingDown),
                result = pairs.desired() => result,
            };
            let desired = match desired {
                Ok(desired) => desired,
                Err(e) => {
                    self.metrics.record_error();
                    let delay = self.backoff.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    error!("Unexpected error resolving snapshot pairs: {}. Retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::ShuttingDown),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            attempt = 0;

            let published = self.sweep(&desired, cancel).await?;
            info!("Snapshot sweep done: {}/{} pairs", published, desired.len());

            let mut known: HashSet<TradingPair> = desired.into_iter().collect();
            let window = tokio::time::sleep(self.schedule.next_delay(Utc::now()));
            tokio::pin!(window);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::ShuttingDown),
                    _ = &mut window => break,
                    Ok(()) = tracked_rx.changed() => {
                        let tracked = tracked_rx.borrow_and_update().clone();
                        let new_pairs: Vec<TradingPair> = tracked
                            .into_iter()
                            .filter(|p| known.insert(p.clone()))
                            .collect();
                        if !new_pairs.is_empty() {
                            debug!("Bootstrapping {} newly tracked pairs", new_pairs.len());
                            self.sweep(&new_pairs, cancel).await?;
                        }
                    }
                }
            }
        }
    }

    /// Fetch and publish a snapshot for each pair, pausing between requests.
    /// Returns how many were published; fails only when cancelled.
    pub async fn sweep(&self, pairs: &[TradingPair], cancel: &CancellationToken) -> Result<usize, Error> {
        let mut published = 0;

        for (i, pair) in pairs.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::ShuttingDown),
                    _ = tokio::time::sleep(self.config.request_delay) => {}
                }
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ShuttingDown),
                result = self.fetch(pair) => result,
            };

            let message = fetched.and_then(|payload| self.snapshot_message(pair, payload, Utc::now()));
            match message {
                Ok(message) => {
                    if self.output.send(message).is_err() {
                        debug!("Output receiver dropped, snapshot for {} discarded", pair);
                        continue;
                    }
                    published += 1;
                    self.metrics.record_snapshot_published();
                    debug!("Saved order book snapshot for {}", pair);
                }
                Err(e) => {
                    self.metrics.record_snapshot_failure();
                    error!(pair = %pair, "Unexpected error fetching order book snapshot for {}: {}", pair, e);
                }
            }
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::testing::{wait_until, MockCatalog, MockSnapshots, TestVenue};
    use crate::types::{output_channel, MessageKind, OutputReceiver};
    use tokio::time::Instant;

    fn bootstrapper(endpoint: &Arc<MockSnapshots>) -> (SnapshotBootstrapper<TestVenue>, OutputReceiver) {
        let (tx, rx) = output_channel();
        let bootstrapper = SnapshotBootstrapper::new(
            Arc::new(TestVenue),
            endpoint.clone(),
            tx,
            SnapshotConfig::default(),
        )
        .with_schedule(RebalanceSchedule::Every(Duration::from_secs(3600)));
        (bootstrapper, rx)
    }

    fn pairs(names: &[&str]) -> Vec<TradingPair> {
        names.iter().map(|n| TradingPair::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_initial_snapshot() {
        let endpoint = Arc::new(MockSnapshots::new());
        let (bootstrapper, _rx) = bootstrapper(&endpoint);

        let msg = bootstrapper
            .initial_snapshot(&TradingPair::from("BTC-USDT"))
            .await
            .unwrap();
        assert_eq!(msg.kind, MessageKind::Snapshot);
        assert_eq!(msg.trading_pair.as_str(), "BTC-USDT");
        assert_eq!(msg.sequence_id, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_continues_past_failures_and_paces_requests() {
        let endpoint = Arc::new(MockSnapshots::new());
        endpoint.fail_pair("B");
        let (bootstrapper, mut rx) = bootstrapper(&endpoint);

        let published = bootstrapper
            .sweep(&pairs(&["A", "B", "C"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(published, 2);
        assert_eq!(rx.recv().await.unwrap().trading_pair.as_str(), "A");
        assert_eq!(rx.recv().await.unwrap().trading_pair.as_str(), "C");

        let requests = endpoint.requests();
        assert_eq!(requests.len(), 3);
        for window in requests.windows(2) {
            assert_eq!(window[1].1 - window[0].1, Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_sweeps_each_window() {
        let endpoint = Arc::new(MockSnapshots::new());
        let (bootstrapper, _rx) = bootstrapper(&endpoint);
        let source = PairSource::new(pairs(&["A", "B"]), Arc::new(StaticCatalog::default()));
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bootstrapper.refresh_loop(&source, &cancel).await })
        };

        wait_until(|| endpoint.requests().len() == 2).await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        wait_until(|| endpoint.requests().len() == 4).await;
        // Second sweep starts one window after the first one ended
        let second_sweep_at = endpoint.requests()[2].1 - started;
        assert_eq!(second_sweep_at, Duration::from_secs(5 + 3600));

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(Error::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newly_tracked_pairs_are_bootstrapped_immediately() {
        let endpoint = Arc::new(MockSnapshots::new());
        let (bootstrapper, _rx) = bootstrapper(&endpoint);
        let source = PairSource::new(pairs(&["A"]), Arc::new(StaticCatalog::default()));
        let cancel = CancellationToken::new();

        let task = {
            let source = source.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bootstrapper.refresh_loop(&source, &cancel).await })
        };

        wait_until(|| endpoint.requests().len() == 1).await;
        source.set_tracked(pairs(&["A", "B"]));
        wait_until(|| endpoint.requests().len() == 2).await;

        assert_eq!(endpoint.requested_pairs(), vec!["A", "B"]);
        assert!(endpoint.requests()[1].1 - endpoint.requests()[0].1 < Duration::from_secs(60));

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_failure_backs_off_and_retries() {
        let endpoint = Arc::new(MockSnapshots::new());
        let (bootstrapper, _rx) = bootstrapper(&endpoint);
        let catalog = Arc::new(MockCatalog::new(&["X"]));
        catalog.fail_next(1);
        let source = PairSource::new(Vec::new(), catalog.clone());
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bootstrapper.refresh_loop(&source, &cancel).await })
        };

        wait_until(|| endpoint.requests().len() == 1).await;
        assert_eq!(catalog.calls(), 2);
        assert_eq!(endpoint.requests()[0].1 - started, Duration::from_secs(5));

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_rest_endpoint_fills_pair_into_url() {
        let (base, server) = crate::testing::serve_once(200, r#"{"sequence": 12, "bids": []}"#).await;
        let endpoint =
            RestSnapshotEndpoint::new(format!("{}/depth/{{pair}}?limit=100", base), Duration::from_secs(5))
                .unwrap();

        let payload = endpoint.get(&"BTC-USDT".into()).await.unwrap();
        assert_eq!(payload["sequence"], 12);
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /depth/BTC-USDT?limit=100 "));
    }
}
