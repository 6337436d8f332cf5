use crate::catalog::{PairSource, TradingPairCatalog};
use crate::config::IngestConfig;
use crate::connection::{Connector, WsConnector};
use crate::error::Error;
use crate::handler::VenueHandler;
use crate::job::JobContext;
use crate::metrics::Metrics;
use crate::shard_set::ShardSet;
use crate::snapshot::{SnapshotBootstrapper, SnapshotEndpoint};
use crate::types::{OutputSender, StreamKind, TradingPair};
use chrono::Utc;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs market-data ingestion for one venue.
///
/// For each stream kind the supervisor keeps a [`ShardSet`] matched to the
/// desired trading pairs: it starts the shards, rebalances them on a schedule
/// or when the tracked list changes, and rebuilds everything after an error
/// that escapes the shards. Alongside, a [`SnapshotBootstrapper`] keeps order
/// books seeded with REST snapshots. Everything lands on one output channel.
///
/// Cancelling the supervisor's token (directly, through
/// [`shutdown`](Self::shutdown) or through an [`IngestionHandle`]) stops every
/// shard and closes every connection before the `listen*` calls return.
///
/// # Example
/// ```ignore
/// let (tx, mut rx) = output_channel();
/// let supervisor = Arc::new(IngestionSupervisor::new(
///     IngestConfig::builder().trading_pairs(["BTC-USDT"]).build()?,
///     MyVenue,
///     Arc::new(StaticCatalog::default()),
///     Arc::new(RestSnapshotEndpoint::new(url, Duration::from_secs(10))?),
///     tx,
/// ));
/// let handle = supervisor.clone().spawn();
/// while let Some(msg) = rx.recv().await { /* feed the book */ }
/// handle.shutdown().await;
/// ```
pub struct IngestionSupervisor<H: VenueHandler, C: Connector = WsConnector> {
    handler: Arc<H>,
    connector: Arc<C>,
    config: IngestConfig,
    pairs: PairSource,
    snapshots: SnapshotBootstrapper<H>,
    output: OutputSender,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl<H: VenueHandler> IngestionSupervisor<H, WsConnector> {
    /// Supervisor over real WebSocket connections built from `config.connection`
    pub fn new(
        config: IngestConfig,
        handler: H,
        catalog: Arc<dyn TradingPairCatalog>,
        snapshot_endpoint: Arc<dyn SnapshotEndpoint>,
        output: OutputSender,
    ) -> Self {
        let connector = WsConnector::new(config.connection.clone());
        Self::with_connector(config, handler, connector, catalog, snapshot_endpoint, output)
    }
}

impl<H: VenueHandler, C: Connector> IngestionSupervisor<H, C> {
    pub fn with_connector(
        config: IngestConfig,
        handler: H,
        connector: C,
        catalog: Arc<dyn TradingPairCatalog>,
        snapshot_endpoint: Arc<dyn SnapshotEndpoint>,
        output: OutputSender,
    ) -> Self {
        let handler = Arc::new(handler);
        let metrics = Arc::new(Metrics::new());
        let snapshots = SnapshotBootstrapper::new(
            handler.clone(),
            snapshot_endpoint,
            output.clone(),
            config.snapshot.clone(),
        )
        .with_schedule(config.rebalance_schedule)
        .with_backoff(config.supervisor_backoff.clone())
        .with_metrics(metrics.clone());

        Self {
            pairs: PairSource::new(config.trading_pairs.clone(), catalog),
            handler,
            connector: Arc::new(connector),
            config,
            snapshots,
            output,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn snapshots(&self) -> &SnapshotBootstrapper<H> {
        &self.snapshots
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pairs per shard: the configured override, else the venue's limit
    pub fn max_pairs_per_shard(&self) -> usize {
        self.config
            .max_pairs_per_shard
            .unwrap_or_else(|| self.handler.max_pairs_per_shard())
    }

    pub fn tracked_pairs(&self) -> Vec<TradingPair> {
        self.pairs.tracked()
    }

    /// Replace the tracked pairs. Running stream kinds rebalance right away
    /// and new pairs get their first snapshot without waiting for the hour.
    /// An empty list switches back to the catalog.
    pub fn set_tracked_pairs<I, P>(&self, pairs: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<TradingPair>,
    {
        self.pairs
            .set_tracked(pairs.into_iter().map(Into::into).collect());
    }

    /// Request shutdown of everything started from this supervisor
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn listen_for_order_book_diffs(&self) -> Result<(), Error> {
        self.listen(StreamKind::Depth).await
    }

    pub async fn listen_for_trades(&self) -> Result<(), Error> {
        self.listen(StreamKind::Trade).await
    }

    pub async fn listen_for_order_book_snapshots(&self) -> Result<(), Error> {
        self.snapshots.refresh_loop(&self.pairs, &self.cancel).await
    }

    /// Ingest one stream kind until cancelled.
    ///
    /// Never returns `Ok`: after cancellation it stops all shards and returns
    /// [`Error::ShuttingDown`]. Any other error is logged, the shards are
    /// stopped and everything is rebuilt after the supervisor backoff.
    pub async fn listen(&self, kind: StreamKind) -> Result<(), Error> {
        let ctx = Arc::new(JobContext {
            kind,
            handler: self.handler.clone(),
            connector: self.connector.clone(),
            keep_alive: self.config.keep_alive.clone(),
            backoff: self.config.shard_backoff.clone(),
            output: self.output.clone(),
            metrics: self.metrics.clone(),
        });
        let mut shards = ShardSet::new(ctx, self.max_pairs_per_shard(), self.cancel.child_token());
        let mut tracked_rx = self.pairs.subscribe();
        let mut attempt: u32 = 0;

        info!("[{}] Listening (max {} pairs per shard)", kind, shards.capacity());

        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => Err(Error::ShuttingDown),
                result = self.steady_state(&mut shards, &mut tracked_rx, &mut attempt) => result,
            };
            let error = match outcome {
                Ok(never) => match never {},
                Err(e) => e,
            };

            if matches!(error, Error::ShuttingDown) {
                shards.stop_all().await;
                info!("[{}] Stopped", kind);
                return Err(Error::ShuttingDown);
            }

            let delay = self.config.supervisor_backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            self.metrics.record_supervisor_restart();
            error!(
                "[{}] Unexpected error with WebSocket connection: {}. Retrying after {:?}...",
                kind, error, delay
            );

            shards.stop_all().await;

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[{}] Stopped", kind);
                    return Err(Error::ShuttingDown);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn steady_state(
        &self,
        shards: &mut ShardSet<H, C>,
        tracked_rx: &mut watch::Receiver<Vec<TradingPair>>,
        attempt: &mut u32,
    ) -> Result<Infallible, Error> {
        let kind = shards.kind();

        tracked_rx.borrow_and_update();
        let desired = self.pairs.desired().await?;
        shards.start_all(&desired).await;
        *attempt = 0;

        loop {
            let delay = self.config.rebalance_schedule.next_delay(Utc::now());
            debug!("[{}] Next rebalance in {:?}", kind, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => debug!("[{}] Scheduled rebalance", kind),
                fault = shards.next_fault() => return Err(fault),
                Ok(()) = tracked_rx.changed() => {
                    tracked_rx.borrow_and_update();
                    info!("[{}] Tracked pairs changed, rebalancing", kind);
                }
            }

            let desired = self.pairs.desired().await?;
            shards.rebalance(&desired);
        }
    }

    /// Run diffs, trades and snapshot refresh as background tasks.
    pub fn spawn(self: Arc<Self>) -> IngestionHandle {
        let mut tasks = Vec::with_capacity(3);

        for kind in StreamKind::ALL {
            let supervisor = self.clone();
            tasks.push(tokio::spawn(async move { supervisor.listen(kind).await }));
        }

        let supervisor = self.clone();
        tasks.push(tokio::spawn(async move {
            supervisor.listen_for_order_book_snapshots().await
        }));

        IngestionHandle {
            cancel: self.cancel.clone(),
            tasks,
        }
    }
}

/// Handle to the tasks started by [`IngestionSupervisor::spawn`].
///
/// Dropping the handle cancels ingestion without waiting for it.
pub struct IngestionHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<Result<(), Error>>>,
}

impl IngestionHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel ingestion and wait until every shard has closed its connection.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            match task.await {
                Ok(Ok(())) | Ok(Err(Error::ShuttingDown)) => {}
                Ok(Err(e)) => warn!("Ingestion task ended with error: {}", e),
                Err(e) => error!("Ingestion task failed: {}", e),
            }
        }
        info!("Ingestion shut down");
    }
}

impl Drop for IngestionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
