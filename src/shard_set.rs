use crate::connection::Connector;
use crate::error::Error;
use crate::handler::VenueHandler;
use crate::job::{run_shard_job, JobContext};
use crate::shard::{partition, plan_rebalance, ShardSlot};
use crate::types::{StreamKind, TradingPair};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `stop_all` waits for a job's own cleanup before aborting it
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Summary of one [`ShardSet::rebalance`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    pub shards_updated: usize,
    pub shards_created: usize,
    pub pairs_added: usize,
    pub pairs_removed: usize,
}

struct Shard {
    slot: Arc<ShardSlot>,
    cancel: CancellationToken,
    job: JoinHandle<()>,
}

/// The shards serving one stream kind.
///
/// Owned by a single supervisor loop; the shard table is only mutated through
/// `&mut self`. Each shard runs its own job task over a [`ShardSlot`].
pub struct ShardSet<H: VenueHandler, C: Connector> {
    ctx: Arc<JobContext<H, C>>,
    capacity: usize,
    cancel: CancellationToken,
    shards: Vec<Shard>,
    faults_tx: mpsc::UnboundedSender<(usize, Error)>,
    faults_rx: mpsc::UnboundedReceiver<(usize, Error)>,
}

impl<H: VenueHandler, C: Connector> ShardSet<H, C> {
    /// Shard jobs get child tokens of `cancel`, so cancelling it stops them all.
    pub(crate) fn new(ctx: Arc<JobContext<H, C>>, capacity: usize, cancel: CancellationToken) -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            capacity: capacity.max(1),
            cancel,
            shards: Vec::new(),
            faults_tx,
            faults_rx,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.ctx.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Partition `desired` into shards of at most `capacity` pairs and start
    /// a job for each. Any running shards are stopped first.
    pub async fn start_all(&mut self, desired: &[TradingPair]) {
        if !self.shards.is_empty() {
            self.stop_all().await;
        }

        for pairs in partition(desired, self.capacity) {
            self.spawn_shard(pairs);
        }

        info!(
            "[{}] Started {} shards for {} pairs",
            self.kind(),
            self.shards.len(),
            self.total_pairs()
        );
    }

    /// Move the shards to `desired` with minimal disruption.
    ///
    /// Removed pairs are dropped from their shard in place, existing pairs
    /// stay where they are, new pairs go to the least-loaded shard and new
    /// shards are opened only when every shard is full.
    pub fn rebalance(&mut self, desired: &[TradingPair]) -> RebalanceReport {
        let current: Vec<BTreeSet<TradingPair>> =
            self.shards.iter().map(|s| s.slot.trading_pairs()).collect();
        let plan = plan_rebalance(&current, desired, self.capacity);

        let report = RebalanceReport {
            shards_updated: plan.updates.len(),
            shards_created: plan.new_shards.len(),
            pairs_added: plan.pairs_added,
            pairs_removed: plan.pairs_removed,
        };

        for (index, pairs) in plan.updates {
            let count = pairs.len();
            self.shards[index].slot.update_trading_pairs(pairs);
            self.ctx
                .metrics
                .update_shard(self.kind(), index, |s| s.pair_count = count);
            debug!("[{} SHARD-{}] Now {} pairs", self.kind(), index, count);
        }

        for pairs in plan.new_shards {
            self.spawn_shard(pairs);
        }

        self.ctx.metrics.record_rebalance(report.shards_created);
        info!(
            "[{}] Rebalanced: +{} -{} pairs, {} shards updated, {} created ({} total)",
            self.kind(),
            report.pairs_added,
            report.pairs_removed,
            report.shards_updated,
            report.shards_created,
            self.shards.len()
        );
        report
    }

    /// Cancel every shard job, wait for its cleanup and forget all shards.
    pub async fn stop_all(&mut self) {
        let shards = std::mem::take(&mut self.shards);
        if shards.is_empty() {
            return;
        }

        for shard in &shards {
            shard.cancel.cancel();
        }

        for shard in shards {
            let index = shard.slot.index();
            let mut job = shard.job;
            if tokio::time::timeout(STOP_GRACE, &mut job).await.is_err() {
                warn!("[{} SHARD-{}] Job did not stop in time, aborting", self.kind(), index);
                job.abort();
            }
        }

        // Faults of the jobs just stopped no longer apply
        while self.faults_rx.try_recv().is_ok() {}

        self.ctx.metrics.clear_shards(self.kind());
        info!("[{}] All shards stopped", self.kind());
    }

    /// Wait for a shard job that stopped on an error it cannot retry.
    ///
    /// Such a shard keeps its pairs but no longer serves them; the caller is
    /// expected to rebuild the set.
    pub async fn next_fault(&mut self) -> Error {
        match self.faults_rx.recv().await {
            Some((index, error)) => {
                error!("[{} SHARD-{}] Job gave up: {}", self.kind(), index, error);
                error
            }
            // The set holds a sender, so the channel never closes
            None => std::future::pending().await,
        }
    }

    fn spawn_shard(&mut self, pairs: BTreeSet<TradingPair>) {
        let index = self.shards.len();
        let count = pairs.len();
        let slot = Arc::new(ShardSlot::new(index, pairs));
        let cancel = self.cancel.child_token();
        let faults = self.faults_tx.clone();
        let run = run_shard_job(self.ctx.clone(), slot.clone(), cancel.clone());
        let job = tokio::spawn(async move {
            if let Some(error) = run.await {
                let _ = faults.send((index, error));
            }
        });

        self.ctx
            .metrics
            .update_shard(self.kind(), index, |s| s.pair_count = count);
        debug!("[{} SHARD-{}] Spawned with {} pairs", self.kind(), index, count);

        self.shards.push(Shard { slot, cancel, job });
    }

    // ========== Accessors ==========

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_pairs(&self, index: usize) -> Option<BTreeSet<TradingPair>> {
        self.shards.get(index).map(|s| s.slot.trading_pairs())
    }

    /// Every shard's pairs, by index
    pub fn assignments(&self) -> Vec<BTreeSet<TradingPair>> {
        self.shards.iter().map(|s| s.slot.trading_pairs()).collect()
    }

    pub fn total_pairs(&self) -> usize {
        self.shards.iter().map(|s| s.slot.pair_count()).sum()
    }

    /// Whether shard `index` currently has a connection attached
    pub fn is_live(&self, index: usize) -> bool {
        self.shards.get(index).is_some_and(|s| s.slot.is_live())
    }
}

impl<H: VenueHandler, C: Connector> Drop for ShardSet<H, C> {
    fn drop(&mut self) {
        for shard in &self.shards {
            shard.cancel.cancel();
            shard.job.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, KeepAliveConfig};
    use crate::metrics::Metrics;
    use crate::testing::{wait_until, MockConnector, TestVenue};
    use crate::types::{output_channel, OutputReceiver};
    use serde_json::json;
    use tokio::time::Instant;

    fn pairs(names: &[&str]) -> Vec<TradingPair> {
        names.iter().map(|n| TradingPair::from(*n)).collect()
    }

    fn set(names: &[&str]) -> BTreeSet<TradingPair> {
        pairs(names).into_iter().collect()
    }

    fn shard_set(
        connector: &Arc<MockConnector>,
        capacity: usize,
    ) -> (ShardSet<TestVenue, MockConnector>, OutputReceiver) {
        let (output, rx) = output_channel();
        let ctx = Arc::new(JobContext {
            kind: StreamKind::Trade,
            handler: Arc::new(TestVenue),
            connector: connector.clone(),
            keep_alive: KeepAliveConfig::default(),
            backoff: BackoffConfig::default(),
            output,
            metrics: Arc::new(Metrics::new()),
        });
        (ShardSet::new(ctx, capacity, CancellationToken::new()), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_partitions_and_connects() {
        let connector = Arc::new(MockConnector::new());
        let (mut shards, _rx) = shard_set(&connector, 2);

        shards.start_all(&pairs(&["A", "B", "C"])).await;
        assert_eq!(shards.assignments(), vec![set(&["A", "B"]), set(&["C"])]);
        assert_eq!(shards.total_pairs(), 3);

        wait_until(|| connector.connection_count() == 2).await;
        wait_until(|| shards.is_live(0) && shards.is_live(1)).await;

        shards.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_updates_live_connections_in_place() {
        let connector = Arc::new(MockConnector::new());
        let (mut shards, _rx) = shard_set(&connector, 2);
        shards.start_all(&pairs(&["A", "B", "C"])).await;
        wait_until(|| {
            connector.connection_count() == 2
                && connector
                    .connections()
                    .iter()
                    .all(|c| !c.subscribed_pairs().is_empty())
        })
        .await;

        let report = shards.rebalance(&pairs(&["A", "C", "D"]));
        assert_eq!(
            report,
            RebalanceReport {
                shards_updated: 1,
                shards_created: 0,
                pairs_added: 1,
                pairs_removed: 1,
            }
        );
        assert_eq!(shards.assignments(), vec![set(&["A", "D"]), set(&["C"])]);

        // No reconnect; shard 0 got the delta on its existing connection
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.connection_count(), 2);
        let sent = connector.connection(0).sent();
        assert!(sent.iter().any(|f| f.contains("unsubscribe") && f.contains("\"B\"")));
        assert!(sent.iter().any(|f| f.contains("\"subscribe\"") && f.contains("\"D\"")));

        shards.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_opens_new_shard_when_full() {
        let connector = Arc::new(MockConnector::new());
        let (mut shards, _rx) = shard_set(&connector, 2);
        shards.start_all(&pairs(&["A", "B"])).await;

        let report = shards.rebalance(&pairs(&["A", "B", "C"]));
        assert_eq!(report.shards_created, 1);
        assert_eq!(shards.shard_count(), 2);
        assert_eq!(shards.shard_pairs(1), Some(set(&["C"])));

        wait_until(|| connector.connection_count() == 2).await;
        assert_eq!(connector.connection(1).subscribed_pairs(), vec!["C".to_string()]);

        // Same desired set again is a no-op
        assert_eq!(
            shards.rebalance(&pairs(&["A", "B", "C"])),
            RebalanceReport::default()
        );

        shards.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_closes_every_connection() {
        let connector = Arc::new(MockConnector::new());
        let (mut shards, _rx) = shard_set(&connector, 1);
        shards.start_all(&pairs(&["A", "B", "C"])).await;
        wait_until(|| connector.connection_count() == 3).await;

        shards.stop_all().await;
        assert_eq!(shards.shard_count(), 0);
        assert_eq!(connector.open_connections(), 0);
        for conn in connector.connections() {
            assert_eq!(conn.close_count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_replaces_running_shards() {
        let connector = Arc::new(MockConnector::new());
        let (mut shards, _rx) = shard_set(&connector, 10);
        shards.start_all(&pairs(&["A"])).await;
        wait_until(|| connector.connection_count() == 1).await;

        shards.start_all(&pairs(&["B", "C"])).await;
        assert_eq!(connector.connection(0).close_count(), 1);
        assert_eq!(shards.assignments(), vec![set(&["B", "C"])]);

        shards.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_shard_leaves_siblings_alone() {
        let connector = Arc::new(MockConnector::new());
        let (mut shards, mut rx) = shard_set(&connector, 1);
        shards.start_all(&pairs(&["A", "B"])).await;
        wait_until(|| {
            connector.connection_count() == 2
                && connector
                    .connections()
                    .iter()
                    .all(|c| !c.subscribed_pairs().is_empty())
        })
        .await;

        let serving = |pair: &str| {
            connector
                .connections()
                .into_iter()
                .find(|c| c.subscribed_pairs() == vec![pair.to_string()])
                .unwrap()
        };
        let failing = serving("A");
        let sibling = serving("B");

        let failed_at = Instant::now();
        failing.fail();
        wait_until(|| failing.close_count() == 1).await;

        sibling.push_text(json!({"type": "message", "data": {"symbol": "B", "sequence": 3}}).to_string());
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.trading_pair.as_str(), "B");

        // Only the failed shard reconnects, after its 5 s backoff
        wait_until(|| connector.connection_count() == 3).await;
        assert!(failed_at.elapsed() >= Duration::from_secs(5));
        let replacement = connector.connection(2);
        wait_until(|| !replacement.subscribed_pairs().is_empty()).await;
        assert_eq!(replacement.subscribed_pairs(), vec!["A".to_string()]);

        assert_eq!(sibling.close_count(), 0);
        assert!(shards.is_live(1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.connection_count(), 3);

        shards.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_that_gives_up_is_reported() {
        let connector = Arc::new(MockConnector::new());
        connector.script_connect_error(Error::Reentrancy("stream already consumed"));
        let (mut shards, _rx) = shard_set(&connector, 10);
        shards.start_all(&pairs(&["A", "B"])).await;

        let fault = shards.next_fault().await;
        assert!(matches!(fault, Error::Reentrancy(_)));
        assert_eq!(shards.shard_pairs(0), Some(set(&["A", "B"])));
        assert!(!shards.is_live(0));

        // A restart starts from a clean fault queue
        shards.start_all(&pairs(&["A", "B"])).await;
        wait_until(|| connector.connection_count() == 1).await;
        let quiet = tokio::time::timeout(Duration::from_secs(30), shards.next_fault()).await;
        assert!(quiet.is_err());

        shards.stop_all().await;
    }
}
