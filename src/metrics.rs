use crate::types::StreamKind;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters and gauges for the ingestion pipeline.
///
/// Shared as `Arc<Metrics>` by every shard job, the supervisor loops and the
/// snapshot bootstrapper. Use `snapshot()` for a point-in-time view.
///
/// # Example
/// ```ignore
/// let metrics = supervisor.metrics();
/// println!("published: {}", metrics.messages_published());
/// for shard in metrics.snapshot().shards {
///     println!("{} #{}: {} pairs", shard.kind, shard.index, shard.pair_count);
/// }
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    shard_restarts_total: AtomicU64,
    frames_received_total: AtomicU64,
    messages_published_total: AtomicU64,
    pings_sent_total: AtomicU64,
    timeouts_total: AtomicU64,
    errors_total: AtomicU64,
    venue_errors_total: AtomicU64,
    unrecognized_frames_total: AtomicU64,
    rebalances_total: AtomicU64,
    shards_created_total: AtomicU64,
    supervisor_restarts_total: AtomicU64,
    snapshots_published_total: AtomicU64,
    snapshot_failures_total: AtomicU64,

    shard_metrics: RwLock<BTreeMap<(StreamKind, usize), ShardMetrics>>,
}

/// Gauges for one shard of one stream kind
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub kind: StreamKind,
    pub index: usize,
    /// Pairs currently assigned
    pub pair_count: usize,
    pub is_connected: bool,
    pub time_since_connected: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    /// Connection attempts that ended and were retried
    pub restarts: u64,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_message_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(kind: StreamKind, index: usize) -> Self {
        Self {
            kind,
            index,
            pair_count: 0,
            is_connected: false,
            time_since_connected: None,
            time_since_last_message: None,
            restarts: 0,
            last_connected_at: None,
            last_message_at: None,
        }
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_message: self.last_message_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn shard_restarts(&self) -> u64 {
        self.shard_restarts_total.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    /// Normalized messages put on the output channel (stream data only)
    pub fn messages_published(&self) -> u64 {
        self.messages_published_total.load(Ordering::Relaxed)
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent_total.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn venue_errors(&self) -> u64 {
        self.venue_errors_total.load(Ordering::Relaxed)
    }

    pub fn unrecognized_frames(&self) -> u64 {
        self.unrecognized_frames_total.load(Ordering::Relaxed)
    }

    pub fn rebalances(&self) -> u64 {
        self.rebalances_total.load(Ordering::Relaxed)
    }

    pub fn shards_created(&self) -> u64 {
        self.shards_created_total.load(Ordering::Relaxed)
    }

    pub fn supervisor_restarts(&self) -> u64 {
        self.supervisor_restarts_total.load(Ordering::Relaxed)
    }

    pub fn snapshots_published(&self) -> u64 {
        self.snapshots_published_total.load(Ordering::Relaxed)
    }

    pub fn snapshot_failures(&self) -> u64 {
        self.snapshot_failures_total.load(Ordering::Relaxed)
    }

    // ========== Recording ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shard_restart(&self, kind: StreamKind, index: usize) {
        self.shard_restarts_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(kind, index, |s| s.restarts += 1);
    }

    pub(crate) fn record_frame_received(&self, kind: StreamKind, index: usize) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(kind, index, |s| s.last_message_at = Some(Instant::now()));
    }

    pub(crate) fn record_published(&self) {
        self.messages_published_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_venue_error(&self) {
        self.venue_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unrecognized(&self) {
        self.unrecognized_frames_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rebalance(&self, shards_created: usize) {
        self.rebalances_total.fetch_add(1, Ordering::Relaxed);
        self.shards_created_total
            .fetch_add(shards_created as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_supervisor_restart(&self) {
        self.supervisor_restarts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_published(&self) {
        self.snapshots_published_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_failure(&self) {
        self.snapshot_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the gauges of one shard, creating its entry on first use
    pub(crate) fn update_shard(
        &self,
        kind: StreamKind,
        index: usize,
        update_fn: impl FnOnce(&mut ShardMetrics),
    ) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry((kind, index))
            .or_insert_with(|| ShardMetrics::new(kind, index));
        update_fn(entry);
    }

    /// Drop every shard entry of `kind` (after a full stop)
    pub(crate) fn clear_shards(&self, kind: StreamKind) {
        self.shard_metrics.write().retain(|(k, _), _| *k != kind);
    }

    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    pub fn total_pairs(&self, kind: StreamKind) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.kind == kind)
            .map(|s| s.pair_count)
            .sum()
    }

    /// Point-in-time snapshot of everything, for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // One lock for a consistent shard view
        let shards: Vec<ShardMetrics> =
            self.shard_metrics.read().values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            shard_restarts_total: self.shard_restarts_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            messages_published_total: self.messages_published_total.load(Ordering::Acquire),
            pings_sent_total: self.pings_sent_total.load(Ordering::Acquire),
            timeouts_total: self.timeouts_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            venue_errors_total: self.venue_errors_total.load(Ordering::Acquire),
            unrecognized_frames_total: self.unrecognized_frames_total.load(Ordering::Acquire),
            rebalances_total: self.rebalances_total.load(Ordering::Acquire),
            shards_created_total: self.shards_created_total.load(Ordering::Acquire),
            supervisor_restarts_total: self.supervisor_restarts_total.load(Ordering::Acquire),
            snapshots_published_total: self.snapshots_published_total.load(Ordering::Acquire),
            snapshot_failures_total: self.snapshot_failures_total.load(Ordering::Acquire),
            active_connections: shards.iter().filter(|s| s.is_connected).count(),
            shards,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub shard_restarts_total: u64,
    pub frames_received_total: u64,
    pub messages_published_total: u64,
    pub pings_sent_total: u64,
    pub timeouts_total: u64,
    pub errors_total: u64,
    pub venue_errors_total: u64,
    pub unrecognized_frames_total: u64,
    pub rebalances_total: u64,
    pub shards_created_total: u64,
    pub supervisor_restarts_total: u64,
    pub snapshots_published_total: u64,
    pub snapshot_failures_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
