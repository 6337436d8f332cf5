//! Keep-alive wrapper around a single stream connection.
//!
//! A [`KeepAliveStream`] is built for one ingestion attempt and consumed once.
//! Consuming it opens the connection, subscribes the current trading pairs,
//! starts a background ping task and then hands every decoded frame to
//! the caller until the stream ends, fails, goes idle for longer than
//! `ping_timeout + ping_interval`, or is cancelled. However the consumption
//! ends, the ping task is stopped and the connection is closed exactly once.

use crate::config::KeepAliveConfig;
use crate::connection::{Connector, FrameReader, FrameWriter};
use crate::error::{Error, ErrorKind};
use crate::handler::VenueHandler;
use crate::metrics::Metrics;
use crate::types::{StreamKind, TradingPair};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a keep-alive stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Built, not yet consumed
    Idle,
    /// Opening the connection
    Connecting,
    /// Connected and reading frames
    Subscribed,
    /// Exit in progress; pinger stopping, connection closing
    Draining,
    /// Spent. Cannot be consumed again.
    Closed,
}

/// Strictly increasing nonces derived from wall-clock milliseconds.
#[derive(Debug)]
pub struct NonceGenerator {
    last: AtomicU64,
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(now_ms()),
        }
    }

    /// Next nonce: the current millisecond, or one past the previous nonce if
    /// the clock has not moved (or moved backwards).
    pub fn next_nonce(&self) -> u64 {
        let now = now_ms();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if now <= prev { prev + 1 } else { now };
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// State shared between a stream and its [`LiveConnection`] handles
#[derive(Debug)]
struct StreamShared {
    kind: StreamKind,
    state: Mutex<StreamState>,
    pairs: watch::Sender<BTreeSet<TradingPair>>,
    nonce: NonceGenerator,
}

impl StreamShared {
    fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
    }

    fn pairs_vec(&self) -> Vec<TradingPair> {
        self.pairs.borrow().iter().cloned().collect()
    }
}

/// Cloneable handle to a keep-alive stream's bookkeeping.
///
/// Shards keep one of these for the connection currently serving them so a
/// rebalance can push a new pair set into it without owning the stream.
#[derive(Debug, Clone)]
pub struct LiveConnection {
    shared: Arc<StreamShared>,
}

impl LiveConnection {
    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    pub fn trading_pairs(&self) -> BTreeSet<TradingPair> {
        self.shared.pairs.borrow().clone()
    }

    /// Replace the pair set. Only the record changes here; if the stream is
    /// subscribed, its read loop sends the handler's (un)subscription frames
    /// for the difference.
    pub fn set_trading_pairs(&self, pairs: BTreeSet<TradingPair>) {
        self.shared.pairs.send_if_modified(|current| {
            if *current == pairs {
                false
            } else {
                *current = pairs;
                true
            }
        });
    }
}

/// One streaming connection with keep-alive pings and an idle-read watchdog.
pub struct KeepAliveStream<H: VenueHandler, C: Connector> {
    handler: Arc<H>,
    connector: Arc<C>,
    config: KeepAliveConfig,
    shared: Arc<StreamShared>,
    metrics: Option<(Arc<Metrics>, usize)>,
}

impl<H: VenueHandler, C: Connector> KeepAliveStream<H, C> {
    pub fn new(
        kind: StreamKind,
        pairs: BTreeSet<TradingPair>,
        handler: Arc<H>,
        connector: Arc<C>,
        config: KeepAliveConfig,
    ) -> Self {
        let (pairs_tx, _) = watch::channel(pairs);
        Self {
            handler,
            connector,
            config,
            shared: Arc::new(StreamShared {
                kind,
                state: Mutex::new(StreamState::Idle),
                pairs: pairs_tx,
                nonce: NonceGenerator::new(),
            }),
            metrics: None,
        }
    }

    /// Report connection and frame counters for shard `shard`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>, shard: usize) -> Self {
        self.metrics = Some((metrics, shard));
        self
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    pub fn trading_pairs(&self) -> BTreeSet<TradingPair> {
        self.shared.pairs.borrow().clone()
    }

    pub fn set_trading_pairs(&self, pairs: BTreeSet<TradingPair>) {
        self.live_connection().set_trading_pairs(pairs);
    }

    /// Handle for updating the pair set from outside the consuming task.
    pub fn live_connection(&self) -> LiveConnection {
        LiveConnection {
            shared: self.shared.clone(),
        }
    }

    /// Next ping nonce for this stream.
    pub fn next_nonce(&self) -> u64 {
        self.shared.nonce.next_nonce()
    }

    /// Consume the stream, passing every decoded frame to `on_message`.
    ///
    /// Returns `Ok(())` when the remote end closes the stream,
    /// [`Error::Timeout`] when nothing arrives within the read deadline and
    /// [`Error::ShuttingDown`] when `cancel` fires. A second call, concurrent
    /// or after the first one finished, fails with [`Error::Reentrancy`].
    pub async fn run<F>(&self, cancel: &CancellationToken, mut on_message: F) -> Result<(), Error>
    where
        F: FnMut(Value) + Send,
    {
        self.begin()?;
        // Marks the stream Closed on every exit from here on
        let mut session = Session {
            shared: self.shared.clone(),
            writer: None,
            pinger: None,
            close_timeout: self.config.ping_timeout,
        };

        let url = self.handler.stream_url(self.shared.kind).await;
        let (writer, mut reader) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::ShuttingDown),
            result = self.connector.connect(&url) => result?,
        };

        if let Some((metrics, shard)) = &self.metrics {
            metrics.record_connection();
            metrics.update_shard(self.shared.kind, *shard, |s| {
                s.is_connected = true;
                s.last_connected_at = Some(Instant::now());
            });
        }

        let writer = Arc::new(AsyncMutex::new(writer));
        session.writer = Some(writer.clone());

        let result = self
            .read_loop(&writer, &mut reader, &mut session, cancel, &mut on_message)
            .await;

        session.shutdown().await;
        result
    }

    fn begin(&self) -> Result<(), Error> {
        let mut state = self.shared.state.lock();
        match *state {
            StreamState::Idle => {
                *state = StreamState::Connecting;
                Ok(())
            }
            StreamState::Closed => Err(Error::Reentrancy("stream already consumed")),
            _ => Err(Error::Reentrancy("iterator already in use")),
        }
    }

    async fn read_loop<F>(
        &self,
        writer: &Arc<AsyncMutex<C::Writer>>,
        reader: &mut C::Reader,
        session: &mut Session<C::Writer>,
        cancel: &CancellationToken,
        on_message: &mut F,
    ) -> Result<(), Error>
    where
        F: FnMut(Value) + Send,
    {
        let kind = self.shared.kind;
        let mut pairs_rx = self.shared.pairs.subscribe();
        let mut subscribed = pairs_rx.borrow_and_update().clone();

        if !subscribed.is_empty() {
            let pairs: Vec<TradingPair> = subscribed.iter().cloned().collect();
            if let Some(msg) = self.handler.subscription_message(kind, &pairs) {
                let send = async { writer.lock().await.send_text(msg).await };
                match timeout(self.config.ping_timeout, send).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(Error::Timeout {
                            kind,
                            pairs,
                            elapsed_ms: self.config.ping_timeout.as_millis() as u64,
                        })
                    }
                }
                debug!("[{}] Subscribed {} pairs", kind, pairs.len());
            }
        }
        self.shared.set_state(StreamState::Subscribed);

        session.pinger = Some(tokio::spawn(ping_loop(
            writer.clone(),
            self.handler.clone(),
            self.shared.clone(),
            self.config.ping_interval,
            self.metrics.as_ref().map(|(m, _)| m.clone()),
        )));

        let read_deadline = self.config.read_deadline();
        let mut deadline = tokio::time::Instant::now() + read_deadline;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("[{}] Stream cancelled", kind);
                    return Err(Error::ShuttingDown);
                }

                Ok(()) = pairs_rx.changed() => {
                    let next = pairs_rx.borrow_and_update().clone();
                    self.send_subscription_delta(writer, &subscribed, &next).await;
                    subscribed = next;
                }

                frame = timeout_at(deadline, reader.next_frame()) => {
                    match frame {
                        Err(_) => {
                            warn!(
                                kind = %kind,
                                pairs = ?self.shared.pairs_vec(),
                                "Message recv() timed out after {:?}",
                                read_deadline
                            );
                            if let Some((metrics, _)) = &self.metrics {
                                metrics.record_timeout();
                            }
                            return Err(Error::Timeout {
                                kind,
                                pairs: self.shared.pairs_vec(),
                                elapsed_ms: read_deadline.as_millis() as u64,
                            });
                        }
                        Ok(None) => {
                            info!("[{}] Stream ended by remote", kind);
                            return Ok(());
                        }
                        // A frame arrived but could not be read as text
                        Ok(Some(Err(e))) if e.kind() == ErrorKind::Protocol => {
                            deadline = tokio::time::Instant::now() + read_deadline;
                            self.record_frame(true);
                            warn!("[{}] Skipping undecodable frame: {}", kind, e);
                        }
                        Ok(Some(Err(e))) => return Err(e),
                        Ok(Some(Ok(text))) => {
                            deadline = tokio::time::Instant::now() + read_deadline;
                            match serde_json::from_str::<Value>(&text) {
                                Ok(value) => {
                                    self.record_frame(false);
                                    on_message(value);
                                }
                                Err(e) => {
                                    self.record_frame(true);
                                    warn!("[{}] Skipping undecodable frame ({}): {:.200}", kind, e, text);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn record_frame(&self, undecodable: bool) {
        if let Some((metrics, shard)) = &self.metrics {
            metrics.record_frame_received(self.shared.kind, *shard);
            if undecodable {
                metrics.record_unrecognized();
            }
        }
    }

    /// Send the (un)subscription frames for the difference between two pair
    /// sets. Gives up after `ping_timeout`; a writer that stalls that long is
    /// caught by the read deadline.
    async fn send_subscription_delta(
        &self,
        writer: &Arc<AsyncMutex<C::Writer>>,
        previous: &BTreeSet<TradingPair>,
        next: &BTreeSet<TradingPair>,
    ) {
        let kind = self.shared.kind;
        let removed: Vec<TradingPair> = previous.difference(next).cloned().collect();
        let added: Vec<TradingPair> = next.difference(previous).cloned().collect();

        let mut frames = Vec::new();
        if !removed.is_empty() {
            frames.extend(self.handler.unsubscription_message(kind, &removed));
        }
        if !added.is_empty() {
            frames.extend(self.handler.subscription_message(kind, &added));
        }

        let send = async {
            let mut writer = writer.lock().await;
            for frame in frames {
                writer.send_text(frame).await?;
            }
            Ok::<(), Error>(())
        };
        match timeout(self.config.ping_timeout, send).await {
            Ok(Ok(())) => {}
            // A dead connection shows up on the read path
            Ok(Err(e)) => {
                warn!("[{}] Failed to send subscription update: {}", kind, e);
                return;
            }
            Err(_) => {
                warn!(
                    "[{}] Subscription update not sent within {:?}",
                    kind, self.config.ping_timeout
                );
                return;
            }
        }
        debug!(
            "[{}] Pair set updated (+{} -{})",
            kind,
            added.len(),
            removed.len()
        );
    }
}

async fn ping_loop<H: VenueHandler, W: FrameWriter>(
    writer: Arc<AsyncMutex<W>>,
    handler: Arc<H>,
    shared: Arc<StreamShared>,
    interval: Duration,
    metrics: Option<Arc<Metrics>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let mut writer = writer.lock().await;
        if !writer.is_open() {
            continue;
        }
        let nonce = shared.nonce.next_nonce();
        match writer.send_text(handler.ping_message(nonce)).await {
            Ok(()) => {
                trace!("[{}] Ping sent (nonce {})", shared.kind, nonce);
                if let Some(metrics) = &metrics {
                    metrics.record_ping();
                }
            }
            Err(e) => debug!("[{}] Ping failed: {}", shared.kind, e),
        }
    }
}

/// Owns the ping task and the writer for the duration of one consumption.
///
/// `shutdown` is the normal exit. `Drop` covers the consuming future being
/// dropped mid-flight; it cannot await, so the close is spawned.
struct Session<W: FrameWriter> {
    shared: Arc<StreamShared>,
    writer: Option<Arc<AsyncMutex<W>>>,
    pinger: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl<W: FrameWriter> Session<W> {
    async fn shutdown(&mut self) {
        self.shared.set_state(StreamState::Draining);
        if let Some(pinger) = self.pinger.take() {
            pinger.abort();
            let _ = pinger.await;
        }
        if let Some(writer) = self.writer.take() {
            close_writer(writer, self.shared.kind, self.close_timeout).await;
        }
        self.shared.set_state(StreamState::Closed);
    }
}

async fn close_writer<W: FrameWriter>(writer: Arc<AsyncMutex<W>>, kind: StreamKind, limit: Duration) {
    let close = async { writer.lock().await.close().await };
    match timeout(limit, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("[{}] Close failed: {}", kind, e),
        Err(_) => warn!("[{}] Close did not finish within {:?}", kind, limit),
    }
}

impl<W: FrameWriter> Drop for Session<W> {
    fn drop(&mut self) {
        if let Some(pinger) = self.pinger.take() {
            pinger.abort();
        }
        if let Some(writer) = self.writer.take() {
            self.shared.set_state(StreamState::Draining);
            let kind = self.shared.kind;
            let limit = self.close_timeout;
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(close_writer(writer, kind, limit));
            }
        }
        self.shared.set_state(StreamState::Closed);
    }
}
