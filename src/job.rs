use crate::config::{BackoffConfig, KeepAliveConfig};
use crate::connection::Connector;
use crate::error::{Error, ErrorKind};
use crate::handler::{VenueHandler, VenueMessage};
use crate::keepalive::KeepAliveStream;
use crate::metrics::Metrics;
use crate::shard::ShardSlot;
use crate::types::{OutputSender, StreamKind};
use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Everything a shard job needs, shared by all shards of one stream kind.
pub(crate) struct JobContext<H: VenueHandler, C: Connector> {
    pub(crate) kind: StreamKind,
    pub(crate) handler: Arc<H>,
    pub(crate) connector: Arc<C>,
    pub(crate) keep_alive: KeepAliveConfig,
    pub(crate) backoff: BackoffConfig,
    pub(crate) output: OutputSender,
    pub(crate) metrics: Arc<Metrics>,
}

/// Clears the slot's live connection however the attempt ends.
struct DetachOnDrop<'a>(&'a ShardSlot);

impl Drop for DetachOnDrop<'_> {
    fn drop(&mut self) {
        self.0.detach();
    }
}

/// Run one shard until cancelled.
///
/// Each attempt consumes a fresh [`KeepAliveStream`] built from the shard's
/// current pairs. Failed attempts are logged and retried after the shard
/// backoff; a panic inside an attempt counts as a failure. Only cancellation
/// and reentrancy errors end the job. A reentrancy error is returned so the
/// owner can rebuild the shard; cancellation returns `None`.
pub(crate) async fn run_shard_job<H: VenueHandler, C: Connector>(
    ctx: Arc<JobContext<H, C>>,
    slot: Arc<ShardSlot>,
    cancel: CancellationToken,
) -> Option<Error> {
    let kind = ctx.kind;
    let shard = slot.index();
    let mut attempt: u32 = 0;

    debug!("[{} SHARD-{}] Job started", kind, shard);

    while !cancel.is_cancelled() {
        let outcome = AssertUnwindSafe(run_attempt(&ctx, &slot, &cancel))
            .catch_unwind()
            .await;

        ctx.metrics
            .update_shard(kind, shard, |s| s.is_connected = false);

        match outcome {
            Ok((reason, delivered)) => {
                if delivered > 0 {
                    attempt = 0;
                }
                match reason.kind() {
                    ErrorKind::ShuttingDown => break,
                    ErrorKind::Reentrancy => {
                        ctx.metrics.record_error();
                        error!(
                            kind = %kind,
                            shard,
                            pairs = ?slot.trading_pairs(),
                            "[{} SHARD-{}] {}; stopping job",
                            kind,
                            shard,
                            reason
                        );
                        return Some(reason);
                    }
                    _ => match reason {
                        Error::StreamEnded(_) => {
                            info!("[{} SHARD-{}] {}, reconnecting", kind, shard, reason)
                        }
                        Error::Timeout { .. } => {
                            ctx.metrics.record_error();
                            error!(
                                kind = %kind,
                                shard,
                                pairs = ?slot.trading_pairs(),
                                "[{} SHARD-{}] Timeout error with WebSocket connection",
                                kind,
                                shard
                            );
                        }
                        e => {
                            ctx.metrics.record_error();
                            error!(
                                kind = %kind,
                                shard,
                                pairs = ?slot.trading_pairs(),
                                "[{} SHARD-{}] Unexpected error with WebSocket connection: {}",
                                kind,
                                shard,
                                e
                            );
                        }
                    },
                }
            }
            Err(panic) => {
                ctx.metrics.record_error();
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("[{} SHARD-{}] Job attempt panicked: {}", kind, shard, msg);
            }
        }

        let delay = ctx.backoff.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        ctx.metrics.record_shard_restart(kind, shard);
        info!("[{} SHARD-{}] Retrying in {:?}", kind, shard, delay);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("[{} SHARD-{}] Job stopped", kind, shard);
    None
}

/// One connection attempt. Returns why it ended and the number of messages
/// published.
async fn run_attempt<H: VenueHandler, C: Connector>(
    ctx: &JobContext<H, C>,
    slot: &ShardSlot,
    cancel: &CancellationToken,
) -> (Error, u64) {
    let kind = ctx.kind;
    let shard = slot.index();

    let stream = KeepAliveStream::new(
        kind,
        slot.trading_pairs(),
        ctx.handler.clone(),
        ctx.connector.clone(),
        ctx.keep_alive.clone(),
    )
    .with_metrics(ctx.metrics.clone(), shard);

    slot.attach(stream.live_connection());
    let _detach = DetachOnDrop(slot);

    let mut delivered = 0u64;
    let result = stream
        .run(cancel, |frame| {
            match ctx.handler.decode(kind, frame, Utc::now()) {
                VenueMessage::Ack => trace!("[{} SHARD-{}] ack", kind, shard),
                VenueMessage::Data(msg) => {
                    if ctx.output.send(msg).is_ok() {
                        delivered += 1;
                        ctx.metrics.record_published();
                    } else {
                        debug!("[{} SHARD-{}] Output receiver dropped", kind, shard);
                    }
                }
                VenueMessage::VenueError(frame) => {
                    ctx.metrics.record_venue_error();
                    error!("[{} SHARD-{}] WS error message from venue: {}", kind, shard, frame);
                    // Lets the book for that pair know its stream has a hole
                    if let Some(msg) = ctx.handler.error_message(&frame, Utc::now()) {
                        let _ = ctx.output.send(msg);
                    }
                }
                VenueMessage::Unrecognized(frame) => {
                    ctx.metrics.record_unrecognized();
                    warn!("[{} SHARD-{}] Unrecognized message: {}", kind, shard, frame);
                }
            }
        })
        .await;

    let reason = match result {
        Ok(()) => Error::StreamEnded(kind),
        Err(e) => e,
    };
    (reason, delivered)
}
