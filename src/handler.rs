use crate::codec;
use crate::config::DEFAULT_MAX_PAIRS_PER_SHARD;
use crate::error::Error;
use crate::types::{NormalizedMessage, StreamKind, TradingPair};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;

/// A decoded stream frame, classified by what the shard job should do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum VenueMessage {
    /// Liveness or handshake acknowledgement (pong, subscribe ack, welcome)
    Ack,
    /// Market data, already normalized
    Data(NormalizedMessage),
    /// The venue reported an error on the stream
    VenueError(Value),
    /// A frame whose shape the handler does not know
    Unrecognized(Value),
}

/// Trait that venue integrations implement.
///
/// The ingestion core owns connection lifecycle, sharding, liveness and
/// recovery. The handler owns everything venue-specific: where to connect,
/// what protocol frames look like and how payloads map onto
/// [`NormalizedMessage`].
///
/// Every method except [`stream_url`](Self::stream_url) has a default that
/// speaks a common JSON dialect:
///
/// - outgoing pings are `{"id": <nonce>, "type": "ping"}`
/// - incoming frames carry a `type` of `ack`/`welcome`/`pong`, `message`
///   (with the body under `data`) or `error`
///
/// # Example
///
/// ```ignore
/// use ws_market_ingest::{StreamKind, TradingPair, VenueHandler};
///
/// struct MyVenue;
///
/// impl VenueHandler for MyVenue {
///     async fn stream_url(&self, _kind: StreamKind) -> String {
///         "wss://stream.example.com/ws/public".to_string()
///     }
///
///     fn subscription_message(&self, kind: StreamKind, pairs: &[TradingPair]) -> Option<String> {
///         Some(serde_json::json!({"type": "subscribe", "channel": kind.as_str(), "symbols": pairs}).to_string())
///     }
/// }
/// ```
pub trait VenueHandler: Send + Sync + 'static {
    /// Returns the stream URL for the given kind.
    ///
    /// Called before each connection attempt.
    fn stream_url(&self, kind: StreamKind) -> impl Future<Output = String> + Send;

    /// Frame sent right after connecting to subscribe `pairs`.
    ///
    /// Returns `None` if the venue needs no explicit subscription.
    fn subscription_message(&self, _kind: StreamKind, _pairs: &[TradingPair]) -> Option<String> {
        None
    }

    /// Frame sent to drop `pairs` from a live connection.
    fn unsubscription_message(&self, _kind: StreamKind, _pairs: &[TradingPair]) -> Option<String> {
        None
    }

    /// Keep-alive ping tagged with `nonce`.
    fn ping_message(&self, nonce: u64) -> String {
        codec::ping_frame(nonce)
    }

    /// Classify and normalize one decoded stream frame.
    fn decode(&self, kind: StreamKind, frame: Value, observed_at: DateTime<Utc>) -> VenueMessage {
        codec::decode_frame(kind, frame, observed_at)
    }

    /// Error message to forward downstream for a venue error frame.
    ///
    /// `None` when the frame cannot be attributed to a trading pair; the
    /// error is then only logged.
    fn error_message(&self, frame: &Value, observed_at: DateTime<Utc>) -> Option<NormalizedMessage> {
        codec::error_message(frame, observed_at)
    }

    /// Convert a REST snapshot payload into a snapshot message.
    ///
    /// Error bodies are rejected with [`Error::Venue`].
    fn decode_snapshot(
        &self,
        pair: &TradingPair,
        payload: Value,
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedMessage, Error> {
        codec::snapshot_message(pair, payload, received_at)
    }

    /// Maximum pairs one connection may carry on this venue.
    fn max_pairs_per_shard(&self) -> usize {
        DEFAULT_MAX_PAIRS_PER_SHARD
    }
}
