use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Venue-neutral trading pair identifier (e.g. `BTC-USDT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradingPair(String);

impl TradingPair {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TradingPair {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TradingPair {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for TradingPair {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Category of market data carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Order-book deltas
    Depth,
    /// Trade prints
    Trade,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Depth, StreamKind::Trade];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Depth => "depth",
            StreamKind::Trade => "trade",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag of a [`NormalizedMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Snapshot,
    Diff,
    Trade,
    Error,
}

/// The single message shape handed to the order-book reconstructor.
///
/// `sequence_id` is the venue-assigned update id, carried verbatim. Consumers
/// must order and deduplicate per trading pair by it; arrival order across
/// shards is not meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub kind: MessageKind,
    pub trading_pair: TradingPair,
    pub sequence_id: u64,
    pub observed_at: DateTime<Utc>,
    /// Venue-specific body, left opaque
    pub payload: serde_json::Value,
}

impl NormalizedMessage {
    pub fn new(
        kind: MessageKind,
        trading_pair: TradingPair,
        sequence_id: u64,
        observed_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            trading_pair,
            sequence_id,
            observed_at,
            payload,
        }
    }

    /// The message kind a data frame on `stream` normalizes to.
    pub fn kind_for_stream(stream: StreamKind) -> MessageKind {
        match stream {
            StreamKind::Depth => MessageKind::Diff,
            StreamKind::Trade => MessageKind::Trade,
        }
    }
}

/// Sending half of the output channel. Enqueue never blocks.
pub type OutputSender = tokio::sync::mpsc::UnboundedSender<NormalizedMessage>;

/// Receiving half of the output channel, owned by the downstream consumer.
pub type OutputReceiver = tokio::sync::mpsc::UnboundedReceiver<NormalizedMessage>;

/// Create the shared output channel.
pub fn output_channel() -> (OutputSender, OutputReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trading_pair_ordering_and_display() {
        let mut pairs = vec![TradingPair::from("ETH-USDT"), TradingPair::from("BTC-USDT")];
        pairs.sort();
        assert_eq!(pairs[0].as_str(), "BTC-USDT");
        assert_eq!(pairs[1].to_string(), "ETH-USDT");
    }

    #[test]
    fn test_kind_for_stream() {
        assert_eq!(
            NormalizedMessage::kind_for_stream(StreamKind::Depth),
            MessageKind::Diff
        );
        assert_eq!(
            NormalizedMessage::kind_for_stream(StreamKind::Trade),
            MessageKind::Trade
        );
    }

    #[test]
    fn test_message_serializes_with_plain_pair() {
        let msg = NormalizedMessage::new(
            MessageKind::Snapshot,
            TradingPair::from("BTC-USDT"),
            42,
            Utc::now(),
            serde_json::json!({"bids": []}),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "snapshot");
        assert_eq!(value["trading_pair"], "BTC-USDT");
        assert_eq!(value["sequence_id"], 42);
    }
}
