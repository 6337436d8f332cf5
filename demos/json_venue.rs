//! Example: ingesting depth and trades from a venue speaking the common JSON
//! stream dialect.
//!
//! Run with: cargo run --example json_venue
//!
//! Set `VENUE_API_KEY` / `VENUE_API_SECRET` to sign snapshot requests.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_market_ingest::{
    output_channel, HmacAuth, IngestConfig, IngestionSupervisor, MessageKind,
    RestSnapshotEndpoint, StaticCatalog, StreamKind, TradingPair, VenueHandler,
};

const STREAM_URL: &str = "wss://stream.venue.example/market";
const SNAPSHOT_URL: &str = "https://api.venue.example/market/depth?pair={pair}";

struct JsonVenue;

impl VenueHandler for JsonVenue {
    async fn stream_url(&self, _kind: StreamKind) -> String {
        STREAM_URL.to_string()
    }

    fn subscription_message(&self, kind: StreamKind, pairs: &[TradingPair]) -> Option<String> {
        let topics: Vec<String> = pairs.iter().map(|p| format!("{}@{}", p, kind)).collect();
        Some(serde_json::json!({"type": "subscribe", "topics": topics}).to_string())
    }

    fn unsubscription_message(&self, kind: StreamKind, pairs: &[TradingPair]) -> Option<String> {
        let topics: Vec<String> = pairs.iter().map(|p| format!("{}@{}", p, kind)).collect();
        Some(serde_json::json!({"type": "unsubscribe", "topics": topics}).to_string())
    }

    fn max_pairs_per_shard(&self) -> usize {
        50
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let pairs: Vec<String> = ["BTC-USDT", "ETH-USDT", "SOL-USDT"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let config = IngestConfig::builder()
        .trading_pairs(pairs.clone())
        .build()?;

    let mut endpoint = RestSnapshotEndpoint::new(SNAPSHOT_URL, config.snapshot.request_timeout)?;
    if let (Ok(key), Ok(secret)) = (
        std::env::var("VENUE_API_KEY"),
        std::env::var("VENUE_API_SECRET"),
    ) {
        endpoint = endpoint.with_auth(Arc::new(HmacAuth::new(key, secret)));
    }

    let (tx, mut rx) = output_channel();
    let supervisor = Arc::new(IngestionSupervisor::new(
        config,
        JsonVenue,
        Arc::new(StaticCatalog::default()),
        Arc::new(endpoint),
        tx,
    ));

    info!("Starting ingestion for {} pairs", pairs.len());
    let handle = supervisor.clone().spawn();

    // Track one more pair after a while
    let tracker = supervisor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        let mut pairs = tracker.tracked_pairs();
        pairs.push(TradingPair::from("XRP-USDT"));
        tracker.set_tracked_pairs(pairs);
    });

    let consume = async {
        while let Some(msg) = rx.recv().await {
            match msg.kind {
                MessageKind::Snapshot => info!("snapshot {} #{}", msg.trading_pair, msg.sequence_id),
                MessageKind::Diff => info!("diff {} #{}", msg.trading_pair, msg.sequence_id),
                MessageKind::Trade => info!("trade {} #{}", msg.trading_pair, msg.sequence_id),
                MessageKind::Error => warn!("error {}: {}", msg.trading_pair, msg.payload),
            }
        }
    };

    tokio::select! {
        _ = consume => {}
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received"),
        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
    }

    let snapshot = supervisor.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Shard restarts: {}", snapshot.shard_restarts_total);
    info!("  Messages published: {}", snapshot.messages_published_total);
    info!("  Snapshots published: {}", snapshot.snapshots_published_total);
    info!("  Active connections: {}", snapshot.active_connections);

    handle.shutdown().await;
    info!("Ingestion stopped");

    Ok(())
}
