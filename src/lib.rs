//! # ws-market-ingest
//!
//! Sharded, self-healing market-data ingestion over venue streaming APIs.
//!
//! ## Features
//!
//! - **Sharding**: trading pairs are spread over connections of bounded size
//! - **Minimal-disruption rebalancing** on a schedule or when the tracked set changes
//! - **Liveness checks** with nonce-tagged pings and an idle-read watchdog
//! - **Per-shard recovery**: one failing connection never disturbs its siblings
//! - **Full rebuild** when an error escapes the shards
//! - **REST snapshot bootstrap** for order-book reconstruction
//! - **REST market listing** of active pairs and last traded prices
//! - **Metrics** for observability
//!
//! Venue specifics live behind [`VenueHandler`]; every decoded message is a
//! [`NormalizedMessage`] on one unbounded output channel.
//!
//! ## Example
//!
//! ```ignore
//! use ws_market_ingest::{output_channel, IngestConfig, IngestionSupervisor, StaticCatalog};
//!
//! let (tx, mut rx) = output_channel();
//! let config = IngestConfig::builder()
//!     .trading_pairs(["BTC-USDT", "ETH-USDT"])
//!     .build()?;
//!
//! let supervisor = Arc::new(IngestionSupervisor::new(
//!     config,
//!     MyVenue,
//!     Arc::new(StaticCatalog::default()),
//!     Arc::new(RestSnapshotEndpoint::new("https://api.venue.com/depth/{pair}", Duration::from_secs(10))?),
//!     tx,
//! ));
//! let handle = supervisor.clone().spawn();
//! ```

mod auth;
mod catalog;
mod codec;
mod config;
mod connection;
mod error;
mod handler;
mod job;
mod keepalive;
mod metrics;
mod rest;
mod schedule;
mod shard;
mod shard_set;
mod snapshot;
mod supervisor;
mod types;

#[cfg(test)]
mod testing;

pub use auth::{AuthProvider, HmacAuth, SignableRequest};
pub use catalog::{PairSource, StaticCatalog, TradingPairCatalog};
pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, IngestConfig, IngestConfigBuilder,
    KeepAliveConfig, RebalanceSchedule, SnapshotConfig, DEFAULT_MAX_PAIRS_PER_SHARD,
};
pub use connection::{Connector, FrameReader, FrameWriter, WsConnector, WsReader, WsWriter};
pub use error::{Error, ErrorKind};
pub use handler::{VenueHandler, VenueMessage};
pub use keepalive::{KeepAliveStream, LiveConnection, NonceGenerator, StreamState};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use rest::{RestCatalog, RestTicker};
pub use schedule::until_next_hour;
pub use shard::{partition, plan_rebalance, select_shard, RebalancePlan};
pub use shard_set::{RebalanceReport, ShardSet};
pub use snapshot::{RestSnapshotEndpoint, SnapshotBootstrapper, SnapshotEndpoint};
pub use supervisor::{IngestionHandle, IngestionSupervisor};
pub use types::{
    output_channel, MessageKind, NormalizedMessage, OutputReceiver, OutputSender, StreamKind,
    TradingPair,
};

// Re-export http types for AuthProvider
pub use http::{HeaderName, HeaderValue};

/// Result type for ws-market-ingest operations
pub type Result<T> = std::result::Result<T, Error>;
