use crate::error::Error;
use crate::types::TradingPair;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Source of the venue's currently active trading pairs.
///
/// Consulted whenever the configured pair list is empty.
#[async_trait]
pub trait TradingPairCatalog: Send + Sync {
    async fn list_active(&self) -> Result<Vec<TradingPair>, Error>;
}

/// Catalog that always returns the same list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    pairs: Vec<TradingPair>,
}

impl StaticCatalog {
    pub fn new<I, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<TradingPair>,
    {
        Self {
            pairs: pairs.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl TradingPairCatalog for StaticCatalog {
    async fn list_active(&self) -> Result<Vec<TradingPair>, Error> {
        Ok(self.pairs.clone())
    }
}

/// Resolves the desired pair set: the tracked list when it is non-empty,
/// otherwise the catalog's active pairs.
///
/// Clones share the tracked list.
#[derive(Clone)]
pub struct PairSource {
    tracked: Arc<watch::Sender<Vec<TradingPair>>>,
    catalog: Arc<dyn TradingPairCatalog>,
}

impl PairSource {
    pub fn new(tracked: Vec<TradingPair>, catalog: Arc<dyn TradingPairCatalog>) -> Self {
        let (tx, _) = watch::channel(tracked);
        Self {
            tracked: Arc::new(tx),
            catalog,
        }
    }

    pub async fn desired(&self) -> Result<Vec<TradingPair>, Error> {
        let tracked = self.tracked();
        if !tracked.is_empty() {
            return Ok(tracked);
        }
        let pairs = self.catalog.list_active().await?;
        debug!("Catalog returned {} active pairs", pairs.len());
        Ok(pairs)
    }

    pub fn tracked(&self) -> Vec<TradingPair> {
        self.tracked.borrow().clone()
    }

    /// Replace the tracked list and wake everything watching it.
    pub fn set_tracked(&self, pairs: Vec<TradingPair>) {
        self.tracked.send_replace(pairs);
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TradingPair>> {
        self.tracked.subscribe()
    }
}

impl std::fmt::Debug for PairSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairSource")
            .field("tracked", &*self.tracked.borrow())
            .finish_non_exhaustive()
    }
}
