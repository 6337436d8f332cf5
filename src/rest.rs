//! REST market listings: the active-pair catalog and last traded prices.

use crate::auth::{AuthProvider, SignableRequest};
use crate::catalog::TradingPairCatalog;
use crate::codec;
use crate::error::Error;
use crate::types::TradingPair;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// reqwest client plus optional request signing, shared by the REST sources.
#[derive(Clone)]
pub(crate) struct RestClient {
    client: reqwest::Client,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl RestClient {
    pub(crate) fn new(request_timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, auth: None })
    }

    pub(crate) fn set_auth(&mut self, auth: Arc<dyn AuthProvider>) {
        self.auth = Some(auth);
    }

    /// GET `url` and parse the body as JSON. Non-2xx answers are
    /// [`Error::HttpStatus`].
    pub(crate) async fn get_json(&self, url: &str) -> Result<Value, Error> {
        let mut request = self.client.get(url);

        if let Some(auth) = &self.auth {
            for (name, value) in auth.sign(&SignableRequest::get(url))? {
                request = request.header(name, value);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

/// [`TradingPairCatalog`] backed by the venue's market-list endpoint.
///
/// Understands a JSON array of markets or an object keyed by venue symbol.
/// Only markets whose `status` is active, working or trading are returned.
pub struct RestCatalog {
    rest: RestClient,
    url: String,
}

impl RestCatalog {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            rest: RestClient::new(request_timeout)?,
            url: url.into(),
        })
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.rest.set_auth(auth);
        self
    }

    /// Every active pair the venue lists right now
    pub async fn fetch_trading_pairs(&self) -> Result<Vec<TradingPair>, Error> {
        let listing = self.rest.get_json(&self.url).await?;
        if !listing.is_array() && !listing.is_object() {
            return Err(Error::Catalog(format!(
                "market list from {} is neither an array nor an object",
                self.url
            )));
        }
        let pairs = codec::active_pairs(&listing);
        debug!("Market list at {} has {} active pairs", self.url, pairs.len());
        Ok(pairs)
    }
}

#[async_trait]
impl TradingPairCatalog for RestCatalog {
    async fn list_active(&self) -> Result<Vec<TradingPair>, Error> {
        self.fetch_trading_pairs().await
    }
}

impl std::fmt::Debug for RestCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCatalog").field("url", &self.url).finish_non_exhaustive()
    }
}

/// Last traded prices from the venue's ticker endpoint.
pub struct RestTicker {
    rest: RestClient,
    url: String,
}

impl RestTicker {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            rest: RestClient::new(request_timeout)?,
            url: url.into(),
        })
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.rest.set_auth(auth);
        self
    }

    /// Last traded price of each pair in `pairs`.
    ///
    /// Venue symbols match a pair with or without its separator, ignoring
    /// case (`BTCUSDT` and `btc_usdt` both match `BTC-USDT`). Pairs the
    /// ticker does not list are left out of the result.
    pub async fn get_last_traded_prices(
        &self,
        pairs: &[TradingPair],
    ) -> Result<HashMap<TradingPair, f64>, Error> {
        let tickers = self.rest.get_json(&self.url).await?;
        let by_symbol: HashMap<String, f64> = codec::last_prices(&tickers)
            .into_iter()
            .map(|(symbol, price)| (symbol_key(&symbol), price))
            .collect();

        let mut prices = HashMap::with_capacity(pairs.len());
        for pair in pairs {
            match by_symbol.get(&symbol_key(pair.as_str())) {
                Some(price) => {
                    prices.insert(pair.clone(), *price);
                }
                None => debug!("No ticker for {} at {}", pair, self.url),
            }
        }
        Ok(prices)
    }
}

impl std::fmt::Debug for RestTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTicker").field("url", &self.url).finish_non_exhaustive()
    }
}

fn symbol_key(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | '/'))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
