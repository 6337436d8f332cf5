//! Default JSON dialect used by [`VenueHandler`](crate::VenueHandler)'s
//! provided methods and by the REST catalog and ticker.

use crate::error::Error;
use crate::handler::VenueMessage;
use crate::types::{MessageKind, NormalizedMessage, StreamKind, TradingPair};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Keys tried, in order, for the venue update id.
const SEQUENCE_KEYS: [&str; 6] = ["sequence", "u", "update_id", "lastUpdateId", "id", "timestamp"];

/// Keys tried, in order, for the trading pair.
const PAIR_KEYS: [&str; 3] = ["symbol", "s", "pair"];

/// Market-list statuses that mean "currently tradable".
const ACTIVE_STATUSES: [&str; 3] = ["active", "working", "trading"];

const MARKET_KEYS: [&str; 4] = ["symbol", "pair", "market", "s"];
const BASE_KEYS: [&str; 3] = ["base", "base_currency", "baseAsset"];
const QUOTE_KEYS: [&str; 3] = ["quote", "quote_currency", "quoteAsset"];
const LAST_PRICE_KEYS: [&str; 4] = ["last_price", "last", "lastPrice", "c"];

pub(crate) fn ping_frame(nonce: u64) -> String {
    json!({ "id": nonce, "type": "ping" }).to_string()
}

/// Classify a frame by its `type` field.
pub(crate) fn decode_frame(kind: StreamKind, frame: Value, observed_at: DateTime<Utc>) -> VenueMessage {
    let msg_type = frame.get("type").and_then(Value::as_str).unwrap_or("");
    match msg_type {
        "ack" | "welcome" | "pong" => VenueMessage::Ack,
        "message" => match data_message(kind, &frame, observed_at) {
            Some(msg) => VenueMessage::Data(msg),
            None => VenueMessage::Unrecognized(frame),
        },
        "error" => VenueMessage::VenueError(frame),
        _ => VenueMessage::Unrecognized(frame),
    }
}

fn data_message(kind: StreamKind, frame: &Value, observed_at: DateTime<Utc>) -> Option<NormalizedMessage> {
    let data = frame.get("data")?;
    let pair = first_str(data, &PAIR_KEYS)?;
    let sequence_id = first_u64(data, &SEQUENCE_KEYS)?;
    Some(NormalizedMessage::new(
        NormalizedMessage::kind_for_stream(kind),
        TradingPair::new(pair),
        sequence_id,
        observed_at,
        data.clone(),
    ))
}

/// Error message for a venue error frame that names a trading pair, either
/// at the top level or under `data`. Frames naming no pair yield `None`.
pub(crate) fn error_message(frame: &Value, observed_at: DateTime<Utc>) -> Option<NormalizedMessage> {
    let body = frame.get("data").filter(|d| first_str(d, &PAIR_KEYS).is_some()).unwrap_or(frame);
    let pair = first_str(body, &PAIR_KEYS)?;
    let sequence_id = first_u64(body, &SEQUENCE_KEYS).unwrap_or_else(|| millis(observed_at));
    Some(NormalizedMessage::new(
        MessageKind::Error,
        TradingPair::new(pair),
        sequence_id,
        observed_at,
        frame.clone(),
    ))
}

/// Build a snapshot message. Payloads without an update id fall back to the
/// receipt time in milliseconds.
///
/// Venues often answer a bad snapshot request with a 200 and an error body;
/// those become [`Error::Venue`].
pub(crate) fn snapshot_message(
    pair: &TradingPair,
    payload: Value,
    received_at: DateTime<Utc>,
) -> Result<NormalizedMessage, Error> {
    if !payload.is_object() {
        return Err(Error::Decode(format!("snapshot for {} is not an object", pair)));
    }
    let reported = payload.get("error").filter(|e| !e.is_null()).or_else(|| {
        (payload.get("type").and_then(Value::as_str) == Some("error")).then_some(&payload)
    });
    if let Some(reported) = reported {
        return Err(Error::Venue(format!("snapshot for {}: {}", pair, reported)));
    }

    let sequence_id = first_u64(&payload, &SEQUENCE_KEYS).unwrap_or_else(|| millis(received_at));
    Ok(NormalizedMessage::new(
        MessageKind::Snapshot,
        pair.clone(),
        sequence_id,
        received_at,
        payload,
    ))
}

/// Active pairs from a market-list payload.
///
/// Accepts an array of market objects or an object keyed by venue symbol.
/// Only entries whose `status` is one of the active statuses are kept. The
/// pair comes from a symbol field, or from base and quote joined by `-`.
pub(crate) fn active_pairs(payload: &Value) -> Vec<TradingPair> {
    entries(payload)
        .filter(|(_, market)| {
            market
                .get("status")
                .and_then(Value::as_str)
                .is_some_and(|s| ACTIVE_STATUSES.iter().any(|a| s.eq_ignore_ascii_case(a)))
        })
        .filter_map(|(_, market)| {
            let base = first_str(market, &BASE_KEYS);
            let quote = first_str(market, &QUOTE_KEYS);
            match (base, quote) {
                (Some(base), Some(quote)) => Some(TradingPair::new(format!("{}-{}", base, quote))),
                _ => first_str(market, &MARKET_KEYS).map(TradingPair::new),
            }
        })
        .collect()
}

/// Last traded price per venue symbol from a ticker payload.
///
/// Accepts an array of tickers carrying their own symbol, or an object keyed
/// by symbol. Prices may be numbers or strings.
pub(crate) fn last_prices(payload: &Value) -> HashMap<String, f64> {
    entries(payload)
        .filter_map(|(key, ticker)| {
            let symbol = first_str(ticker, &MARKET_KEYS).or(key)?;
            let price = first_f64(ticker, &LAST_PRICE_KEYS)?;
            Some((symbol.to_string(), price))
        })
        .collect()
}

/// `(key, entry)` for arrays (no key) and objects (keyed entries).
fn entries(payload: &Value) -> Box<dyn Iterator<Item = (Option<&str>, &Value)> + '_> {
    match payload {
        Value::Array(items) => Box::new(items.iter().map(|v| (None, v))),
        Value::Object(map) => Box::new(map.iter().map(|(k, v)| (Some(k.as_str()), v))),
        _ => Box::new(std::iter::empty()),
    }
}

fn millis(at: DateTime<Utc>) -> u64 {
    at.timestamp_millis().max(0) as u64
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

// Numeric ids sometimes arrive as strings.
fn first_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn first_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}
