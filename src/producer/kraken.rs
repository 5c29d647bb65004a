// Kraken public OHLC endpoint.
//
// GET {base}/0/public/OHLC?pair=P&interval=15&since=S
// -> {"error":[...],"result":{"<pair>":[[time,o,h,l,c,vwap,volume,count],..],"last":..}}

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Candle width requested from the source, in minutes.
pub const INTERVAL_MINUTES: i64 = 15;
/// How many candles back each request reaches.
pub const LOOKBACK_CANDLES: i64 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("exchange returned errors: {}", .0.join(", "))]
    Api(Vec<String>),
    #[error("no OHLC rows for `{0}` in response")]
    MissingPair(String),
}

#[async_trait]
pub trait OhlcSource: Send + Sync {
    async fn fetch_ohlc(&self, pair: &str) -> Result<Vec<Value>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct OhlcResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: Map<String, Value>,
}

pub fn since(now_secs: i64) -> i64 {
    now_secs - INTERVAL_MINUTES * LOOKBACK_CANDLES * 60
}

pub fn ohlc_endpoint(base_url: &str) -> String {
    format!("{}/0/public/OHLC", base_url.trim_end_matches('/'))
}

/// Pulls the row array for `pair` out of a decoded response body.
///
/// Kraken sometimes keys the result by its own pair name (`XXBTZUSD` for
/// `BTC/USD`), so when the requested name is absent the first array-valued
/// entry other than `last` is used.
fn extract_rows(pair: &str, body: Value) -> Result<Vec<Value>, FetchError> {
    let response: OhlcResponse =
        serde_json::from_value(body).map_err(|_| FetchError::MissingPair(pair.to_string()))?;
    if !response.error.is_empty() {
        return Err(FetchError::Api(response.error));
    }
    let mut result = response.result;
    let rows = match result.remove(pair) {
        Some(rows) => rows,
        None => result
            .into_iter()
            .find(|(key, value)| key != "last" && value.is_array())
            .map(|(_, rows)| rows)
            .ok_or_else(|| FetchError::MissingPair(pair.to_string()))?,
    };
    match rows {
        Value::Array(rows) => Ok(rows),
        _ => Err(FetchError::MissingPair(pair.to_string())),
    }
}

pub struct KrakenClient {
    http: reqwest::Client,
    base_url: String,
}

impl KrakenClient {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl OhlcSource for KrakenClient {
    async fn fetch_ohlc(&self, pair: &str) -> Result<Vec<Value>, FetchError> {
        let since = since(Utc::now().timestamp());
        debug!(pair, since, "requesting OHLC");
        let body: Value = self
            .http
            .get(ohlc_endpoint(&self.base_url))
            .query(&[
                ("pair", pair.to_string()),
                ("interval", INTERVAL_MINUTES.to_string()),
                ("since", since.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        extract_rows(pair, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_window_and_endpoint() {
        assert_eq!(since(1_700_000_000), 1_700_000_000 - 90_000);
        assert_eq!(ohlc_endpoint("https://api.kraken.com/"), "https://api.kraken.com/0/public/OHLC");
    }

    #[test]
    fn test_extract_rows_by_requested_pair() {
        let body = json!({
            "error": [],
            "result": {"FOO/USD": [[1700000000, "1", "2", "0.5", "1.5", "1.2", "10", 3]], "last": 1700000000}
        });
        let rows = extract_rows("FOO/USD", body).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_extract_rows_falls_back_to_exchange_key() {
        let body = json!({"error": [], "result": {"last": 1, "XXBTZUSD": [[1, "1", "1", "1", "1", "1", "1", 1]]}});
        assert_eq!(extract_rows("BTC/USD", body).unwrap().len(), 1);
    }

    #[test]
    fn test_extract_rows_errors() {
        let api = json!({"error": ["EQuery:Unknown asset pair"], "result": {}});
        assert!(matches!(extract_rows("NOPE/USD", api), Err(FetchError::Api(e)) if e.len() == 1));

        let empty = json!({"error": [], "result": {"last": 1}});
        assert!(matches!(extract_rows("FOO/USD", empty), Err(FetchError::MissingPair(_))));
    }
}
