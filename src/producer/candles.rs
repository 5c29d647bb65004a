// Converts Kraken OHLC rows into the canonical raw record published on
// `market-data.raw.<SYM>`.
//
// Wire row: [time, open, high, low, close, vwap, volume, count]. VWAP and
// count are dropped. Prices arrive as strings (or numbers in some fixtures)
// and are coerced to JSON numbers; anything unparseable becomes null.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

const TIME: usize = 0;
const OPEN: usize = 1;
const HIGH: usize = 2;
const LOW: usize = 3;
const CLOSE: usize = 4;
const VOLUME: usize = 6;
const MIN_ROW_LEN: usize = VOLUME + 1;

#[derive(Debug, Error, PartialEq)]
pub enum CandleError {
    #[error("row {index} is not an array of at least 7 values")]
    Shape { index: usize },
    #[error("row {index} has an invalid timestamp `{value}`")]
    Timestamp { index: usize, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Candle {
    /// Epoch milliseconds.
    pub date: i64,
    pub open: Option<Number>,
    pub high: Option<Number>,
    pub low: Option<Number>,
    pub close: Option<Number>,
    pub volume: Option<Number>,
}

pub fn coerce_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(Number::from(i));
            }
            s.parse::<f64>().ok().and_then(Number::from_f64)
        }
        _ => None,
    }
}

fn epoch_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Renders `secs` as wall-clock time in `offset`, then reads that wall clock
/// back as if it were UTC.
pub fn naive_local_millis(secs: i64, offset: FixedOffset) -> Option<i64> {
    let utc = DateTime::from_timestamp(secs, 0)?;
    let wall = utc.with_timezone(&offset).naive_local();
    Some(wall.and_utc().timestamp_millis())
}

pub fn normalize(rows: &[Value], offset: FixedOffset) -> Result<Vec<Candle>, CandleError> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| -> Result<Candle, CandleError> {
            let cols = row
                .as_array()
                .filter(|c| c.len() >= MIN_ROW_LEN)
                .ok_or(CandleError::Shape { index })?;
            let date = epoch_seconds(&cols[TIME])
                .and_then(|secs| naive_local_millis(secs, offset))
                .ok_or_else(|| CandleError::Timestamp { index, value: cols[TIME].to_string() })?;
            Ok(Candle {
                date,
                open: coerce_number(&cols[OPEN]),
                high: coerce_number(&cols[HIGH]),
                low: coerce_number(&cols[LOW]),
                close: coerce_number(&cols[CLOSE]),
                volume: coerce_number(&cols[VOLUME]),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc_minus_6() -> FixedOffset {
        FixedOffset::west_opt(6 * 3600).unwrap()
    }

    #[test]
    fn test_normalize_drops_vwap_and_count() {
        let rows = vec![json!([1700000000, 50000, 505000, 49500, 50200, 1000, 1000, 1000])];
        let candles = normalize(&rows, utc_minus_6()).unwrap();
        let encoded = serde_json::to_string(&candles).unwrap();
        assert_eq!(
            encoded,
            r#"[{"Date":1699978400000,"Open":50000,"High":505000,"Low":49500,"Close":50200,"Volume":1000}]"#
        );
    }

    #[test]
    fn test_string_prices_are_coerced() {
        let rows = vec![json!([1700000000, "37000.5", "37100", "n/a", "", "36990.1", "12.25", 42])];
        let candle = &normalize(&rows, FixedOffset::east_opt(0).unwrap()).unwrap()[0];
        assert_eq!(candle.date, 1_700_000_000_000);
        assert_eq!(candle.open, Number::from_f64(37000.5));
        assert_eq!(candle.high, Some(Number::from(37100)));
        assert_eq!(candle.low, None);
        assert_eq!(candle.close, None);
        assert_eq!(candle.volume, Number::from_f64(12.25));

        let encoded = serde_json::to_value(candle).unwrap();
        assert_eq!(encoded["Low"], Value::Null);
    }

    #[test]
    fn test_malformed_rows_are_rejected() {
        let short = vec![json!([1700000000, "1", "2"])];
        assert_eq!(normalize(&short, utc_minus_6()), Err(CandleError::Shape { index: 0 }));

        let bad_time = vec![json!(["yesterday", 1, 1, 1, 1, 1, 1, 1])];
        assert!(matches!(
            normalize(&bad_time, utc_minus_6()),
            Err(CandleError::Timestamp { index: 0, .. })
        ));
    }

    #[test]
    fn test_empty_input_gives_empty_output() {
        assert!(normalize(&[], utc_minus_6()).unwrap().is_empty());
    }
}
