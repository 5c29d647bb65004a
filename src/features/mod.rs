//! Feature stage: turns raw candle records into oscillator and calendar
//! features, one output row per input row that has every feature defined.

pub mod indicators;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike};
use serde_json::{Number, Value};

use crate::consumer::{encode_records, Record, Records, Transform};

const Z_SCORE_PERIOD: usize = 20;
const RSI_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_K: f64 = 2.0;
const SMA_SHORT: usize = 21;
const SMA_MID: usize = 50;
const SMA_LONG: usize = 100;

struct Columns {
    date: Vec<i64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
}

fn number(record: &Record, column: &str, row: usize) -> anyhow::Result<f64> {
    match record.get(column) {
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| anyhow!("row {row}: `{column}` out of range")),
        // Non-numeric source values arrive as null and poison the row.
        Some(Value::Null) => Ok(f64::NAN),
        Some(other) => Err(anyhow!("row {row}: `{column}` is not numeric: {other}")),
        None => Err(anyhow!("row {row}: missing column `{column}`")),
    }
}

fn columns(records: &[Record]) -> anyhow::Result<Columns> {
    let mut cols = Columns {
        date: Vec::with_capacity(records.len()),
        high: Vec::with_capacity(records.len()),
        low: Vec::with_capacity(records.len()),
        close: Vec::with_capacity(records.len()),
        volume: Vec::with_capacity(records.len()),
    };
    for (row, record) in records.iter().enumerate() {
        let date = record
            .get("Date")
            .and_then(Value::as_i64)
            .with_context(|| format!("row {row}: `Date` must be epoch milliseconds"))?;
        cols.date.push(date);
        cols.high.push(number(record, "High", row)?);
        cols.low.push(number(record, "Low", row)?);
        cols.close.push(number(record, "Close", row)?);
        cols.volume.push(number(record, "Volume", row)?);
    }
    Ok(cols)
}

fn ratio_series(num: &[f64], base: &[f64]) -> Vec<f64> {
    num.iter().zip(base).map(|(n, b)| (n - b) / b).collect()
}

/// Computes the feature table. Rows with any undefined feature are dropped;
/// the date and OHLCV columns are not part of the output.
pub fn compute_features(records: &[Record]) -> anyhow::Result<Records> {
    let cols = columns(records)?;
    let close = &cols.close;

    let sma_short = indicators::sma(close, SMA_SHORT);
    let sma_mid = indicators::sma(close, SMA_MID);
    let sma_long = indicators::sma(close, SMA_LONG);
    let scale = |v: Vec<f64>| v.into_iter().map(|x| x / 100.0).collect::<Vec<_>>();

    let series: Vec<(&str, Vec<f64>)> = vec![
        ("Z_score", indicators::z_score(close, Z_SCORE_PERIOD)),
        ("RSI", scale(indicators::rsi(close, RSI_PERIOD))),
        ("boll", indicators::bollinger_b(close, BOLLINGER_PERIOD, BOLLINGER_K)),
        ("ULTOSC", scale(indicators::ultimate_oscillator(&cols.high, &cols.low, close))),
        ("pct_change", indicators::pct_change(close)),
        ("zsVol", indicators::series_z_score(&cols.volume)),
        ("PR_MA_Ratio_short", ratio_series(close, &sma_short)),
        ("MA_Ratio_short", ratio_series(&sma_short, &sma_mid)),
        ("MA_Ratio", ratio_series(&sma_mid, &sma_long)),
        ("PR_MA_Ratio", ratio_series(close, &sma_mid)),
    ];

    let mut out = Records::new();
    'rows: for (i, millis) in cols.date.iter().enumerate() {
        let mut record = Record::new();
        for (name, values) in &series {
            match Number::from_f64(values[i]) {
                Some(n) => {
                    record.insert((*name).to_string(), Value::Number(n));
                }
                None => continue 'rows,
            }
        }
        let Some(ts) = DateTime::from_timestamp_millis(*millis) else {
            continue;
        };
        record.insert("DayOfWeek".into(), Value::from(ts.weekday().num_days_from_monday()));
        record.insert("Month".into(), Value::from(ts.month()));
        let hourly = Number::from_f64(f64::from(ts.hour()) / 4.0).map(Value::Number);
        record.insert("Hourly".into(), hourly.unwrap_or(Value::Null));
        out.push(record);
    }
    Ok(out)
}

pub struct FeatureTransform;

#[async_trait]
impl Transform for FeatureTransform {
    fn name(&self) -> &str {
        "features"
    }

    async fn apply(&self, key: &str, records: Records) -> anyhow::Result<Vec<u8>> {
        let features = compute_features(&records)?;
        tracing::debug!(key, rows_in = records.len(), rows_out = features.len(), "computed features");
        Ok(encode_records(&features)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// `n` 15-minute candles starting 2023-11-14 22:13:20 UTC (a Tuesday).
    fn candles(n: usize) -> Records {
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.3).sin() * 4.0 + i as f64 * 0.05;
                let value = json!({
                    "Date": 1_700_000_000_000i64 + i as i64 * 900_000,
                    "Open": close - 0.5,
                    "High": close + 1.0,
                    "Low": close - 1.0,
                    "Close": close,
                    "Volume": 10.0 + (i % 7) as f64,
                });
                match value {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                }
            })
            .collect()
    }

    #[test]
    fn test_warm_up_rows_are_dropped() {
        let out = compute_features(&candles(120)).unwrap();
        // The 100-period SMA is the longest window.
        assert_eq!(out.len(), 21);
        assert!(compute_features(&candles(99)).unwrap().is_empty());
    }

    #[test]
    fn test_output_columns() {
        let out = compute_features(&candles(100)).unwrap();
        assert_eq!(out.len(), 1);
        let row = &out[0];
        let mut keys: Vec<&str> = row.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "DayOfWeek", "Hourly", "MA_Ratio", "MA_Ratio_short", "Month", "PR_MA_Ratio",
                "PR_MA_Ratio_short", "RSI", "ULTOSC", "Z_score", "boll", "pct_change", "zsVol",
            ]
        );
        for v in row.values() {
            assert!(v.as_f64().is_some_and(f64::is_finite));
        }
        let rsi = row["RSI"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&rsi));
    }

    #[test]
    fn test_calendar_features() {
        let out = compute_features(&candles(100)).unwrap();
        // Row 99 is 99 * 15 minutes after 2023-11-14 22:13:20 UTC: 2023-11-15 22:58:20.
        assert_eq!(out[0]["DayOfWeek"], json!(2));
        assert_eq!(out[0]["Month"], json!(11));
        assert_eq!(out[0]["Hourly"], json!(5.5));
    }

    #[test]
    fn test_null_prices_drop_rows() {
        let mut input = candles(101);
        input[100].insert("Close".into(), Value::Null);
        let out = compute_features(&input).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_missing_columns_fail() {
        let mut input = candles(3);
        input[1].remove("Volume");
        assert!(compute_features(&input).is_err());
    }

    #[tokio::test]
    async fn test_transform_encodes_records() {
        let bytes = FeatureTransform.apply("BTC-USD", candles(10)).await.unwrap();
        assert_eq!(bytes, b"[]".to_vec());
    }
}
