// src/ingest/adapters/binance.rs
//! Binance spot klines (`GET /api/v3/klines`).
//!
//! Success is a JSON array of rows
//! `[openTimeMs, "open", "high", "low", "close", "volume", closeTimeMs, ...]`.
//! Errors come back as an object `{"code": -1121, "msg": "Invalid symbol."}`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;

use super::{json_f64, json_i64, HttpFetcher};
use crate::error::IngestError;
use crate::ingest::types::{
    BarIndicators, Batch, MarketBar, PageRequest, Source, SourceAdapter, SourceKind,
};

pub struct BinanceKlinesAdapter {
    http: HttpFetcher,
    symbol: String,
    interval: String,
}

impl BinanceKlinesAdapter {
    pub fn new(source: &Source) -> Self {
        Self {
            http: HttpFetcher::new(source, "x-mbx-apikey"),
            symbol: source
                .config_str("symbol")
                .unwrap_or("BTCUSDT")
                .to_ascii_uppercase(),
            interval: source.config_str("interval").unwrap_or("1m").to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for BinanceKlinesAdapter {
    async fn fetch_and_normalize(&self, page: PageRequest) -> Batch {
        // Binance has no paging by number; page size maps onto `limit`.
        let query = [
            ("symbol", self.symbol.clone()),
            ("interval", self.interval.clone()),
            ("limit", page.size.clamp(1, 1000).to_string()),
        ];
        let payload = self.http.fetch(&query).await;
        Batch::Bars(normalize_klines(
            &payload,
            &self.symbol,
            &self.interval,
            self.http.source_name(),
        ))
    }

    async fn close(&self) {
        self.http.close();
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Binance
    }
}

pub fn normalize_klines(
    payload: &Value,
    symbol: &str,
    interval: &str,
    source_name: &str,
) -> Vec<MarketBar> {
    let Some(rows) = payload.as_array() else {
        if !payload.is_null() {
            let msg = payload.get("msg").and_then(Value::as_str).unwrap_or("unexpected payload");
            tracing::warn!(source = %source_name, error = %msg, "binance returned an error envelope");
            counter!("ingest_adapter_errors_total", "source" => source_name.to_string())
                .increment(1);
        }
        return Vec::new();
    };

    let mut out = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        match kline_row(row, symbol, interval, source_name) {
            Ok(bar) => out.push(bar),
            Err(e) => {
                tracing::warn!(source = %source_name, index = idx, error = %e, "skipping malformed kline");
                counter!("ingest_item_parse_errors_total", "source" => source_name.to_string())
                    .increment(1);
            }
        }
    }
    counter!("ingest_fetched_total", "source" => source_name.to_string())
        .increment(out.len() as u64);
    out
}

fn kline_row(
    row: &Value,
    symbol: &str,
    interval: &str,
    source_name: &str,
) -> Result<MarketBar, IngestError> {
    let cols = row
        .as_array()
        .filter(|c| c.len() >= 6)
        .ok_or_else(|| IngestError::Parse("kline row is not an array of >= 6 fields".into()))?;
    let ms = json_i64(cols.first())
        .ok_or_else(|| IngestError::Parse("open time is not an integer".into()))?;
    let open_time = DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| IngestError::Parse(format!("open time {ms} out of range")))?;
    let num = |i: usize, name: &str| {
        json_f64(cols.get(i)).ok_or_else(|| IngestError::Parse(format!("{name} is not a number")))
    };

    Ok(MarketBar {
        id: None,
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time,
        open: num(1, "open")?,
        high: num(2, "high")?,
        low: num(3, "low")?,
        close: num(4, "close")?,
        volume: num(5, "volume")?,
        source: source_name.to_string(),
        indicators: BarIndicators::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_object_yields_no_bars() {
        let payload = json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(normalize_klines(&payload, "BTCUSDT", "1m", "binance").is_empty());
    }

    #[test]
    fn short_rows_are_skipped() {
        let payload = json!([
            [1715600000000i64, "1", "2", "0.5", "1.5", "10"],
            [1715600060000i64, "1"]
        ]);
        let bars = normalize_klines(&payload, "BTCUSDT", "1m", "binance");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open_time.timestamp_millis(), 1_715_600_000_000);
        assert_eq!(bars[0].close, 1.5);
    }
}
