// src/ingest/adapters/blockbeats.rs
//! BlockBeats "open-flash" news feed.
//!
//! Envelope: `{"status": 0, "message": "...", "data": {"data": [item, ...]}}`.
//! `status != 0` means the call failed even when HTTP said 200.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;

use super::{json_i64, HttpFetcher};
use crate::error::IngestError;
use crate::ingest::types::{Batch, CanonicalRecord, PageRequest, Source, SourceAdapter, SourceKind};
use crate::ingest::{clean_markup, normalize_title};

pub struct BlockBeatsAdapter {
    http: HttpFetcher,
    lang: String,
    feed_type: String,
}

impl BlockBeatsAdapter {
    pub fn new(source: &Source) -> Self {
        Self {
            http: HttpFetcher::new(source, "x-api-key"),
            lang: source.config_str("lang").unwrap_or("cn").to_string(),
            feed_type: source.config_str("type").unwrap_or("push").to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for BlockBeatsAdapter {
    async fn fetch_and_normalize(&self, page: PageRequest) -> Batch {
        let query = [
            ("page", page.page.to_string()),
            ("size", page.size.to_string()),
            ("type", self.feed_type.clone()),
            ("lang", self.lang.clone()),
        ];
        let payload = self.http.fetch(&query).await;
        Batch::News(normalize_flash(&payload, self.http.source_name()))
    }

    async fn close(&self) {
        self.http.close();
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Blockbeats
    }
}

/// Turn a raw BlockBeats payload into pending records, in upstream order.
///
/// An empty payload or a failed envelope gives an empty vec. Items whose
/// `create_time` is missing or not an epoch-seconds value are logged and
/// skipped; the rest of the page is kept.
pub fn normalize_flash(payload: &Value, source_name: &str) -> Vec<CanonicalRecord> {
    if payload.is_null() || payload.as_object().is_some_and(|o| o.is_empty()) {
        tracing::warn!(source = %source_name, "blockbeats returned an empty payload");
        return Vec::new();
    }
    if payload.get("status").and_then(Value::as_i64) != Some(0) {
        let msg = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        tracing::warn!(source = %source_name, error = %msg, "blockbeats envelope reports failure");
        counter!("ingest_adapter_errors_total", "source" => source_name.to_string()).increment(1);
        return Vec::new();
    }
    let Some(items) = payload
        .get("data")
        .and_then(|d| d.get("data"))
        .and_then(Value::as_array)
    else {
        tracing::warn!(source = %source_name, "blockbeats envelope has no item list");
        return Vec::new();
    };
    if items.is_empty() {
        tracing::info!(source = %source_name, "blockbeats returned no news");
        return Vec::new();
    }

    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match flash_item(item, source_name) {
            Ok(rec) => out.push(rec),
            Err(e) => {
                tracing::warn!(source = %source_name, index = idx, error = %e, "skipping malformed news item");
                counter!("ingest_item_parse_errors_total", "source" => source_name.to_string())
                    .increment(1);
            }
        }
    }
    counter!("ingest_fetched_total", "source" => source_name.to_string())
        .increment(out.len() as u64);
    tracing::info!(source = %source_name, count = out.len(), "news normalized");
    out
}

fn flash_item(item: &Value, source_name: &str) -> Result<CanonicalRecord, IngestError> {
    let secs = json_i64(item.get("create_time"))
        .ok_or_else(|| IngestError::Parse("create_time missing or not an integer".into()))?;
    let published_at = DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| IngestError::Parse(format!("create_time {secs} out of range")))?;

    let text = |key: &str| item.get(key).and_then(Value::as_str).unwrap_or_default();
    let record_type = match text("type") {
        "" => "push",
        t => t,
    };
    Ok(CanonicalRecord::pending(
        normalize_title(text("title")),
        clean_markup(text("content")),
        text("link").trim(),
        published_at,
        record_type,
        source_name,
    ))
}
