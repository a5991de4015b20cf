// src/ingest/types.rs
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Kinds of upstream providers this service knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Blockbeats,
    Binance,
    Coinglass,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blockbeats => "blockbeats",
            Self::Binance => "binance",
            Self::Coinglass => "coinglass",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blockbeats" => Ok(Self::Blockbeats),
            "binance" => Ok(Self::Binance),
            "coinglass" => Ok(Self::Coinglass),
            other => Err(IngestError::Validation(format!(
                "unrecognized source kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

/// A configured upstream provider, as persisted in `data_sources`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub kind: SourceKind,
    pub api_url: String,
    #[serde(skip_serializing)]
    pub credentials: Credentials,
    pub config: BTreeMap<String, serde_json::Value>,
    pub poll_interval_secs: u64,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// String config value, if present and a string.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// Input to `SourceRegistry::register_or_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub kind: String,
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Unset means the deployment default for the source's kind.
    #[serde(default)]
    pub poll_interval_secs: Option<i64>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

/// Interval used when a spec reaches the registry without one.
pub const DEFAULT_POLL_INTERVAL_SECS: i64 = 300;

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Processed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processed" => Self::Processed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Normalized news item. Adapters produce these unpersisted (`id == None`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub id: Option<i64>,
    pub title: String,
    pub body: String,
    /// Empty when the upstream item has no link.
    pub link: String,
    pub published_at: DateTime<Utc>,
    pub record_type: String,
    pub source: String,
    pub summary: Option<String>,
    pub sentiment: Option<String>,
    pub status: RecordStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CanonicalRecord {
    /// Fresh pending record as an adapter emits it.
    pub fn pending(
        title: impl Into<String>,
        body: impl Into<String>,
        link: impl Into<String>,
        published_at: DateTime<Utc>,
        record_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            title: title.into(),
            body: body.into(),
            link: link.into(),
            published_at,
            record_type: record_type.into(),
            source: source.into(),
            summary: None,
            sentiment: None,
            status: RecordStatus::Pending,
            processed_at: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// Indicator columns attached to a bar by the analysis job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BarIndicators {
    pub ma5: Option<f64>,
    pub ma10: Option<f64>,
    pub ma20: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub obv: Option<f64>,
}

/// One OHLCV kline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketBar {
    pub id: Option<i64>,
    pub symbol: String,
    pub interval: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub source: String,
    #[serde(flatten)]
    pub indicators: BarIndicators,
}

/// Output of one adapter fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    News(Vec<CanonicalRecord>),
    Bars(Vec<MarketBar>),
}

impl Batch {
    pub fn len(&self) -> usize {
        match self {
            Self::News(v) => v.len(),
            Self::Bars(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pagination passed to `SourceAdapter::fetch_and_normalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, size: 10 }
    }
}

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch one page and normalize it. Never fails: upstream trouble of any
    /// kind degrades to an empty batch.
    async fn fetch_and_normalize(&self, page: PageRequest) -> Batch;

    /// Release network resources. Idempotent.
    async fn close(&self);

    fn kind(&self) -> SourceKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_case_insensitively_and_rejects_unknown() {
        assert_eq!("BlockBeats".parse::<SourceKind>().unwrap(), SourceKind::Blockbeats);
        assert_eq!(" binance ".parse::<SourceKind>().unwrap(), SourceKind::Binance);
        assert!(matches!(
            "rss".parse::<SourceKind>(),
            Err(IngestError::Validation(_))
        ));
    }

    #[test]
    fn pending_record_has_no_processing_state() {
        let r = CanonicalRecord::pending("t", "b", "", Utc::now(), "push", "blockbeats");
        assert_eq!(r.status, RecordStatus::Pending);
        assert!(r.processed_at.is_none());
        assert!(r.id.is_none());
    }
}
