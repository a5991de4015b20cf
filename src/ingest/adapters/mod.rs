// src/ingest/adapters/mod.rs
//! Upstream adapters and the static kind → adapter binding.

pub mod binance;
pub mod blockbeats;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, histogram};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};

use crate::error::IngestError;
use crate::ingest::types::{Source, SourceAdapter, SourceKind};

pub use binance::BinanceKlinesAdapter;
pub use blockbeats::BlockBeatsAdapter;

/// Upper bound for one upstream GET, connect included.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const UA: &str = "crypto-ingest/0.1";

/// Build the adapter bound to `source.kind`. `None` means no adapter exists for
/// that kind yet; callers treat it as "skip this source".
pub fn build_adapter(source: &Source) -> Option<Arc<dyn SourceAdapter>> {
    match source.kind {
        SourceKind::Blockbeats => Some(Arc::new(BlockBeatsAdapter::new(source))),
        SourceKind::Binance => Some(Arc::new(BinanceKlinesAdapter::new(source))),
        SourceKind::Coinglass => None,
    }
}

/// Shared GET-and-decode plumbing. Every failure is logged and collapses to
/// `serde_json::Value::Null`; nothing here returns an error.
pub struct HttpFetcher {
    source: String,
    url: String,
    api_key: Option<(HeaderName, String)>,
    // `None` once closed; dropping the client releases its connection pool.
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpFetcher {
    pub fn new(source: &Source, key_header: &'static str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(UA)
            .connect_timeout(Duration::from_secs(10))
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| {
                tracing::error!(source = %source.name, error = %e, "http client build failed");
                counter!("ingest_adapter_errors_total", "source" => source.name.clone())
                    .increment(1);
            })
            .ok();
        let api_key = source
            .credentials
            .api_key
            .as_ref()
            .filter(|k| !k.is_empty())
            .map(|k| (HeaderName::from_static(key_header), k.clone()));
        Self {
            source: source.name.clone(),
            url: source.api_url.clone(),
            api_key,
            client: Mutex::new(client),
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source
    }

    fn headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_static(UA));
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some((name, key)) = &self.api_key {
            match HeaderValue::from_str(key) {
                Ok(v) => {
                    h.insert(name.clone(), v);
                }
                Err(_) => {
                    tracing::warn!(source = %self.source, "api key is not a valid header value; sent without it")
                }
            }
        }
        h
    }

    /// One GET with query parameters. Non-2xx, transport failure, malformed
    /// JSON and a closed fetcher all yield `Null`.
    pub async fn fetch(&self, query: &[(&str, String)]) -> serde_json::Value {
        let client = {
            let guard = self.client.lock().unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        let Some(client) = client else {
            tracing::debug!(source = %self.source, "fetch on closed adapter");
            return serde_json::Value::Null;
        };

        let t0 = std::time::Instant::now();
        tracing::info!(source = %self.source, url = %self.url, "upstream request");
        let resp = client
            .get(&self.url)
            .headers(self.headers())
            .query(query)
            .send()
            .await;
        histogram!("ingest_fetch_ms", "source" => self.source.clone())
            .record(t0.elapsed().as_secs_f64() * 1_000.0);

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                self.fail(&IngestError::Transport(e.to_string()));
                return serde_json::Value::Null;
            }
        };
        if let Err(e) = check_status(resp.status()) {
            self.fail(&e);
            return serde_json::Value::Null;
        }
        match resp.json::<serde_json::Value>().await {
            Ok(v) => v,
            Err(e) => {
                self.fail(&IngestError::Parse(format!("response is not valid JSON: {e}")));
                serde_json::Value::Null
            }
        }
    }

    fn fail(&self, err: &IngestError) {
        tracing::warn!(source = %self.source, error = %err, "upstream fetch failed");
        counter!("ingest_adapter_errors_total", "source" => self.source.clone()).increment(1);
    }

    /// Drop the HTTP client. Safe to call any number of times.
    pub fn close(&self) {
        let mut guard = self.client.lock().unwrap_or_else(|p| p.into_inner());
        if guard.take().is_some() {
            tracing::debug!(source = %self.source, "adapter closed");
        }
    }
}

/// Non-2xx is a transport failure even when a body came back.
fn check_status(status: reqwest::StatusCode) -> Result<(), IngestError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(IngestError::Transport(format!("upstream returned HTTP {status}")))
    }
}

/// Epoch value (number or numeric string) from a JSON field.
pub(crate) fn json_i64(v: Option<&serde_json::Value>) -> Option<i64> {
    match v? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Float (number or numeric string) from a JSON value.
pub(crate) fn json_f64(v: Option<&serde_json::Value>) -> Option<f64> {
    let f = match v? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}
