// src/config/sources.rs
//! Default source list registered at startup.
//!
//! Lookup order:
//! 1) `$INGEST_SOURCES_PATH`
//! 2) `config/sources.toml`
//! 3) `config/sources.json`
//! 4) built-in blockbeats + binance BTCUSDT
//!
//! An `api_key` / `api_secret` that is missing or set to `"ENV"` is filled
//! from the kind's env var (`BLOCKBEATS_API_KEY`, `BINANCE_API_KEY`,
//! `BINANCE_API_SECRET`). A missing `poll_interval_secs` comes from
//! `FETCH_NEWS_INTERVAL` / `FETCH_MARKET_INTERVAL`, and a binance source
//! without a `symbol` follows `ANALYSIS_SYMBOL`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde_json::json;

use crate::config::AppConfig;
use crate::ingest::types::{SourceKind, SourceSpec};

pub const ENV_PATH: &str = "INGEST_SOURCES_PATH";

pub const BLOCKBEATS_FLASH_URL: &str = "https://api.theblockbeats.news/v1/open-api/open-flash";
pub const BINANCE_KLINES_URL: &str = "https://api.binance.com/api/v3/klines";

pub fn load_sources_from(path: &Path) -> Result<Vec<SourceSpec>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_sources(&content, ext.as_str())
        .with_context(|| format!("parsing sources from {}", path.display()))
}

/// Resolve the startup source list and fill in credentials from `cfg`.
pub fn load_sources_default(cfg: &AppConfig) -> Result<Vec<SourceSpec>> {
    let mut specs = if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
        load_sources_from(&pb)?
    } else if Path::new("config/sources.toml").exists() {
        load_sources_from(Path::new("config/sources.toml"))?
    } else if Path::new("config/sources.json").exists() {
        load_sources_from(Path::new("config/sources.json"))?
    } else {
        builtin_sources(cfg)
    };
    for spec in &mut specs {
        fill_credentials(spec, cfg);
        fill_defaults(spec, cfg);
    }
    tracing::info!(count = specs.len(), "default sources resolved");
    Ok(specs)
}

pub fn builtin_sources(cfg: &AppConfig) -> Vec<SourceSpec> {
    let symbol = cfg.analysis_symbol.clone();
    vec![
        SourceSpec {
            name: "blockbeats".to_string(),
            kind: SourceKind::Blockbeats.as_str().to_string(),
            api_url: BLOCKBEATS_FLASH_URL.to_string(),
            api_key: None,
            api_secret: None,
            config: BTreeMap::from([
                ("lang".to_string(), json!("cn")),
                ("type".to_string(), json!("push")),
            ]),
            poll_interval_secs: Some(cfg.fetch_news_interval as i64),
            is_active: true,
        },
        SourceSpec {
            name: format!("binance_{}", symbol.to_ascii_lowercase()),
            kind: SourceKind::Binance.as_str().to_string(),
            api_url: BINANCE_KLINES_URL.to_string(),
            api_key: None,
            api_secret: None,
            config: BTreeMap::from([
                ("symbol".to_string(), json!(symbol)),
                ("interval".to_string(), json!("1m")),
            ]),
            poll_interval_secs: Some(cfg.fetch_market_interval as i64),
            is_active: true,
        },
    ]
}

fn wants_env(v: &Option<String>) -> bool {
    match v.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(s) => s.eq_ignore_ascii_case("env"),
    }
}

fn fill_credentials(spec: &mut SourceSpec, cfg: &AppConfig) {
    let (key, secret) = match spec.kind.parse::<SourceKind>() {
        Ok(SourceKind::Blockbeats) => (cfg.blockbeats_api_key.clone(), None),
        Ok(SourceKind::Binance) => (cfg.binance_api_key.clone(), cfg.binance_api_secret.clone()),
        _ => (None, None),
    };
    if wants_env(&spec.api_key) {
        spec.api_key = key;
    }
    if wants_env(&spec.api_secret) {
        spec.api_secret = secret;
    }
}

fn fill_defaults(spec: &mut SourceSpec, cfg: &AppConfig) {
    let kind = spec.kind.parse::<SourceKind>().ok();
    if spec.poll_interval_secs.is_none() {
        let secs = match kind {
            Some(SourceKind::Binance) => cfg.fetch_market_interval,
            _ => cfg.fetch_news_interval,
        };
        spec.poll_interval_secs = Some(secs as i64);
    }
    if kind == Some(SourceKind::Binance) && !spec.config.contains_key("symbol") {
        spec.config.insert("symbol".to_string(), json!(cfg.analysis_symbol));
    }
}

fn parse_sources(s: &str, hint_ext: &str) -> Result<Vec<SourceSpec>> {
    if hint_ext == "toml" {
        return parse_toml(s);
    }
    if let Ok(v) = parse_json(s) {
        return Ok(v);
    }
    parse_toml(s).map_err(|_| anyhow!("unsupported sources format"))
}

#[derive(serde::Deserialize)]
struct SourcesFile {
    sources: Vec<SourceSpec>,
}

fn parse_toml(s: &str) -> Result<Vec<SourceSpec>> {
    let v: SourcesFile = toml::from_str(s)?;
    Ok(v.sources)
}

/// Either a bare array or `{"sources": [...]}`.
fn parse_json(s: &str) -> Result<Vec<SourceSpec>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum JsonSources {
        List(Vec<SourceSpec>),
        Wrapped(SourcesFile),
    }
    Ok(match serde_json::from_str::<JsonSources>(s)? {
        JsonSources::List(v) => v,
        JsonSources::Wrapped(f) => f.sources,
    })
}
