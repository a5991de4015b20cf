// src/config/mod.rs
//! Process configuration, read once at startup from the environment (`.env`
//! is loaded by `main` before this runs).

pub mod sources;

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::analyze::llm::LlmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_path: String,
    pub api_host: String,
    pub api_port: u16,
    pub fetch_news_interval: u64,
    pub fetch_market_interval: u64,
    pub calc_indicator_interval: u64,
    pub analysis_symbol: String,
    pub llm: LlmConfig,
    pub blockbeats_api_key: Option<String>,
    pub binance_api_key: Option<String>,
    pub binance_api_secret: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "crypto-ingest".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            database_path: "data/crypto_ingest.db".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            fetch_news_interval: 300,
            fetch_market_interval: 60,
            calc_indicator_interval: 300,
            analysis_symbol: "BTCUSDT".to_string(),
            llm: LlmConfig::default(),
            blockbeats_api_key: None,
            binance_api_key: None,
            binance_api_secret: None,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_str(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key}={raw:?} is not valid")),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let log_format = match env_str("LOG_FORMAT").map(|s| s.to_ascii_lowercase()) {
            Some(f) if f == "json" => LogFormat::Json,
            _ => LogFormat::Compact,
        };
        let cfg = Self {
            app_name: env_str("APP_NAME").unwrap_or(d.app_name),
            log_level: env_str("LOG_LEVEL")
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or(d.log_level),
            log_format,
            database_path: env_str("DATABASE_PATH").unwrap_or(d.database_path),
            api_host: env_str("API_HOST").unwrap_or(d.api_host),
            api_port: env_parse("API_PORT", d.api_port)?,
            fetch_news_interval: env_parse("FETCH_NEWS_INTERVAL", d.fetch_news_interval)?,
            fetch_market_interval: env_parse("FETCH_MARKET_INTERVAL", d.fetch_market_interval)?,
            calc_indicator_interval: env_parse(
                "CALC_INDICATOR_INTERVAL",
                d.calc_indicator_interval,
            )?,
            analysis_symbol: env_str("ANALYSIS_SYMBOL")
                .map(|s| s.to_ascii_uppercase())
                .unwrap_or(d.analysis_symbol),
            llm: LlmConfig {
                model: env_str("LLM_MODEL").unwrap_or(d.llm.model),
                temperature: env_parse("LLM_TEMPERATURE", d.llm.temperature)?,
                max_tokens: env_parse("LLM_MAX_TOKENS", d.llm.max_tokens)?,
                api_key: env_str("OPENAI_API_KEY"),
            },
            blockbeats_api_key: env_str("BLOCKBEATS_API_KEY"),
            binance_api_key: env_str("BINANCE_API_KEY"),
            binance_api_secret: env_str("BINANCE_API_SECRET"),
        };
        for (key, v) in [
            ("FETCH_NEWS_INTERVAL", cfg.fetch_news_interval),
            ("FETCH_MARKET_INTERVAL", cfg.fetch_market_interval),
            ("CALC_INDICATOR_INTERVAL", cfg.calc_indicator_interval),
        ] {
            anyhow::ensure!(v > 0, "{key} must be > 0");
        }
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.api_host, self.api_port))
    }

    pub fn analysis_period(&self) -> Duration {
        Duration::from_secs(self.calc_indicator_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const KEYS: &[&str] = &[
        "APP_NAME",
        "LOG_LEVEL",
        "LOG_FORMAT",
        "API_PORT",
        "FETCH_NEWS_INTERVAL",
        "ANALYSIS_SYMBOL",
        "LLM_TEMPERATURE",
        "OPENAI_API_KEY",
    ];

    fn clear() {
        for k in KEYS {
            env::remove_var(k);
        }
    }

    #[serial_test::serial]
    #[test]
    fn defaults_without_env() {
        clear();
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.api_port, 8000);
        assert_eq!(cfg.fetch_news_interval, 300);
        assert_eq!(cfg.log_format, LogFormat::Compact);
        assert!(cfg.llm.api_key.is_none());
        assert_eq!(cfg.listen_addr().unwrap().port(), 8000);
    }

    #[serial_test::serial]
    #[test]
    fn env_overrides_and_validation() {
        clear();
        env::set_var("API_PORT", "9100");
        env::set_var("LOG_FORMAT", "JSON");
        env::set_var("ANALYSIS_SYMBOL", "ethusdt");
        env::set_var("OPENAI_API_KEY", "  ");
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.api_port, 9100);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.analysis_symbol, "ETHUSDT");
        assert!(cfg.llm.api_key.is_none());

        env::set_var("FETCH_NEWS_INTERVAL", "0");
        assert!(AppConfig::from_env().is_err());
        env::set_var("FETCH_NEWS_INTERVAL", "soon");
        assert!(AppConfig::from_env().is_err());
        clear();
    }
}
