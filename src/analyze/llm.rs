//! LLM market commentary: provider abstraction + response parsing.
//!
//! The client gets the latest bar, its indicators and a few recent headlines,
//! and returns free text plus a sentiment label and a 0-100 confidence pulled
//! out of that text.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::analyze::indicators::{Ohlcv, Sentiment};
use crate::ingest::types::BarIndicators;

pub const DEFAULT_CONFIDENCE: i64 = 50;
const OPENAI_BASE: &str = "https://api.openai.com/v1";

const SYSTEM_PROMPT: &str = "You are a professional crypto trading advisor. Based on the market \
data and technical indicators provided, give a concise market analysis in Markdown covering: \
1. market sentiment (bullish, bearish or neutral) and why; \
2. a suggested buy/sell range with a confidence from 0 to 100, written as `Confidence: NN%`; \
3. the main risks.";

/// Everything the model is shown for one analysis.
#[derive(Debug, Clone, Serialize)]
pub struct LlmInput {
    pub symbol: String,
    pub bar: Ohlcv,
    pub indicators: BarIndicators,
    /// (title, summary or body) of recent headlines, newest first.
    pub news: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmOutput {
    pub analysis: String,
    pub sentiment: Sentiment,
    pub confidence: i64,
}

impl LlmOutput {
    pub fn from_text(text: impl Into<String>) -> Self {
        let analysis = text.into();
        Self {
            sentiment: extract_sentiment(&analysis),
            confidence: extract_confidence(&analysis),
            analysis,
        }
    }
}

pub trait LlmClient: Send + Sync {
    /// `None` when the client is disabled or the call failed.
    fn analyze<'a>(
        &'a self,
        input: &'a LlmInput,
    ) -> Pin<Box<dyn Future<Output = Option<LlmOutput>> + Send + 'a>>;
    fn provider_name(&self) -> &'static str;
}

pub type DynLlmClient = Arc<dyn LlmClient>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            api_key: None,
        }
    }
}

/// * `LLM_TEST_MODE=mock` gives a deterministic mock.
/// * No API key gives the disabled client.
/// * Otherwise OpenAI chat completions.
pub fn build_client(cfg: &LlmConfig) -> DynLlmClient {
    if std::env::var("LLM_TEST_MODE").is_ok_and(|v| v == "mock") {
        return Arc::new(MockClient::neutral());
    }
    let Some(key) = cfg.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
        tracing::info!("no OPENAI_API_KEY; LLM analysis disabled");
        return Arc::new(DisabledClient);
    };
    match OpenAiClient::new(cfg, key, OPENAI_BASE) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::warn!(error = %e, "failed to build LLM http client; LLM analysis disabled");
            Arc::new(DisabledClient)
        }
    }
}

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(cfg: &LlmConfig, api_key: &str, base_url: &str) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("crypto-ingest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }

    async fn complete(&self, input: &LlmInput) -> Option<LlmOutput> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let user = render_prompt(input);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let resp = match self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "LLM request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::warn!(status = %resp.status(), "LLM returned non-success status");
            return None;
        }
        let body: Resp = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "LLM response is not valid JSON");
                return None;
            }
        };
        let text = body.choices.into_iter().next()?.message.content;
        if text.trim().is_empty() {
            return None;
        }
        Some(LlmOutput::from_text(text))
    }
}

impl LlmClient for OpenAiClient {
    fn analyze<'a>(
        &'a self,
        input: &'a LlmInput,
    ) -> Pin<Box<dyn Future<Output = Option<LlmOutput>> + Send + 'a>> {
        Box::pin(self.complete(input))
    }
    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

pub struct DisabledClient;

impl LlmClient for DisabledClient {
    fn analyze<'a>(
        &'a self,
        _input: &'a LlmInput,
    ) -> Pin<Box<dyn Future<Output = Option<LlmOutput>> + Send + 'a>> {
        Box::pin(async { None })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Replies with a fixed text for every input.
#[derive(Clone)]
pub struct MockClient {
    pub fixed: String,
}

impl MockClient {
    pub fn neutral() -> Self {
        Self {
            fixed: "Market looks neutral (mock). Confidence: 50%".to_string(),
        }
    }
}

impl LlmClient for MockClient {
    fn analyze<'a>(
        &'a self,
        _input: &'a LlmInput,
    ) -> Pin<Box<dyn Future<Output = Option<LlmOutput>> + Send + 'a>> {
        let out = LlmOutput::from_text(self.fixed.clone());
        Box::pin(async move { Some(out) })
    }
    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.4}")).unwrap_or_else(|| "n/a".to_string())
}

/// User message for one analysis.
pub fn render_prompt(input: &LlmInput) -> String {
    let b = &input.bar;
    let i = &input.indicators;
    let news = if input.news.is_empty() {
        "No related news.\n".to_string()
    } else {
        input
            .news
            .iter()
            .map(|(title, summary)| format!("- {title}: {summary}\n"))
            .collect()
    };
    format!(
        "Latest {symbol} market data:\n\
         - open: {open}\n\
         - high: {high}\n\
         - low: {low}\n\
         - close: {close}\n\
         - volume: {volume}\n\
         \n\
         Technical indicators:\n\
         - MA5: {ma5}\n\
         - MA20: {ma20}\n\
         - RSI: {rsi}\n\
         - MACD: {macd}\n\
         - Bollinger: upper={bbu}, middle={bbm}, lower={bbl}\n\
         \n\
         Related news:\n\
         {news}\n\
         Give your analysis.",
        symbol = input.symbol,
        open = b.open,
        high = b.high,
        low = b.low,
        close = b.close,
        volume = b.volume,
        ma5 = fmt_opt(i.ma5),
        ma20 = fmt_opt(i.ma20),
        rsi = fmt_opt(i.rsi),
        macd = fmt_opt(i.macd),
        bbu = fmt_opt(i.bb_upper),
        bbm = fmt_opt(i.bb_middle),
        bbl = fmt_opt(i.bb_lower),
    )
}

/// Whichever of "bullish" / "bearish" appears first, else neutral.
pub fn extract_sentiment(text: &str) -> Sentiment {
    let lower = text.to_lowercase();
    match (lower.find("bullish"), lower.find("bearish")) {
        (Some(a), Some(b)) if b < a => Sentiment::Bearish,
        (Some(_), _) => Sentiment::Bullish,
        (None, Some(_)) => Sentiment::Bearish,
        (None, None) => Sentiment::Neutral,
    }
}

/// First integer shortly after the word "confidence", clamped to 0-100.
pub fn extract_confidence(text: &str) -> i64 {
    static RE: OnceCell<regex::Regex> = OnceCell::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"(?i)confidence[^0-9\n]{0,24}?(\d{1,3})").expect("static regex")
    });
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .map(|n| n.clamp(0, 100))
        .unwrap_or(DEFAULT_CONFIDENCE)
}
