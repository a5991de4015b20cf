// src/analyze/mod.rs
//! Post-ingest analysis: indicators written back onto stored bars, a technical
//! sentiment label, optional LLM commentary, one `market_analysis` row per run.

pub mod indicators;
pub mod llm;

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::analyze::indicators::{compute, score_sentiment, IndicatorSnapshot, Ohlcv, Sentiment};
use crate::analyze::llm::{DynLlmClient, LlmInput, DEFAULT_CONFIDENCE};
use crate::error::IngestResult;
use crate::ingest::repository::{IngestRepository, MarketAnalysis};
use crate::ingest::types::{BarIndicators, CanonicalRecord};

/// Bars loaded per run.
pub const ANALYSIS_WINDOW: usize = 100;
/// Headlines handed to the LLM.
pub const NEWS_CONTEXT: usize = 5;

/// One analysis pass over the latest bars of `symbol`.
///
/// Returns `None` when there are no bars yet.
pub async fn run_analysis_once(
    repo: &IngestRepository,
    llm: &DynLlmClient,
    symbol: &str,
) -> IngestResult<Option<MarketAnalysis>> {
    let mut bars = repo
        .recent_bars(Some(symbol.to_string()), ANALYSIS_WINDOW)
        .await?;
    if bars.is_empty() {
        tracing::debug!(symbol, "no bars yet; analysis skipped");
        return Ok(None);
    }
    bars.reverse();

    let series: Vec<Ohlcv> = bars.iter().map(Ohlcv::from).collect();
    let computed = compute(&series);
    let updates: Vec<(i64, BarIndicators)> = bars
        .iter()
        .zip(&computed)
        .filter_map(|(b, ind)| b.id.map(|id| (id, *ind)))
        .collect();
    let updated = repo.update_bar_indicators(updates).await?;

    let last_bar = series[series.len() - 1];
    let last_ind = computed.last().copied().unwrap_or_default();
    let technical = score_sentiment(
        &IndicatorSnapshot::from_parts(last_bar.close, &last_ind),
        series.len(),
    );

    let news = repo.recent_records(NEWS_CONTEXT).await?;
    let news_sentiment = majority_sentiment(&news);
    let input = LlmInput {
        symbol: symbol.to_string(),
        bar: last_bar,
        indicators: last_ind,
        news: news
            .iter()
            .map(|r| (r.title.clone(), r.summary.clone().unwrap_or_else(|| r.body.clone())))
            .collect(),
    };

    let (analysis, sentiment, confidence) = match llm.analyze(&input).await {
        Some(out) => (out.analysis, out.sentiment, out.confidence),
        None => (
            format!(
                "Technical-only analysis for {symbol}: {} over {} bars.",
                technical.as_str(),
                series.len()
            ),
            technical,
            DEFAULT_CONFIDENCE,
        ),
    };

    let mut row = MarketAnalysis {
        id: None,
        timestamp: Utc::now(),
        symbol: symbol.to_string(),
        analysis,
        sentiment: sentiment.as_str().to_string(),
        confidence,
        technical_sentiment: technical.as_str().to_string(),
        news_sentiment,
    };
    row.id = Some(repo.insert_analysis(row.clone()).await?);

    tracing::info!(
        symbol,
        bars = series.len(),
        updated,
        technical = technical.as_str(),
        sentiment = %row.sentiment,
        confidence,
        provider = llm.provider_name(),
        "analysis stored"
    );
    Ok(Some(row))
}

/// Most common labelled sentiment among processed headlines, if any.
fn majority_sentiment(news: &[CanonicalRecord]) -> Option<String> {
    let (mut bull, mut bear, mut neutral) = (0, 0, 0);
    for label in news.iter().filter_map(|r| r.sentiment.as_deref()) {
        match label.to_ascii_lowercase().as_str() {
            "bullish" => bull += 1,
            "bearish" => bear += 1,
            _ => neutral += 1,
        }
    }
    if bull + bear + neutral == 0 {
        return None;
    }
    let label = if bull > bear && bull >= neutral {
        Sentiment::Bullish
    } else if bear > bull && bear >= neutral {
        Sentiment::Bearish
    } else {
        Sentiment::Neutral
    };
    Some(label.as_str().to_string())
}

/// Run `run_analysis_once` every `period` until `stop` flips to true.
/// Errors are logged; the loop keeps going.
pub fn spawn_analysis_job(
    repo: IngestRepository,
    llm: DynLlmClient,
    symbol: String,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(symbol = %symbol, every_secs = period.as_secs(), "analysis job armed");
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = run_analysis_once(&repo, &llm, &symbol).await {
                        tracing::error!(symbol = %symbol, error = %e, "analysis run failed");
                    }
                }
            }
        }
        tracing::info!(symbol = %symbol, "analysis job stopped");
    })
}
