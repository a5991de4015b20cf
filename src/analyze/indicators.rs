//! Technical indicators over an OHLCV series, and the point-scoring rule that
//! turns the latest values into a bullish / bearish / neutral label.
//!
//! Everything here is pure. Series are oldest-first; positions without enough
//! history are `None`.

use serde::{Deserialize, Serialize};

use crate::ingest::types::{BarIndicators, MarketBar};

/// Minimum series length for the full indicator set (and a non-neutral label).
pub const MIN_POINTS: usize = 20;

const RSI_LEN: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const BB_LEN: usize = 20;
const BB_STD: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&MarketBar> for Ohlcv {
    fn from(b: &MarketBar) -> Self {
        Self {
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: b.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
        }
    }
}

/// The latest values the scoring rule looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub ma20: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_lower: Option<f64>,
}

impl IndicatorSnapshot {
    pub fn from_parts(close: f64, ind: &BarIndicators) -> Self {
        Self {
            close,
            ma20: ind.ma20,
            rsi: ind.rsi,
            macd: ind.macd,
            macd_signal: ind.macd_signal,
            bb_upper: ind.bb_upper,
            bb_lower: ind.bb_lower,
        }
    }
}

/// Indicator columns for every bar of `series`.
pub fn compute(series: &[Ohlcv]) -> Vec<BarIndicators> {
    let close: Vec<f64> = series.iter().map(|b| b.close).collect();
    let volume: Vec<f64> = series.iter().map(|b| b.volume).collect();

    let ma5 = sma(&close, 5);
    let ma10 = sma(&close, 10);
    let ma20 = sma(&close, 20);
    let rsi = rsi(&close, RSI_LEN);
    let (macd_line, macd_signal, macd_hist) = macd(&close, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let (bb_upper, bb_middle, bb_lower) = bollinger(&close, BB_LEN, BB_STD);
    let obv = obv(&close, &volume);

    (0..series.len())
        .map(|i| BarIndicators {
            ma5: ma5[i],
            ma10: ma10[i],
            ma20: ma20[i],
            rsi: rsi[i],
            macd: macd_line[i],
            macd_signal: macd_signal[i],
            macd_hist: macd_hist[i],
            bb_upper: bb_upper[i],
            bb_middle: bb_middle[i],
            bb_lower: bb_lower[i],
            obv: obv[i],
        })
        .collect()
}

pub fn sma(values: &[f64], n: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if n == 0 || values.len() < n {
        return out;
    }
    let mut sum: f64 = values[..n].iter().sum();
    out[n - 1] = Some(sum / n as f64);
    for i in n..values.len() {
        sum += values[i] - values[i - n];
        out[i] = Some(sum / n as f64);
    }
    out
}

/// EMA seeded with the SMA of the first `n` values, alpha = 2 / (n + 1).
pub fn ema(values: &[f64], n: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if n == 0 || values.len() < n {
        return out;
    }
    let alpha = 2.0 / (n as f64 + 1.0);
    let mut prev = values[..n].iter().sum::<f64>() / n as f64;
    out[n - 1] = Some(prev);
    for i in n..values.len() {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = Some(prev);
    }
    out
}

/// Wilder RSI: averages seeded by a simple mean over the first `n` changes.
pub fn rsi(close: &[f64], n: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; close.len()];
    if n == 0 || close.len() <= n {
        return out;
    }
    let (mut gain, mut loss) = (0.0, 0.0);
    for i in 1..=n {
        let d = close[i] - close[i - 1];
        if d > 0.0 {
            gain += d;
        } else {
            loss -= d;
        }
    }
    let (mut avg_gain, mut avg_loss) = (gain / n as f64, loss / n as f64);
    out[n] = Some(rsi_value(avg_gain, avg_loss));
    for i in (n + 1)..close.len() {
        let d = close[i] - close[i - 1];
        let (g, l) = if d > 0.0 { (d, 0.0) } else { (0.0, -d) };
        avg_gain = (avg_gain * (n as f64 - 1.0) + g) / n as f64;
        avg_loss = (avg_loss * (n as f64 - 1.0) + l) / n as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

type Triple = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

/// (line, signal, histogram).
pub fn macd(close: &[f64], fast: usize, slow: usize, signal: usize) -> Triple {
    let len = close.len();
    let f = ema(close, fast);
    let s = ema(close, slow);
    let line: Vec<Option<f64>> = f
        .iter()
        .zip(&s)
        .map(|(a, b)| Some((*a)? - (*b)?))
        .collect();

    // Signal EMA runs over the defined stretch of the line only.
    let mut sig = vec![None; len];
    if let Some(start) = line.iter().position(Option::is_some) {
        let defined: Vec<f64> = line[start..].iter().map(|v| v.unwrap_or_default()).collect();
        for (i, v) in ema(&defined, signal).into_iter().enumerate() {
            sig[start + i] = v;
        }
    }
    let hist = line
        .iter()
        .zip(&sig)
        .map(|(l, s)| Some((*l)? - (*s)?))
        .collect();
    (line, sig, hist)
}

/// (upper, middle, lower) with a population standard deviation.
pub fn bollinger(close: &[f64], n: usize, k: f64) -> Triple {
    let mid = sma(close, n);
    let mut upper = vec![None; close.len()];
    let mut lower = vec![None; close.len()];
    for i in 0..close.len() {
        let Some(m) = mid[i] else { continue };
        let window = &close[i + 1 - n..=i];
        let var = window.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n as f64;
        let sd = var.sqrt();
        upper[i] = Some(m + k * sd);
        lower[i] = Some(m - k * sd);
    }
    (upper, mid, lower)
}

/// On-balance volume; the first bar counts as an up bar.
pub fn obv(close: &[f64], volume: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(close.len());
    let mut acc = 0.0;
    for i in 0..close.len().min(volume.len()) {
        if i == 0 || close[i] > close[i - 1] {
            acc += volume[i];
        } else if close[i] < close[i - 1] {
            acc -= volume[i];
        }
        out.push(Some(acc));
    }
    out
}

/// Trend points on the latest bar. Missing indicator values score 0.
///
/// | condition            | points |
/// |----------------------|--------|
/// | close > ma20         | +1     |
/// | close < ma20         | −1     |
/// | rsi > 70             | −1     |
/// | rsi < 30             | +1     |
/// | macd > signal        | +1     |
/// | macd < signal        | −1     |
/// | close > upper band   | −1     |
/// | close < lower band   | +1     |
pub fn trend_score(s: &IndicatorSnapshot) -> i32 {
    let mut score = 0;
    if let Some(ma20) = s.ma20 {
        if s.close > ma20 {
            score += 1;
        } else if s.close < ma20 {
            score -= 1;
        }
    }
    if let Some(rsi) = s.rsi {
        if rsi > 70.0 {
            score -= 1;
        } else if rsi < 30.0 {
            score += 1;
        }
    }
    if let (Some(m), Some(sig)) = (s.macd, s.macd_signal) {
        if m > sig {
            score += 1;
        } else if m < sig {
            score -= 1;
        }
    }
    if let (Some(up), Some(lo)) = (s.bb_upper, s.bb_lower) {
        if s.close > up {
            score -= 1;
        } else if s.close < lo {
            score += 1;
        }
    }
    score
}

/// Label for a snapshot taken from a series of `points` bars.
pub fn score_sentiment(snapshot: &IndicatorSnapshot, points: usize) -> Sentiment {
    if points < MIN_POINTS {
        return Sentiment::Neutral;
    }
    match trend_score(snapshot) {
        s if s >= 2 => Sentiment::Bullish,
        s if s <= -2 => Sentiment::Bearish,
        _ => Sentiment::Neutral,
    }
}

/// Compute indicators over `series` and label its latest bar.
pub fn market_sentiment(series: &[Ohlcv]) -> Sentiment {
    let Some(last) = series.last() else {
        return Sentiment::Neutral;
    };
    let ind = compute(series);
    let snap = IndicatorSnapshot::from_parts(last.close, ind.last().unwrap_or(&BarIndicators::default()));
    score_sentiment(&snap, series.len())
}
