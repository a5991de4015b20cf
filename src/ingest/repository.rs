// src/ingest/repository.rs
//! Deduplicating ingestion repository.
//!
//! Dedup policy for news records, applied per record in order:
//! 1. a non-empty link already stored ⇒ duplicate;
//! 2. the same (title, source, origin time) already stored ⇒ duplicate;
//! 3. otherwise insert.
//!
//! The pre-checks and the insert are separate storage calls, so two ticks can
//! both pass the pre-check for the same item. The unique indexes on `news_data`
//! and `kline_data` are the real guard: a constraint violation on insert is
//! counted as a duplicate, never as an error.

use chrono::{DateTime, Utc};
use metrics::counter;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::db::{from_micros, is_unique_violation, to_micros, Database};
use crate::error::IngestResult;
use crate::ingest::registry::SourceRegistry;
use crate::ingest::types::{
    BarIndicators, Batch, CanonicalRecord, MarketBar, RecordStatus,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub inserted: usize,
    pub duplicates: usize,
}

impl SaveReport {
    fn absorb(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.inserted += 1,
            InsertOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Persisted LLM/technical analysis row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketAnalysis {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub analysis: String,
    pub sentiment: String,
    pub confidence: i64,
    pub technical_sentiment: String,
    pub news_sentiment: Option<String>,
}

#[derive(Clone)]
pub struct IngestRepository {
    db: Database,
    registry: SourceRegistry,
}

impl IngestRepository {
    pub fn new(db: Database, registry: SourceRegistry) -> Self {
        Self { db, registry }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Persist whatever an adapter produced.
    pub async fn save_batch(&self, batch: Batch, source_name: &str) -> IngestResult<SaveReport> {
        match batch {
            Batch::News(records) => self.save_records(records, source_name).await,
            Batch::Bars(bars) => self.save_bars(bars, source_name).await,
        }
    }

    /// Insert news records that are not already stored. Every record is
    /// attributed to `source_name`.
    pub async fn save_records(
        &self,
        records: Vec<CanonicalRecord>,
        source_name: &str,
    ) -> IngestResult<SaveReport> {
        let mut report = SaveReport::default();
        for mut rec in records {
            rec.source = source_name.to_string();

            if self.news_exists(&rec).await? {
                report.duplicates += 1;
                continue;
            }
            report.absorb(self.insert_record(rec).await?);
        }

        counter!("ingest_inserted_total", "source" => source_name.to_string())
            .increment(report.inserted as u64);
        counter!("ingest_duplicates_total", "source" => source_name.to_string())
            .increment(report.duplicates as u64);
        tracing::debug!(
            source = %source_name,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "news records saved"
        );
        Ok(report)
    }

    async fn news_exists(&self, rec: &CanonicalRecord) -> IngestResult<bool> {
        let link = rec.link.clone();
        let title = rec.title.clone();
        let source = rec.source.clone();
        let at = to_micros(rec.published_at);
        self.db
            .call(move |c| {
                if !link.is_empty() {
                    let by_link = c
                        .prepare_cached("SELECT 1 FROM news_data WHERE link = ?1 LIMIT 1")?
                        .exists([&link])?;
                    if by_link {
                        return Ok(true);
                    }
                }
                Ok(c.prepare_cached(
                    "SELECT 1 FROM news_data \
                     WHERE title = ?1 AND source = ?2 AND create_time = ?3 LIMIT 1",
                )?
                .exists(params![title, source, at])?)
            })
            .await
    }

    /// Insert without any pre-check; a unique violation is a duplicate.
    pub async fn insert_record(&self, rec: CanonicalRecord) -> IngestResult<InsertOutcome> {
        self.db.call(move |c| insert_news_row(c, &rec)).await
    }

    /// Insert bars not already stored under (symbol, interval, open time).
    pub async fn save_bars(
        &self,
        bars: Vec<MarketBar>,
        source_name: &str,
    ) -> IngestResult<SaveReport> {
        let mut report = SaveReport::default();
        for bar in bars {
            let (symbol, interval, at) =
                (bar.symbol.clone(), bar.interval.clone(), to_micros(bar.open_time));
            let exists = self
                .db
                .call(move |c| {
                    Ok(c.prepare_cached(
                        "SELECT 1 FROM kline_data \
                         WHERE symbol = ?1 AND interval = ?2 AND open_time = ?3 LIMIT 1",
                    )?
                    .exists(params![symbol, interval, at])?)
                })
                .await?;
            if exists {
                report.duplicates += 1;
                continue;
            }
            report.absorb(self.db.call(move |c| insert_bar_row(c, &bar)).await?);
        }

        counter!("ingest_inserted_total", "source" => source_name.to_string())
            .increment(report.inserted as u64);
        counter!("ingest_duplicates_total", "source" => source_name.to_string())
            .increment(report.duplicates as u64);
        Ok(report)
    }

    /// Stamp the source's watermark with the current time. No-op if missing.
    pub async fn update_source_watermark(&self, source_name: &str) -> IngestResult<()> {
        self.registry
            .touch_fetch_watermark(source_name, Utc::now())
            .await
            .map(|_| ())
    }

    // ---- read projections -------------------------------------------------

    /// Latest news by origin time, newest first.
    pub async fn recent_records(&self, limit: usize) -> IngestResult<Vec<CanonicalRecord>> {
        self.query_records(
            "ORDER BY create_time DESC, id DESC LIMIT ?1".to_string(),
            limit,
        )
        .await
    }

    /// Oldest pending records first, for downstream summarization.
    pub async fn pending_records(&self, limit: usize) -> IngestResult<Vec<CanonicalRecord>> {
        self.query_records(
            "WHERE status = 'pending' ORDER BY create_time ASC, id ASC LIMIT ?1".to_string(),
            limit,
        )
        .await
    }

    async fn query_records(
        &self,
        tail: String,
        limit: usize,
    ) -> IngestResult<Vec<CanonicalRecord>> {
        let limit = limit as i64;
        self.db
            .call(move |c| {
                let sql = format!(
                    "SELECT id, title, content, link, create_time, type, source, summary, \
                     sentiment, status, processed_at, created_at, updated_at FROM news_data {tail}"
                );
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt.query_map([limit], map_record)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }

    pub async fn mark_processed(
        &self,
        id: i64,
        summary: Option<String>,
        sentiment: Option<String>,
    ) -> IngestResult<bool> {
        let now = to_micros(Utc::now());
        let n = self
            .db
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE news_data SET status = ?2, summary = ?3, sentiment = ?4, \
                     processed_at = ?5, updated_at = ?5 WHERE id = ?1",
                    params![id, RecordStatus::Processed.as_str(), summary, sentiment, now],
                )?)
            })
            .await?;
        Ok(n > 0)
    }

    pub async fn mark_failed(&self, id: i64) -> IngestResult<bool> {
        let now = to_micros(Utc::now());
        let n = self
            .db
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE news_data SET status = ?2, processed_at = ?3, updated_at = ?3 \
                     WHERE id = ?1",
                    params![id, RecordStatus::Failed.as_str(), now],
                )?)
            })
            .await?;
        Ok(n > 0)
    }

    /// Latest bars, newest first; optionally for one symbol.
    pub async fn recent_bars(
        &self,
        symbol: Option<String>,
        limit: usize,
    ) -> IngestResult<Vec<MarketBar>> {
        let limit = limit as i64;
        self.db
            .call(move |c| {
                let cols = "SELECT id, symbol, interval, open_time, open, high, low, close, volume, \
                     source, ma5, ma10, ma20, rsi, macd, macd_signal, macd_hist, bb_upper, \
                     bb_middle, bb_lower, obv FROM kline_data";
                let bars = match symbol {
                    Some(sym) => {
                        let sql = format!(
                            "{cols} WHERE symbol = ?1 ORDER BY open_time DESC, id DESC LIMIT ?2"
                        );
                        let mut stmt = c.prepare(&sql)?;
                        let rows = stmt.query_map(params![sym, limit], map_bar)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let sql = format!("{cols} ORDER BY open_time DESC, id DESC LIMIT ?1");
                        let mut stmt = c.prepare(&sql)?;
                        let rows = stmt.query_map([limit], map_bar)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                };
                Ok(bars)
            })
            .await
    }

    /// Write computed indicators back onto stored bars (matched by id).
    pub async fn update_bar_indicators(
        &self,
        updates: Vec<(i64, BarIndicators)>,
    ) -> IngestResult<usize> {
        self.db
            .call(move |c| {
                let tx = c.transaction()?;
                let mut n = 0;
                {
                    let mut stmt = tx.prepare_cached(
                        "UPDATE kline_data SET ma5 = ?2, ma10 = ?3, ma20 = ?4, rsi = ?5, \
                         macd = ?6, macd_signal = ?7, macd_hist = ?8, bb_upper = ?9, \
                         bb_middle = ?10, bb_lower = ?11, obv = ?12 WHERE id = ?1",
                    )?;
                    for (id, ind) in &updates {
                        n += stmt.execute(params![
                            id,
                            ind.ma5,
                            ind.ma10,
                            ind.ma20,
                            ind.rsi,
                            ind.macd,
                            ind.macd_signal,
                            ind.macd_hist,
                            ind.bb_upper,
                            ind.bb_middle,
                            ind.bb_lower,
                            ind.obv,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(n)
            })
            .await
    }

    pub async fn insert_analysis(&self, a: MarketAnalysis) -> IngestResult<i64> {
        let now = to_micros(Utc::now());
        self.db
            .call(move |c| {
                c.execute(
                    "INSERT INTO market_analysis (timestamp, symbol, analysis, sentiment, \
                     confidence, technical_sentiment, news_sentiment, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        to_micros(a.timestamp),
                        a.symbol,
                        a.analysis,
                        a.sentiment,
                        a.confidence,
                        a.technical_sentiment,
                        a.news_sentiment,
                        now,
                    ],
                )?;
                Ok(c.last_insert_rowid())
            })
            .await
    }

    pub async fn recent_analyses(&self, limit: usize) -> IngestResult<Vec<MarketAnalysis>> {
        let limit = limit as i64;
        self.db
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, timestamp, symbol, analysis, sentiment, confidence, \
                     technical_sentiment, news_sentiment FROM market_analysis \
                     ORDER BY timestamp DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], |r| {
                    Ok(MarketAnalysis {
                        id: r.get(0)?,
                        timestamp: from_micros(r.get(1)?),
                        symbol: r.get(2)?,
                        analysis: r.get(3)?,
                        sentiment: r.get(4)?,
                        confidence: r.get(5)?,
                        technical_sentiment: r.get(6)?,
                        news_sentiment: r.get(7)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }

    /// Row count of `news_data`; handy for admin output and tests.
    pub async fn count_records(&self) -> IngestResult<i64> {
        self.db
            .call(|c| Ok(c.query_row("SELECT COUNT(*) FROM news_data", [], |r| r.get(0))?))
            .await
    }

    pub async fn find_by_link(&self, link: &str) -> IngestResult<Option<CanonicalRecord>> {
        let link = link.to_string();
        self.db
            .call(move |c| {
                Ok(c.query_row(
                    "SELECT id, title, content, link, create_time, type, source, summary, \
                     sentiment, status, processed_at, created_at, updated_at \
                     FROM news_data WHERE link = ?1 AND link <> ''",
                    [&link],
                    map_record,
                )
                .optional()?)
            })
            .await
    }
}

fn insert_news_row(c: &mut Connection, rec: &CanonicalRecord) -> IngestResult<InsertOutcome> {
    let now = to_micros(Utc::now());
    let res = c.execute(
        "INSERT INTO news_data (title, content, link, create_time, type, source, summary, \
         sentiment, status, processed_at, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            rec.title,
            rec.body,
            rec.link,
            to_micros(rec.published_at),
            rec.record_type,
            rec.source,
            rec.summary,
            rec.sentiment,
            rec.status.as_str(),
            rec.processed_at.map(to_micros),
            now,
        ],
    );
    match res {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(e) if is_unique_violation(&e) => {
            tracing::debug!(title = %rec.title, link = %rec.link, "insert lost dedup race; skipped");
            Ok(InsertOutcome::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

fn insert_bar_row(c: &mut Connection, bar: &MarketBar) -> IngestResult<InsertOutcome> {
    let now = to_micros(Utc::now());
    let res = c.execute(
        "INSERT INTO kline_data (symbol, interval, open_time, open, high, low, close, volume, \
         source, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            bar.symbol,
            bar.interval,
            to_micros(bar.open_time),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.source,
            now,
        ],
    );
    match res {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
        Err(e) => Err(e.into()),
    }
}

fn map_record(r: &Row<'_>) -> rusqlite::Result<CanonicalRecord> {
    let status: String = r.get(9)?;
    Ok(CanonicalRecord {
        id: r.get(0)?,
        title: r.get(1)?,
        body: r.get(2)?,
        link: r.get(3)?,
        published_at: from_micros(r.get(4)?),
        record_type: r.get(5)?,
        source: r.get(6)?,
        summary: r.get(7)?,
        sentiment: r.get(8)?,
        status: RecordStatus::parse(&status),
        processed_at: r.get::<_, Option<i64>>(10)?.map(from_micros),
        created_at: Some(from_micros(r.get(11)?)),
        updated_at: Some(from_micros(r.get(12)?)),
    })
}

fn map_bar(r: &Row<'_>) -> rusqlite::Result<MarketBar> {
    Ok(MarketBar {
        id: r.get(0)?,
        symbol: r.get(1)?,
        interval: r.get(2)?,
        open_time: from_micros(r.get(3)?),
        open: r.get(4)?,
        high: r.get(5)?,
        low: r.get(6)?,
        close: r.get(7)?,
        volume: r.get(8)?,
        source: r.get(9)?,
        indicators: BarIndicators {
            ma5: r.get(10)?,
            ma10: r.get(11)?,
            ma20: r.get(12)?,
            rsi: r.get(13)?,
            macd: r.get(14)?,
            macd_signal: r.get(15)?,
            macd_hist: r.get(16)?,
            bb_upper: r.get(17)?,
            bb_middle: r.get(18)?,
            bb_lower: r.get(19)?,
            obv: r.get(20)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn repo() -> IngestRepository {
        let db = Database::open_in_memory().unwrap();
        IngestRepository::new(db.clone(), SourceRegistry::new(db))
    }

    #[tokio::test]
    async fn raw_insert_of_duplicate_link_reports_duplicate() {
        let repo = repo();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let a = CanonicalRecord::pending("a", "", "http://x.com/1", ts, "push", "bb");
        let b = CanonicalRecord::pending("b", "", "http://x.com/1", ts, "push", "bb");
        assert_eq!(repo.insert_record(a).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(repo.insert_record(b).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(repo.count_records().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_links_do_not_collide_with_each_other() {
        let repo = repo();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let recs = vec![
            CanonicalRecord::pending("one", "", "", ts, "push", "bb"),
            CanonicalRecord::pending("two", "", "", ts, "push", "bb"),
        ];
        let rep = repo.save_records(recs, "bb").await.unwrap();
        assert_eq!(rep, SaveReport { inserted: 2, duplicates: 0 });
    }

    #[tokio::test]
    async fn mark_processed_sets_status_and_summary() {
        let repo = repo();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        repo.save_records(
            vec![CanonicalRecord::pending("t", "", "http://x.com/9", ts, "push", "bb")],
            "bb",
        )
        .await
        .unwrap();
        let rec = repo.find_by_link("http://x.com/9").await.unwrap().unwrap();
        assert!(repo
            .mark_processed(rec.id.unwrap(), Some("sum".into()), Some("bullish".into()))
            .await
            .unwrap());
        let rec = repo.find_by_link("http://x.com/9").await.unwrap().unwrap();
        assert_eq!(rec.status, RecordStatus::Processed);
        assert_eq!(rec.summary.as_deref(), Some("sum"));
        assert!(rec.processed_at.is_some());
        assert!(repo.pending_records(10).await.unwrap().is_empty());
    }
}
