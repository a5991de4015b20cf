// src/ingest/registry.rs
//! Source registry: durable configuration of upstream providers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{from_micros, to_micros, Database};
use crate::error::{IngestError, IngestResult};
use crate::ingest::types::{
    Credentials, Source, SourceKind, SourceSpec, DEFAULT_POLL_INTERVAL_SECS,
};

const SELECT_SOURCE: &str = "SELECT id, name, kind, api_url, api_key, api_secret, config, \
     fetch_interval, last_fetch_at, is_active, created_at, updated_at FROM data_sources";

#[derive(Clone)]
pub struct SourceRegistry {
    db: Database,
}

impl SourceRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the source, or overwrite its configuration if the name exists.
    /// The watermark and creation time of an existing row are preserved.
    pub async fn register_or_update(&self, spec: SourceSpec) -> IngestResult<Source> {
        let name = spec.name.clone();
        if name.trim().is_empty() {
            return Err(IngestError::Validation("source name is empty".into()));
        }
        if name.trim() != name {
            return Err(IngestError::Validation(format!(
                "source name '{name}' has surrounding whitespace"
            )));
        }
        let interval = spec.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if interval <= 0 {
            return Err(IngestError::Validation(format!(
                "poll interval must be > 0 (got {interval}) for source '{name}'"
            )));
        }
        let kind: SourceKind = spec.kind.parse()?;
        let config = serde_json::to_string(&spec.config)
            .map_err(|e| IngestError::Validation(format!("config not serializable: {e}")))?;
        let now = to_micros(Utc::now());

        let source = self
            .db
            .call(move |c| {
                c.execute(
                    "INSERT INTO data_sources (name, kind, api_url, api_key, api_secret, config, \
                         fetch_interval, is_active, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
                     ON CONFLICT(name) DO UPDATE SET \
                         kind = excluded.kind, \
                         api_url = excluded.api_url, \
                         api_key = excluded.api_key, \
                         api_secret = excluded.api_secret, \
                         config = excluded.config, \
                         fetch_interval = excluded.fetch_interval, \
                         is_active = excluded.is_active, \
                         updated_at = excluded.updated_at",
                    params![
                        name,
                        kind.as_str(),
                        spec.api_url,
                        spec.api_key,
                        spec.api_secret,
                        config,
                        interval,
                        spec.is_active,
                        now,
                    ],
                )?;
                let sql = format!("{SELECT_SOURCE} WHERE name = ?1");
                Ok(c.query_row(&sql, [&name], map_source)?)
            })
            .await?;

        tracing::info!(source = %source.name, kind = %source.kind, active = source.is_active, "source registered");
        Ok(source)
    }

    /// Active source by exact, case-sensitive name. Used for scheduling.
    pub async fn get_active_by_name(&self, name: &str) -> IngestResult<Option<Source>> {
        let name = name.to_string();
        self.db
            .call(move |c| {
                let sql = format!("{SELECT_SOURCE} WHERE name = ?1 AND is_active = 1");
                Ok(c.query_row(&sql, [&name], map_source).optional()?)
            })
            .await
    }

    /// Any source by name, active or not.
    pub async fn get_any(&self, name: &str) -> IngestResult<Option<Source>> {
        let name = name.to_string();
        self.db
            .call(move |c| {
                let sql = format!("{SELECT_SOURCE} WHERE name = ?1");
                Ok(c.query_row(&sql, [&name], map_source).optional()?)
            })
            .await
    }

    pub async fn require_any(&self, name: &str) -> IngestResult<Source> {
        self.get_any(name)
            .await?
            .ok_or_else(|| IngestError::NotFound(name.to_string()))
    }

    /// Active sources ordered by name.
    pub async fn list_active(&self) -> IngestResult<Vec<Source>> {
        self.list(true).await
    }

    pub async fn list_all(&self) -> IngestResult<Vec<Source>> {
        self.list(false).await
    }

    async fn list(&self, active_only: bool) -> IngestResult<Vec<Source>> {
        self.db
            .call(move |c| {
                let sql = if active_only {
                    format!("{SELECT_SOURCE} WHERE is_active = 1 ORDER BY name")
                } else {
                    format!("{SELECT_SOURCE} ORDER BY name")
                };
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt.query_map([], map_source)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }

    /// Flip the active flag. Returns false when the source does not exist.
    pub async fn set_active(&self, name: &str, active: bool) -> IngestResult<bool> {
        let name = name.to_string();
        let now = to_micros(Utc::now());
        let n = self
            .db
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE data_sources SET is_active = ?2, updated_at = ?3 WHERE name = ?1",
                    params![name, active, now],
                )?)
            })
            .await?;
        Ok(n > 0)
    }

    /// Record a successful fetch. The stored watermark never moves backwards
    /// or stands still: it becomes `max(ts, previous + 1µs)`.
    ///
    /// Returns false (and logs) when the source no longer exists.
    pub async fn touch_fetch_watermark(&self, name: &str, ts: DateTime<Utc>) -> IngestResult<bool> {
        let owned = name.to_string();
        let at = to_micros(ts);
        let n = self
            .db
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE data_sources \
                     SET last_fetch_at = MAX(COALESCE(last_fetch_at, 0) + 1, ?2), updated_at = ?2 \
                     WHERE name = ?1",
                    params![owned, at],
                )?)
            })
            .await?;
        if n == 0 {
            tracing::warn!(source = %name, "watermark update for unknown source ignored");
        }
        Ok(n > 0)
    }
}

fn map_source(row: &Row<'_>) -> rusqlite::Result<Source> {
    let kind_raw: String = row.get(2)?;
    let kind = kind_raw.parse::<SourceKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let config_raw: String = row.get(6)?;
    // A hand-edited row with broken JSON still loads, just without config.
    let config: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&config_raw).unwrap_or_default();
    let interval: i64 = row.get(7)?;

    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        kind,
        api_url: row.get(3)?,
        credentials: Credentials {
            api_key: row.get(4)?,
            api_secret: row.get(5)?,
        },
        config,
        poll_interval_secs: interval.max(1) as u64,
        last_fetch_at: row.get::<_, Option<i64>>(8)?.map(from_micros),
        is_active: row.get(9)?,
        created_at: from_micros(row.get(10)?),
        updated_at: from_micros(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, interval: i64) -> SourceSpec {
        SourceSpec {
            name: name.into(),
            kind: "blockbeats".into(),
            api_url: "https://example.test/flash".into(),
            api_key: None,
            api_secret: None,
            config: BTreeMap::new(),
            poll_interval_secs: Some(interval),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn rejects_non_positive_interval_and_unknown_kind() {
        let reg = SourceRegistry::new(Database::open_in_memory().unwrap());
        assert!(matches!(
            reg.register_or_update(spec("a", 0)).await,
            Err(IngestError::Validation(_))
        ));
        let mut bad = spec("b", 60);
        bad.kind = "rss".into();
        assert!(matches!(
            reg.register_or_update(bad).await,
            Err(IngestError::Validation(_))
        ));
        assert!(reg.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn padded_name_is_rejected_not_rewritten() {
        let reg = SourceRegistry::new(Database::open_in_memory().unwrap());
        assert!(matches!(
            reg.register_or_update(spec(" news", 60)).await,
            Err(IngestError::Validation(_))
        ));
        assert!(reg.get_any("news").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_interval_falls_back_to_default() {
        let reg = SourceRegistry::new(Database::open_in_memory().unwrap());
        let mut s = spec("blockbeats", 0);
        s.poll_interval_secs = None;
        let stored = reg.register_or_update(s).await.unwrap();
        assert_eq!(stored.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS as u64);
    }

    #[tokio::test]
    async fn lookup_is_case_sensitive() {
        let reg = SourceRegistry::new(Database::open_in_memory().unwrap());
        reg.register_or_update(spec("blockbeats", 60)).await.unwrap();
        assert!(reg.get_any("BlockBeats").await.unwrap().is_none());
        assert!(reg.get_active_by_name("blockbeats").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn touch_on_missing_source_is_a_noop() {
        let reg = SourceRegistry::new(Database::open_in_memory().unwrap());
        assert!(!reg.touch_fetch_watermark("ghost", Utc::now()).await.unwrap());
    }
}
