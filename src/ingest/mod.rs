// src/ingest/mod.rs
pub mod adapters;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod types;

use crate::error::IngestResult;
use crate::ingest::repository::{IngestRepository, SaveReport};
use crate::ingest::types::Batch;
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;

/// Longest title we keep, in chars.
pub const TITLE_MAX_CHARS: usize = 200;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_fetched_total", "Items normalized from upstream payloads.");
        describe_counter!("ingest_inserted_total", "Items newly written to storage.");
        describe_counter!(
            "ingest_duplicates_total",
            "Items skipped by the dedup policy or a unique index."
        );
        describe_counter!(
            "ingest_adapter_errors_total",
            "Upstream transport, status or envelope failures."
        );
        describe_counter!(
            "ingest_item_parse_errors_total",
            "Single upstream items skipped as malformed."
        );
        describe_counter!(
            "ingest_ticks_dropped_total",
            "Ticks dropped because the previous tick of the same source was still running."
        );
        describe_counter!(
            "ingest_storage_errors_total",
            "Ticks that ended on a storage failure."
        );
        describe_histogram!("ingest_fetch_ms", "Upstream GET time in milliseconds.");
        describe_gauge!(
            "ingest_source_last_fetch_ts",
            "Unix ts of the last successful fetch cycle, per source."
        );
    });
}

/// Decode HTML entities, strip tags, fold typographic quotes and whitespace.
pub fn clean_markup(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Tags become spaces so paragraphs don't glue together
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| {
        regex::Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>|</?[^>]+>")
            .expect("static regex")
    });
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace (incl. NBSP)
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"[\s\u{00A0}]+").expect("static regex"));
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// `clean_markup` plus a length cap of `TITLE_MAX_CHARS`.
pub fn normalize_title(s: &str) -> String {
    let out = clean_markup(s);
    if out.chars().count() > TITLE_MAX_CHARS {
        out.chars().take(TITLE_MAX_CHARS).collect::<String>().trim_end().to_string()
    } else {
        out
    }
}

/// Persist one adapter batch and advance the source's watermark.
///
/// On a storage error the watermark is left untouched.
pub async fn persist_batch(
    repo: &IngestRepository,
    source_name: &str,
    batch: Batch,
) -> IngestResult<SaveReport> {
    ensure_metrics_described();

    let report = repo.save_batch(batch, source_name).await?;
    repo.update_source_watermark(source_name).await?;

    let now = chrono::Utc::now().timestamp().max(0);
    gauge!("ingest_source_last_fetch_ts", "source" => source_name.to_string()).set(now as f64);
    Ok(report)
}
