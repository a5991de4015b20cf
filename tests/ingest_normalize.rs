// tests/ingest_normalize.rs
use crypto_ingest::ingest::adapters::binance::normalize_klines;
use crypto_ingest::ingest::adapters::blockbeats::normalize_flash;
use crypto_ingest::ingest::types::RecordStatus;
use serde_json::{json, Value};

fn fixture(s: &str) -> Value {
    serde_json::from_str(s).expect("fixture json")
}

#[test]
fn one_bad_item_does_not_sink_the_page() {
    let payload = fixture(include_str!("fixtures/blockbeats_flash.json"));
    let recs = normalize_flash(&payload, "blockbeats");

    assert_eq!(recs.len(), 2, "item with unparseable create_time is skipped");
    assert_eq!(recs[0].title, r#"Bitcoin ETF sees "record" inflows"#);
    assert_eq!(recs[0].body, "Spot bitcoin ETFs took in $1.1B on Monday.");
    assert_eq!(recs[0].link, "https://www.theblockbeats.info/flash/301122");
    assert_eq!(recs[0].published_at.timestamp(), 1_715_600_000);
    assert_eq!(recs[0].status, RecordStatus::Pending);

    // upstream order preserved; numeric create_time accepted too
    assert_eq!(recs[1].title, "ETH gas drops to a 3-month low");
    assert_eq!(recs[1].link, "");
    assert_eq!(recs[1].published_at.timestamp(), 1_715_599_000);
    assert!(recs.iter().all(|r| r.source == "blockbeats" && r.id.is_none()));
}

#[test]
fn failed_envelope_yields_nothing() {
    let payload = fixture(include_str!("fixtures/blockbeats_error.json"));
    assert!(normalize_flash(&payload, "blockbeats").is_empty());

    let missing_list = json!({"status": 0, "data": {}});
    assert!(normalize_flash(&missing_list, "blockbeats").is_empty());

    let empty_list = json!({"status": 0, "data": {"data": []}});
    assert!(normalize_flash(&empty_list, "blockbeats").is_empty());
}

#[test]
fn klines_keep_good_rows_only() {
    let payload = fixture(include_str!("fixtures/binance_klines.json"));
    let bars = normalize_klines(&payload, "BTCUSDT", "1m", "binance_btcusdt");

    assert_eq!(bars.len(), 2);
    assert_eq!(bars[0].open_time.timestamp_millis(), 1_715_600_000_000);
    assert_eq!(bars[0].open, 61000.10);
    assert_eq!(bars[0].volume, 12.345);
    assert_eq!(bars[1].close, 61090.00);
    assert!(bars.iter().all(|b| b.symbol == "BTCUSDT" && b.interval == "1m"));
    assert!(bars.iter().all(|b| b.indicators.rsi.is_none()));
}
