// tests/api_http.rs
//
// HTTP-level tests for the read API without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

use std::collections::BTreeMap;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use crypto_ingest::api::{self, AppState};
use crypto_ingest::db::Database;
use crypto_ingest::ingest::repository::IngestRepository;
use crypto_ingest::ingest::scheduler::Scheduler;
use crypto_ingest::ingest::types::{
    BarIndicators, CanonicalRecord, MarketBar, PageRequest, SourceSpec,
};

const BODY_LIMIT: usize = 1024 * 1024;

async fn seeded_repo() -> IngestRepository {
    let repo = crypto_ingest::repository(Database::open_in_memory().unwrap());
    repo.registry()
        .register_or_update(SourceSpec {
            name: "blockbeats".into(),
            kind: "blockbeats".into(),
            api_url: "https://example.test/flash".into(),
            api_key: Some("do-not-leak".into()),
            api_secret: None,
            config: BTreeMap::new(),
            poll_interval_secs: Some(300),
            is_active: true,
        })
        .await
        .unwrap();

    let news: Vec<CanonicalRecord> = (0..30)
        .map(|i| {
            CanonicalRecord::pending(
                format!("headline {i}"),
                "body",
                format!("https://example.test/{i}"),
                Utc.timestamp_opt(1_715_600_000 + i, 0).unwrap(),
                "push",
                "blockbeats",
            )
        })
        .collect();
    repo.save_records(news, "blockbeats").await.unwrap();

    let bars: Vec<MarketBar> = ["BTCUSDT", "ETHUSDT"]
        .iter()
        .flat_map(|sym| {
            (0..3).map(move |i| MarketBar {
                id: None,
                symbol: sym.to_string(),
                interval: "1m".into(),
                open_time: Utc.timestamp_opt(1_715_600_000 + i * 60, 0).unwrap(),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
                source: "binance".into(),
                indicators: BarIndicators::default(),
            })
        })
        .collect();
    repo.save_bars(bars, "binance").await.unwrap();
    repo
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Json) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    (status, serde_json::from_slice(&bytes).unwrap_or(Json::Null))
}

#[tokio::test]
async fn health_is_ok() {
    let app = api::router(AppState::new(seeded_repo().await));
    let req = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn news_defaults_to_ten_newest_and_clamps_limit() {
    let app = api::router(AppState::new(seeded_repo().await));

    let (status, v) = get_json(app.clone(), "/api/data/news").await;
    assert_eq!(status, StatusCode::OK);
    let items = v.as_array().expect("array");
    assert_eq!(items.len(), 10);
    assert_eq!(items[0]["title"], "headline 29");
    assert_eq!(items[0]["status"], "pending");

    let (_, v) = get_json(app.clone(), "/api/data/news?limit=0").await;
    assert_eq!(v.as_array().unwrap().len(), 1);

    let (_, v) = get_json(app, "/api/data/news?limit=100000").await;
    assert_eq!(v.as_array().unwrap().len(), 30);
}

#[tokio::test]
async fn klines_filter_by_symbol_case_insensitively() {
    let app = api::router(AppState::new(seeded_repo().await));

    let (_, v) = get_json(app.clone(), "/api/data/klines?symbol=ethusdt&limit=50").await;
    let bars = v.as_array().unwrap();
    assert_eq!(bars.len(), 3);
    assert!(bars.iter().all(|b| b["symbol"] == "ETHUSDT"));
    assert!(bars[0]["open_time"].as_str().unwrap() > bars[2]["open_time"].as_str().unwrap());

    let (_, v) = get_json(app, "/api/data/klines").await;
    assert_eq!(v.as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn sources_hide_credentials_and_show_scheduler_state() {
    let repo = seeded_repo().await;

    let (_, v) = get_json(api::router(AppState::new(repo.clone())), "/api/data/sources").await;
    let s = &v.as_array().unwrap()[0];
    assert_eq!(s["name"], "blockbeats");
    assert_eq!(s["kind"], "blockbeats");
    assert!(s.get("credentials").is_none());
    assert!(!v.to_string().contains("do-not-leak"));
    assert!(s.get("state").is_none());

    let sched = Scheduler::new(repo, PageRequest::default());
    let (_, v) = get_json(api::router(AppState::with_scheduler(sched)), "/api/data/sources").await;
    let s = &v.as_array().unwrap()[0];
    assert_eq!(s["state"], "idle");
    assert_eq!(s["consecutive_failures"], 0);
}

#[tokio::test]
async fn analysis_is_empty_before_first_run_and_bad_limit_is_rejected() {
    let app = api::router(AppState::new(seeded_repo().await));
    let (status, v) = get_json(app.clone(), "/api/data/analysis").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v, Json::Array(vec![]));

    let (status, _) = get_json(app, "/api/data/news?limit=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
