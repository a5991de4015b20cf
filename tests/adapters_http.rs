// tests/adapters_http.rs
//
// Adapters against a local axum server on 127.0.0.1:0 standing in for
// BlockBeats and Binance.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use crypto_ingest::ingest::adapters::build_adapter;
use crypto_ingest::ingest::types::{
    Batch, Credentials, PageRequest, Source, SourceAdapter, SourceKind,
};
use serde_json::json;

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(HashMap<String, String>, Option<String>)>>>,
}

async fn flash(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    seen.requests.lock().unwrap().push((q, key));
    (
        [("content-type", "application/json")],
        include_str!("fixtures/blockbeats_flash.json"),
    )
}

async fn klines(Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
    if q.get("symbol").map(String::as_str) != Some("ETHUSDT") {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"code": -1121, "msg": "Invalid symbol."})),
        )
            .into_response();
    }
    axum::Json(json!([[1715600000000i64, "3000", "3010", "2990", "3005", "42.5"]])).into_response()
}

async fn spawn_upstream() -> (String, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route("/flash", get(flash))
        .route("/klines", get(klines))
        .route("/down", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/garbage", get(|| async { "<html>not json</html>" }))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), seen)
}

fn source(name: &str, kind: SourceKind, url: String, config: serde_json::Value) -> Source {
    let config: BTreeMap<String, serde_json::Value> =
        serde_json::from_value(config).unwrap_or_default();
    Source {
        id: 1,
        name: name.into(),
        kind,
        api_url: url,
        credentials: Credentials {
            api_key: Some("secret-key".into()),
            api_secret: None,
        },
        config,
        poll_interval_secs: 60,
        last_fetch_at: None,
        is_active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn blockbeats_sends_paging_and_key_and_normalizes() {
    let (base, seen) = spawn_upstream().await;
    let src = source(
        "blockbeats",
        SourceKind::Blockbeats,
        format!("{base}/flash"),
        json!({"lang": "en"}),
    );
    let adapter = build_adapter(&src).expect("blockbeats adapter");
    assert_eq!(adapter.kind(), SourceKind::Blockbeats);

    let batch = adapter
        .fetch_and_normalize(PageRequest { page: 2, size: 20 })
        .await;
    let Batch::News(recs) = batch else {
        panic!("expected news batch");
    };
    assert_eq!(recs.len(), 2);

    let reqs = seen.requests.lock().unwrap().clone();
    assert_eq!(reqs.len(), 1);
    let (q, key) = &reqs[0];
    assert_eq!(q.get("page").map(String::as_str), Some("2"));
    assert_eq!(q.get("size").map(String::as_str), Some("20"));
    assert_eq!(q.get("type").map(String::as_str), Some("push"));
    assert_eq!(q.get("lang").map(String::as_str), Some("en"));
    assert_eq!(key.as_deref(), Some("secret-key"));
}

#[tokio::test]
async fn upstream_failures_degrade_to_empty_batches() {
    let (base, _) = spawn_upstream().await;
    for path in ["down", "garbage", "missing-route"] {
        let src = source("bb", SourceKind::Blockbeats, format!("{base}/{path}"), json!({}));
        let adapter = build_adapter(&src).unwrap();
        let batch = adapter.fetch_and_normalize(PageRequest::default()).await;
        assert!(batch.is_empty(), "{path} should give an empty batch");
    }

    // nothing listening
    let src = source("bb", SourceKind::Blockbeats, "http://127.0.0.1:9/flash".into(), json!({}));
    let batch = build_adapter(&src).unwrap().fetch_and_normalize(PageRequest::default()).await;
    assert!(batch.is_empty());
}

#[tokio::test]
async fn binance_klines_and_error_envelope() {
    let (base, _) = spawn_upstream().await;
    let good = source(
        "binance_ethusdt",
        SourceKind::Binance,
        format!("{base}/klines"),
        json!({"symbol": "ethusdt", "interval": "5m"}),
    );
    let Batch::Bars(bars) = build_adapter(&good)
        .unwrap()
        .fetch_and_normalize(PageRequest::default())
        .await
    else {
        panic!("expected bars");
    };
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].symbol, "ETHUSDT");
    assert_eq!(bars[0].interval, "5m");
    assert_eq!(bars[0].close, 3005.0);
    assert_eq!(bars[0].source, "binance_ethusdt");

    let bad = source(
        "binance_bad",
        SourceKind::Binance,
        format!("{base}/klines"),
        json!({"symbol": "NOPE"}),
    );
    let batch = build_adapter(&bad).unwrap().fetch_and_normalize(PageRequest::default()).await;
    assert!(batch.is_empty());
}

#[tokio::test]
async fn closed_adapter_stops_fetching_and_coinglass_has_none() {
    let (base, seen) = spawn_upstream().await;
    let src = source("bb", SourceKind::Blockbeats, format!("{base}/flash"), json!({}));
    let adapter = build_adapter(&src).unwrap();
    adapter.close().await;
    adapter.close().await;
    assert!(adapter.fetch_and_normalize(PageRequest::default()).await.is_empty());
    assert!(seen.requests.lock().unwrap().is_empty());

    let cg = source("cg", SourceKind::Coinglass, base, json!({}));
    assert!(build_adapter(&cg).is_none());
}
