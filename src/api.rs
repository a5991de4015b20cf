// src/api.rs
//! Read-only HTTP surface over stored news, klines, sources and analyses.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::error::IngestError;
use crate::ingest::repository::{IngestRepository, MarketAnalysis};
use crate::ingest::scheduler::{Scheduler, SourceState};
use crate::ingest::types::{CanonicalRecord, MarketBar, Source};

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub repo: IngestRepository,
    /// Present when timers run in this process; adds live state to `/sources`.
    pub scheduler: Option<Scheduler>,
}

impl AppState {
    pub fn new(repo: IngestRepository) -> Self {
        Self {
            repo,
            scheduler: None,
        }
    }

    pub fn with_scheduler(scheduler: Scheduler) -> Self {
        Self {
            repo: scheduler.repository().clone(),
            scheduler: Some(scheduler),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/data/news", get(list_news))
        .route("/api/data/klines", get(list_klines))
        .route("/api/data/sources", get(list_sources))
        .route("/api/data/analysis", get(list_analyses))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub symbol: Option<String>,
}

impl ListParams {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// Storage failures surface as 500 with a JSON body; nothing else can fail here.
pub struct ApiError(IngestError);

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "read API request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn list_news(
    State(state): State<AppState>,
    Query(p): Query<ListParams>,
) -> Result<Json<Vec<CanonicalRecord>>, ApiError> {
    Ok(Json(state.repo.recent_records(p.limit()).await?))
}

async fn list_klines(
    State(state): State<AppState>,
    Query(p): Query<ListParams>,
) -> Result<Json<Vec<MarketBar>>, ApiError> {
    let symbol = p
        .symbol
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_uppercase);
    Ok(Json(state.repo.recent_bars(symbol, p.limit()).await?))
}

#[derive(Debug, Serialize)]
pub struct SourceView {
    #[serde(flatten)]
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SourceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,
}

async fn list_sources(State(state): State<AppState>) -> Result<Json<Vec<SourceView>>, ApiError> {
    let sources = state.repo.registry().list_all().await?;
    let views = sources
        .into_iter()
        .map(|source| {
            let sched = state.scheduler.as_ref();
            SourceView {
                state: sched.map(|s| s.state(&source.name)),
                consecutive_failures: sched.map(|s| s.consecutive_failures(&source.name)),
                source,
            }
        })
        .collect();
    Ok(Json(views))
}

async fn list_analyses(
    State(state): State<AppState>,
    Query(p): Query<ListParams>,
) -> Result<Json<Vec<MarketAnalysis>>, ApiError> {
    Ok(Json(state.repo.recent_analyses(p.limit()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(ListParams::default().limit(), DEFAULT_LIMIT);
        let p = |n| ListParams {
            limit: Some(n),
            symbol: None,
        };
        assert_eq!(p(0).limit(), 1);
        assert_eq!(p(42).limit(), 42);
        assert_eq!(p(10_000).limit(), MAX_LIMIT);
    }
}
