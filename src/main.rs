//! Crypto ingest service: binary entrypoint.
//! Boots storage, the per-source scheduler, the analysis job and the read API.

use std::path::Path;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crypto_ingest::analyze::{llm, spawn_analysis_job};
use crypto_ingest::api::{self, AppState};
use crypto_ingest::config::{sources::load_sources_default, AppConfig, LogFormat};
use crypto_ingest::db::Database;
use crypto_ingest::ingest::scheduler::Scheduler;
use crypto_ingest::ingest::types::PageRequest;
use crypto_ingest::metrics::Metrics;

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` applies to everything.
fn init_tracing(cfg: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,reqwest=warn", cfg.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    match cfg.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let cfg = AppConfig::from_env().context("loading configuration")?;
    init_tracing(&cfg);
    tracing::info!(app = %cfg.app_name, db = %cfg.database_path, "starting");

    if let Some(dir) = Path::new(&cfg.database_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating database directory {}", dir.display()))?;
        }
    }
    let db = Database::open(&cfg.database_path)
        .with_context(|| format!("opening database {}", cfg.database_path))?;
    let repo = crypto_ingest::repository(db);

    let defaults = load_sources_default(&cfg).context("loading default sources")?;
    let metrics = Metrics::init(defaults.len()).context("installing metrics recorder")?;

    let scheduler = Scheduler::new(repo.clone(), PageRequest::default());
    let started = scheduler
        .start(&defaults)
        .await
        .context("starting scheduler")?;
    tracing::info!(timers = started, "ingestion running");

    let (stop_tx, stop_rx) = watch::channel(false);
    let analysis = spawn_analysis_job(
        repo.clone(),
        llm::build_client(&cfg.llm),
        cfg.analysis_symbol.clone(),
        cfg.analysis_period(),
        stop_rx,
    );

    let app = api::router(AppState::with_scheduler(scheduler.clone())).merge(metrics.router());
    let addr = cfg.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "read API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = stop_tx.send(true);
    scheduler.shutdown().await;
    if let Err(e) = analysis.await {
        tracing::error!(error = %e, "analysis job task failed");
    }
    served.context("serving read API")?;
    tracing::info!("bye");
    Ok(())
}
