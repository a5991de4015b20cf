// src/ingest/scheduler.rs
//! Per-source fetch scheduler.
//!
//! Every active source gets its own task parked on a `tokio::time::interval`
//! of the source's poll interval. Each timer fire spawns one tick. A source has
//! at most one tick in flight: a fire that finds the previous tick still
//! running is dropped, not queued. Ticks of different sources run
//! concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::error::{IngestError, IngestResult};
use crate::ingest::adapters::build_adapter;
use crate::ingest::repository::IngestRepository;
use crate::ingest::types::{Batch, PageRequest, Source, SourceAdapter, SourceKind, SourceSpec};

/// Builds the adapter for a source; `None` means "no adapter for this kind".
pub type AdapterFactory =
    Arc<dyn Fn(&Source) -> Option<Arc<dyn SourceAdapter>> + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Unknown or deactivated source.
    Inactive,
    /// The source kind has no adapter.
    NoAdapter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TickOutcome {
    Completed {
        fetched: usize,
        inserted: usize,
        duplicates: usize,
    },
    /// The previous tick of this source was still running.
    Dropped,
    Skipped {
        reason: SkipReason,
    },
    StorageFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Running,
}

/// Adapter cache keyed by source name. Built on first use, rebuilt when the
/// connection-relevant config of the source changes, closed on shutdown.
pub struct AdapterRegistry {
    factory: AdapterFactory,
    cache: tokio::sync::Mutex<HashMap<String, CachedAdapter>>,
}

struct CachedAdapter {
    fingerprint: String,
    adapter: Arc<dyn SourceAdapter>,
}

fn fingerprint(source: &Source) -> String {
    format!(
        "{}|{}|{}|{}",
        source.kind,
        source.api_url,
        source.credentials.api_key.as_deref().unwrap_or_default(),
        serde_json::to_string(&source.config).unwrap_or_default()
    )
}

impl AdapterRegistry {
    pub fn new(factory: AdapterFactory) -> Self {
        Self {
            factory,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_build(&self, source: &Source) -> Option<Arc<dyn SourceAdapter>> {
        let fp = fingerprint(source);
        let (built, stale) = {
            let mut cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&source.name).filter(|c| c.fingerprint == fp) {
                return Some(Arc::clone(&hit.adapter));
            }
            let stale = cache.remove(&source.name);
            let built = (self.factory)(source);
            if let Some(adapter) = &built {
                cache.insert(
                    source.name.clone(),
                    CachedAdapter {
                        fingerprint: fp,
                        adapter: Arc::clone(adapter),
                    },
                );
                tracing::debug!(source = %source.name, kind = %source.kind, "adapter built");
            }
            (built, stale)
        };
        // Config changed under a cached adapter: retire the old one.
        if let Some(old) = stale {
            old.adapter.close().await;
        }
        built
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut cache = self.cache.lock().await;
            cache.drain().collect()
        };
        for (name, cached) in drained {
            cached.adapter.close().await;
            tracing::debug!(source = %name, "adapter closed on shutdown");
        }
    }
}

/// Resets the in-flight flag when the tick ends, however it ends.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn try_acquire(flag: Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    repo: IngestRepository,
    adapters: AdapterRegistry,
    page: PageRequest,
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
    failures: Mutex<HashMap<String, u32>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Scheduler using the built-in kind → adapter binding.
    pub fn new(repo: IngestRepository, page: PageRequest) -> Self {
        Self::with_adapter_factory(repo, page, Arc::new(build_adapter))
    }

    pub fn with_adapter_factory(
        repo: IngestRepository,
        page: PageRequest,
        factory: AdapterFactory,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                repo,
                adapters: AdapterRegistry::new(factory),
                page,
                in_flight: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                loops: Mutex::new(Vec::new()),
                stop_tx,
            }),
        }
    }

    pub fn repository(&self) -> &IngestRepository {
        &self.inner.repo
    }

    /// Register `defaults` (idempotent upsert), then start one timer task per
    /// active source. Returns the number of timers started.
    pub async fn start(&self, defaults: &[SourceSpec]) -> IngestResult<usize> {
        crate::ingest::ensure_metrics_described();
        let registry = self.inner.repo.registry();
        for spec in defaults {
            registry.register_or_update(spec.clone()).await?;
        }

        let sources = registry.list_active().await?;
        {
            let mut loops = self.inner.loops.lock().unwrap_or_else(|p| p.into_inner());
            for source in &sources {
                loops.push(self.spawn_source_loop(source));
            }
        }
        tracing::info!(sources = sources.len(), "scheduler started");
        Ok(sources.len())
    }

    fn spawn_source_loop(&self, source: &Source) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let name = source.name.clone();
        let period = Duration::from_secs(source.poll_interval_secs.max(1));
        let mut stop = self.inner.stop_tx.subscribe();

        tracing::info!(source = %name, every_secs = period.as_secs(), "source timer armed");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = JoinSet::new();

            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let inner = Arc::clone(&inner);
                        let name = name.clone();
                        ticks.spawn(async move { inner.run_tick(&name).await });
                    }
                }
                while let Some(done) = ticks.try_join_next() {
                    if let Err(e) = done {
                        tracing::error!(source = %name, error = %e, "tick task panicked");
                    }
                }
            }

            // In-flight ticks run to completion before the loop reports done.
            while ticks.join_next().await.is_some() {}
            tracing::info!(source = %name, "source timer stopped");
        })
    }

    /// Run one tick for `name` now, under the same overlap rule as the timer.
    pub async fn trigger(&self, name: &str) -> TickOutcome {
        self.inner.run_tick(name).await
    }

    pub fn state(&self, name: &str) -> SourceState {
        let map = self.inner.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        match map.get(name) {
            Some(flag) if flag.load(Ordering::Acquire) => SourceState::Running,
            _ => SourceState::Idle,
        }
    }

    /// Consecutive storage failures of a source since its last good tick.
    pub fn consecutive_failures(&self, name: &str) -> u32 {
        let map = self.inner.failures.lock().unwrap_or_else(|p| p.into_inner());
        map.get(name).copied().unwrap_or(0)
    }

    /// Stop every timer, wait for in-flight ticks, close cached adapters.
    pub async fn shutdown(&self) {
        let _ = self.inner.stop_tx.send(true);
        let loops: Vec<_> = {
            let mut g = self.inner.loops.lock().unwrap_or_else(|p| p.into_inner());
            g.drain(..).collect()
        };
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "source timer task failed");
            }
        }
        self.inner.adapters.close_all().await;
        tracing::info!("scheduler stopped");
    }
}

impl Inner {
    fn flag_for(&self, name: &str) -> Arc<AtomicBool> {
        let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    async fn run_tick(&self, name: &str) -> TickOutcome {
        let Some(_guard) = InFlightGuard::try_acquire(self.flag_for(name)) else {
            tracing::debug!(source = %name, "previous tick still running; tick dropped");
            counter!("ingest_ticks_dropped_total", "source" => name.to_string()).increment(1);
            return TickOutcome::Dropped;
        };

        let source = match self.repo.registry().get_active_by_name(name).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::debug!(source = %name, "source missing or inactive; tick skipped");
                return TickOutcome::Skipped {
                    reason: SkipReason::Inactive,
                };
            }
            Err(e) => return self.storage_failed(name, &e),
        };

        let Some(adapter) = self.adapters.get_or_build(&source).await else {
            tracing::warn!(source = %name, kind = %source.kind, "no adapter available; tick skipped");
            return TickOutcome::Skipped {
                reason: SkipReason::NoAdapter,
            };
        };

        // A panicking adapter costs this cycle its records, nothing more.
        let page = self.page;
        let batch = match tokio::spawn(async move { adapter.fetch_and_normalize(page).await }).await
        {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(source = %name, error = %e, "adapter panicked; treating as empty fetch");
                counter!("ingest_adapter_errors_total", "source" => name.to_string()).increment(1);
                empty_like(source.kind)
            }
        };
        let fetched = batch.len();

        match crate::ingest::persist_batch(&self.repo, name, batch).await {
            Ok(report) => {
                self.failures
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(name);
                tracing::info!(
                    source = %name,
                    fetched,
                    inserted = report.inserted,
                    duplicates = report.duplicates,
                    "tick completed"
                );
                TickOutcome::Completed {
                    fetched,
                    inserted: report.inserted,
                    duplicates: report.duplicates,
                }
            }
            Err(e) => self.storage_failed(name, &e),
        }
    }

    fn storage_failed(&self, name: &str, err: &IngestError) -> TickOutcome {
        let streak = {
            let mut map = self.failures.lock().unwrap_or_else(|p| p.into_inner());
            let n = map.entry(name.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        tracing::error!(source = %name, error = %err, consecutive_failures = streak, "tick storage failure");
        counter!("ingest_storage_errors_total", "source" => name.to_string()).increment(1);
        TickOutcome::StorageFailed
    }
}

fn empty_like(kind: SourceKind) -> Batch {
    match kind {
        SourceKind::Binance => Batch::Bars(Vec::new()),
        _ => Batch::News(Vec::new()),
    }
}
