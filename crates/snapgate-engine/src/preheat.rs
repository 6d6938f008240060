//! Preheat orchestration: warm a whole site ahead of crawler traffic.
//!
//! At most one full preheat runs per site at a time; a second trigger
//! fails fast with [`AppError::PreheatRunning`]. The manager owns the
//! short-lived crawler values it creates per run — ownership flows one
//! way only.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use snapgate_core::cache::{CacheBackend, RenderCache};
use snapgate_core::config::{PreheatMode, RenderOptions, SiteConfig};
use snapgate_core::error::AppError;
use snapgate_core::model::{
    PreheatStatus, PreheatTask, RenderResult, SiteStats, UrlRecord, UrlStatus,
};
use snapgate_core::traits::{BrowserDriver, KvStore, WarmFetcher};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;
use uuid::Uuid;

use crate::crawler::Crawler;
use crate::dispatcher::Dispatcher;
use crate::keys;

/// Answer to `GetPreheatStatus`: the single-flight flag plus the last
/// task's counters.
#[derive(Debug, Clone)]
pub struct PreheatSnapshot {
    pub is_running: bool,
    pub last_task: Option<PreheatTask>,
}

pub struct PreheatManager<D: BrowserDriver, K: KvStore, W: WarmFetcher> {
    config: Arc<SiteConfig>,
    dispatcher: Arc<Dispatcher<D, K>>,
    cache: Arc<CacheBackend<K>>,
    store: K,
    warm: Option<W>,
    state: Mutex<Option<PreheatTask>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl<D: BrowserDriver, K: KvStore, W: WarmFetcher + 'static> PreheatManager<D, K, W> {
    pub fn new(
        config: Arc<SiteConfig>,
        dispatcher: Arc<Dispatcher<D, K>>,
        cache: Arc<CacheBackend<K>>,
        store: K,
        warm: Option<W>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            dispatcher,
            cache,
            store,
            warm,
            state: Mutex::new(None),
            cancel,
            tasks: TaskTracker::new(),
        })
    }

    /// Trigger a full preheat of the configured site.
    pub fn trigger(self: &Arc<Self>) -> Result<Uuid, AppError> {
        let base = Url::parse(&self.config.base_url)
            .map_err(|e| AppError::Config(format!("invalid base_url: {e}")))?;
        self.trigger_with(base, self.config.domain.clone())
    }

    /// Trigger a full preheat from an explicit base URL and domain.
    /// Fails fast when a run is already in flight.
    pub fn trigger_with(self: &Arc<Self>, base_url: Url, domain: String) -> Result<Uuid, AppError> {
        let task = {
            let mut state = self.lock_state();
            if state.as_ref().is_some_and(|t| !t.status.is_terminal()) {
                return Err(AppError::PreheatRunning(self.config.id.clone()));
            }
            let task = PreheatTask::new();
            *state = Some(task.clone());
            task
        };
        let id = task.id;
        tracing::info!(site = %self.config.id, task = %id, "Preheat triggered");

        let manager = Arc::clone(self);
        self.tasks.spawn(async move {
            manager.run(id, base_url, domain).await;
        });
        Ok(id)
    }

    /// Spot re-warm of a single URL: render (or HTTP-warm), then record
    /// the outcome against the route's status.
    pub async fn warm_url(&self, url: &str) -> Result<(), AppError> {
        let route = Url::parse(url)
            .map(|u| snapgate_core::urlutil::normalize_route(&u))
            .map_err(|e| AppError::Config(format!("invalid preheat url '{url}': {e}")))?;

        match self.warm_one(url).await {
            Ok(size) => {
                self.record_url_status(&route, UrlStatus::Cached, size).await;
                Ok(())
            }
            Err(e) => {
                self.record_url_status(&route, UrlStatus::Failed, 0).await;
                Err(e)
            }
        }
    }

    pub fn status(&self) -> PreheatSnapshot {
        let state = self.lock_state();
        PreheatSnapshot {
            is_running: state.as_ref().is_some_and(|t| !t.status.is_terminal()),
            last_task: state.clone(),
        }
    }

    /// Auto-preheat sweep: re-warm routes whose status record is close
    /// to (or past) the cache TTL. Best-effort; a store outage only
    /// skips this tick.
    pub fn sweep_due(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.tasks.spawn(async move {
            manager.sweep_due_inner().await;
        });
    }

    /// Wait for the in-flight run and any sweep re-warms to unwind.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn run(self: Arc<Self>, task_id: Uuid, base_url: Url, domain: String) {
        self.update_state(|t| t.status = PreheatStatus::Running);

        let crawler = Crawler::new(
            self.config.id.clone(),
            base_url.clone(),
            domain,
            self.config.preheat.max_depth,
            self.config.preheat.crawl_concurrency,
            Arc::clone(&self.dispatcher),
            self.store.clone(),
            self.cancel.child_token(),
        );
        if let Err(e) = crawler.run().await {
            let e = AppError::CrawlFailed(e.to_string());
            tracing::error!(site = %self.config.id, task = %task_id, error = %e, "Preheat crawl failed");
            self.finish(PreheatStatus::Failed, Some(e.to_string()));
            return;
        }

        let mut routes = match self.store.set_members(&keys::routes(&self.config.id)).await {
            Ok(routes) => routes,
            Err(e) => {
                self.finish(PreheatStatus::Failed, Some(e.to_string()));
                return;
            }
        };
        if routes.len() > self.config.preheat.max_urls {
            tracing::warn!(
                site = %self.config.id,
                dropped = routes.len() - self.config.preheat.max_urls,
                "Route set capped for preheat"
            );
            routes.truncate(self.config.preheat.max_urls);
        }
        let total = routes.len() as u64;
        self.update_state(|t| t.progress.total = total);

        // Warm concurrency follows pool size but stays capped so
        // interactive renders are not starved.
        let concurrency = self
            .config
            .preheat
            .warm_concurrency
            .min(self.config.pool.max_size)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut warms: JoinSet<()> = JoinSet::new();

        for route in routes {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let Ok(url) = base_url.join(&route) else {
                tracing::warn!(site = %self.config.id, %route, "Unjoinable route skipped");
                self.count_url(task_id, false);
                continue;
            };
            let manager = Arc::clone(&self);
            warms.spawn(async move {
                let _permit = permit;
                match manager.warm_one(url.as_str()).await {
                    Ok(size) => {
                        manager.record_url_status(&route, UrlStatus::Cached, size).await;
                        manager.count_url(task_id, true);
                    }
                    Err(e) => {
                        tracing::warn!(
                            site = %manager.config.id,
                            url = %url,
                            error = %e,
                            "Preheat warm failed"
                        );
                        manager.record_url_status(&route, UrlStatus::Failed, 0).await;
                        manager.count_url(task_id, false);
                    }
                }
            });
        }
        while warms.join_next().await.is_some() {}

        if let Err(e) = self.write_site_stats().await {
            tracing::warn!(site = %self.config.id, error = %e, "Site stats update failed");
        }
        self.finish(PreheatStatus::Completed, None);

        let progress = self.lock_state().as_ref().map(|t| t.progress);
        tracing::info!(
            site = %self.config.id,
            task = %task_id,
            progress = ?progress,
            "Preheat completed"
        );
    }

    /// Warm a single URL, returning the cached payload size.
    async fn warm_one(&self, url: &str) -> Result<u64, AppError> {
        match self.config.preheat.mode {
            PreheatMode::Render => {
                let rendered = self
                    .dispatcher
                    .render_with_cache(url, &RenderOptions::default())
                    .await?;
                if rendered.result.success {
                    Ok(rendered.result.html.len() as u64)
                } else {
                    Err(AppError::Generic(
                        rendered
                            .result
                            .error
                            .unwrap_or_else(|| "render failed".to_string()),
                    ))
                }
            }
            PreheatMode::Http => {
                let Some(warm) = &self.warm else {
                    return Err(AppError::Config(
                        "http preheat mode requires a warm fetcher".into(),
                    ));
                };
                let body = warm.fetch(url).await?;
                if body.trim().is_empty() {
                    return Err(AppError::InvalidDocument(format!("empty response for {url}")));
                }
                let size = body.len() as u64;
                let result = RenderResult::ok(body);
                if let Err(e) = self.cache.put(url, &result).await {
                    tracing::warn!(%url, error = %e, "Cache write failed during http warm");
                }
                Ok(size)
            }
        }
    }

    async fn sweep_due_inner(self: Arc<Self>) {
        let records = match self.store.hash_get_all(&keys::url_status(&self.config.id)).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(site = %self.config.id, error = %e, "Auto-preheat sweep skipped");
                return;
            }
        };
        let Ok(base) = Url::parse(&self.config.base_url) else {
            return;
        };
        let ttl = chrono::Duration::from_std(self.config.cache.ttl).unwrap_or_default();
        let margin = chrono::Duration::from_std(self.config.preheat.refresh_margin)
            .unwrap_or_default();
        let now = Utc::now();

        for (route, raw) in records {
            let Ok(record) = serde_json::from_str::<UrlRecord>(&raw) else {
                continue;
            };
            if now - record.updated_at < ttl - margin {
                continue;
            }
            let Ok(url) = base.join(&route) else { continue };
            tracing::debug!(site = %self.config.id, %route, "Route near expiry; re-warming");
            let manager = Arc::clone(&self);
            let url = url.to_string();
            self.tasks.spawn(async move {
                if let Err(e) = manager.warm_url(&url).await {
                    tracing::debug!(site = %manager.config.id, %url, error = %e, "Auto re-warm failed");
                }
            });
        }
    }

    /// Read back the aggregate statistics written at the end of a run.
    pub async fn site_stats(&self) -> Result<SiteStats, AppError> {
        let fields = self.store.hash_get_all(&keys::stats(&self.config.id)).await?;
        let mut stats = SiteStats::default();
        if let Some(v) = fields.get("url_count") {
            stats.url_count = v.parse().unwrap_or(0);
        }
        if let Some(v) = fields.get("cached_count") {
            stats.cached_count = v.parse().unwrap_or(0);
        }
        if let Some(v) = fields.get("cache_bytes") {
            stats.cache_bytes = v.parse().unwrap_or(0);
        }
        if let Some(v) = fields.get("last_preheat_at") {
            stats.last_preheat_at = v.parse().ok();
        }
        Ok(stats)
    }

    async fn write_site_stats(&self) -> Result<(), AppError> {
        let records = self.store.hash_get_all(&keys::url_status(&self.config.id)).await?;
        let mut cached_count = 0u64;
        let mut cache_bytes = 0u64;
        for raw in records.values() {
            if let Ok(record) = serde_json::from_str::<UrlRecord>(raw) {
                if record.status == UrlStatus::Cached {
                    cached_count += 1;
                    cache_bytes += record.size;
                }
            }
        }

        let key = keys::stats(&self.config.id);
        self.store
            .hash_set(&key, "url_count", &records.len().to_string())
            .await?;
        self.store
            .hash_set(&key, "cached_count", &cached_count.to_string())
            .await?;
        self.store
            .hash_set(&key, "cache_bytes", &cache_bytes.to_string())
            .await?;
        self.store
            .hash_set(&key, "last_preheat_at", &Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    /// Update a route's status record. Best-effort: the warm itself
    /// already succeeded or failed; a status-write failure is logged.
    async fn record_url_status(&self, route: &str, status: UrlStatus, size: u64) {
        let key = keys::url_status(&self.config.id);
        let mut record = match self.store.hash_get(&key, route).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|_| UrlRecord::pending(route)),
            _ => UrlRecord::pending(route),
        };
        match status {
            UrlStatus::Cached => record.mark_cached(size),
            UrlStatus::Failed => record.mark_failed(),
            UrlStatus::Pending => {}
        }
        match serde_json::to_string(&record) {
            Ok(raw) => {
                if let Err(e) = self.store.hash_set(&key, route, &raw).await {
                    tracing::warn!(site = %self.config.id, %route, error = %e, "Status write failed");
                }
            }
            Err(e) => {
                tracing::warn!(site = %self.config.id, %route, error = %e, "Status encode failed");
            }
        }
    }

    /// Bump progress counters after one URL; mirrored into the store
    /// best-effort for external observers.
    fn count_url(&self, task_id: Uuid, succeeded: bool) {
        self.update_state(|t| {
            t.progress.processed += 1;
            if succeeded {
                t.progress.succeeded += 1;
            } else {
                t.progress.failed += 1;
            }
        });

        let store = self.store.clone();
        let site = self.config.id.clone();
        let field = if succeeded { "succeeded" } else { "failed" };
        let key = keys::preheat_counter(&site, &task_id, field);
        let processed_key = keys::preheat_counter(&site, &task_id, "processed");
        self.tasks.spawn(async move {
            let _ = store.incr_by(&key, 1).await;
            let _ = store.incr_by(&processed_key, 1).await;
        });
    }

    fn finish(&self, status: PreheatStatus, error: Option<String>) {
        self.update_state(|t| {
            t.status = status;
            t.finished_at = Some(Utc::now());
            t.error = error.clone();
        });
    }

    fn update_state(&self, f: impl FnOnce(&mut PreheatTask)) {
        if let Some(task) = self.lock_state().as_mut() {
            f(task);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<PreheatTask>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned preheat mutex");
            poisoned.into_inner()
        })
    }
}
