//! Per-site engine: the aggregate of pool, dispatcher, cache, and
//! preheat manager behind the `render` entry point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use snapgate_core::cache::{CacheBackend, KvRenderCache, LruRenderCache, RenderCache};
use snapgate_core::config::{RenderOptions, SiteConfig, SiteMode};
use snapgate_core::error::AppError;
use snapgate_core::model::{CachedRender, RenderResult, SiteStats};
use snapgate_core::traits::{BrowserDriver, KvStore, WarmFetcher};
use snapgate_browser::StaticSiteReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, RenderTask};
use crate::executor::RenderExecutor;
use crate::pool::{BrowserPool, PoolStats};
use crate::preheat::{PreheatManager, PreheatSnapshot};

/// Bound on queued-but-unmatched render tasks per site.
const RENDER_QUEUE_CAPACITY: usize = 256;

pub struct Engine<D: BrowserDriver, K: KvStore, W: WarmFetcher + 'static> {
    config: Arc<SiteConfig>,
    pool: Arc<BrowserPool<D>>,
    dispatcher: Arc<Dispatcher<D, K>>,
    cache: Arc<CacheBackend<K>>,
    preheat: Arc<PreheatManager<D, K, W>>,
    static_reader: Option<StaticSiteReader>,
    cancel: CancellationToken,
    background: TaskTracker,
    queue_rx: std::sync::Mutex<Option<mpsc::Receiver<RenderTask>>>,
    started: AtomicBool,
}

impl<D: BrowserDriver, K: KvStore, W: WarmFetcher + 'static> Engine<D, K, W> {
    /// Build an engine for one site. Nothing is launched until
    /// [`start`](Self::start).
    pub fn new(
        config: SiteConfig,
        driver: D,
        store: K,
        warm: Option<W>,
    ) -> Result<Arc<Self>, AppError> {
        config.validate()?;
        let config = Arc::new(config);

        let cancel = CancellationToken::new();
        let queue_depth = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let pool = BrowserPool::new(
            driver,
            config.pool.clone(),
            config.scaling.clone(),
            Arc::clone(&queue_depth),
        );

        let cache = Arc::new(if config.cache.durable {
            CacheBackend::Durable(KvRenderCache::new(
                store.clone(),
                config.id.clone(),
                config.cache.ttl,
            ))
        } else {
            CacheBackend::Memory(LruRenderCache::new(config.cache.capacity, config.cache.ttl))
        });

        let executor = RenderExecutor::new(config.render_timeout, config.wait_until);
        let (dispatcher, queue_rx) = Dispatcher::new(
            Arc::clone(&pool),
            executor,
            Arc::clone(&cache),
            RENDER_QUEUE_CAPACITY,
            queue_depth,
            cancel.child_token(),
        );

        let preheat = PreheatManager::new(
            Arc::clone(&config),
            Arc::clone(&dispatcher),
            Arc::clone(&cache),
            store,
            warm,
            cancel.child_token(),
        );

        let static_reader = match (config.mode, &config.static_dir) {
            (SiteMode::Static, Some(dir)) => Some(StaticSiteReader::new(dir)),
            _ => None,
        };

        Ok(Arc::new(Self {
            config,
            pool,
            dispatcher,
            cache,
            preheat,
            static_reader,
            cancel,
            background: TaskTracker::new(),
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
            started: AtomicBool::new(false),
        }))
    }

    pub fn site_id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// Allocate the browser pool and start every background loop.
    pub async fn start(&self) -> Result<(), AppError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::Config(format!(
                "engine for site {} already started",
                self.config.id
            )));
        }

        self.pool.init().await.inspect_err(|_| {
            self.started.store(false, Ordering::SeqCst);
        })?;

        let queue_rx = self
            .queue_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| AppError::Generic("render queue already consumed".into()))?;

        self.background
            .spawn(Arc::clone(&self.dispatcher).run(queue_rx));
        self.background
            .spawn(Arc::clone(&self.pool).run_health_loop(self.cancel.child_token()));
        self.background
            .spawn(Arc::clone(&self.pool).run_scaling_loop(self.cancel.child_token()));
        self.background.spawn(run_cache_cleanup_loop(
            Arc::clone(&self.cache),
            self.config.cache.cleanup_interval,
            self.cancel.child_token(),
        ));

        tracing::info!(site = %self.config.id, "Engine started");
        Ok(())
    }

    /// The single render entry point used by live crawler traffic and
    /// by preheat.
    pub async fn render(
        &self,
        url: &str,
        options: &RenderOptions,
    ) -> Result<CachedRender, AppError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(AppError::Generic(format!(
                "engine for site {} is not running",
                self.config.id
            )));
        }

        // Static sites bypass the browser entirely.
        if let Some(reader) = &self.static_reader {
            let route = Url::parse(url)
                .map(|u| snapgate_core::urlutil::normalize_route(&u))
                .unwrap_or_else(|_| url.to_string());
            let html = reader.read(&route).await?;
            return Ok(CachedRender {
                result: RenderResult::ok(html),
                hit_cache: false,
            });
        }

        self.dispatcher.render_with_cache(url, options).await
    }

    pub fn trigger_preheat(&self) -> Result<Uuid, AppError> {
        self.preheat.trigger()
    }

    pub fn trigger_preheat_with(&self, base_url: Url, domain: String) -> Result<Uuid, AppError> {
        self.preheat.trigger_with(base_url, domain)
    }

    /// Spot re-warm of one URL.
    pub async fn preheat_url(&self, url: &str) -> Result<(), AppError> {
        self.preheat.warm_url(url).await
    }

    pub fn preheat_status(&self) -> PreheatSnapshot {
        self.preheat.status()
    }

    pub fn preheat_enabled(&self) -> bool {
        self.config.preheat.enabled
    }

    /// True if the User-Agent matches a built-in or site-custom crawler
    /// signature; the request-routing layer uses this to decide whether
    /// to call [`render`](Self::render) at all.
    pub fn is_crawler_request(&self, user_agent: &str) -> bool {
        snapgate_core::detect::is_crawler_request(user_agent, &self.config.crawler_headers)
    }

    /// The merged default + site-custom crawler signature list.
    pub fn crawler_headers(&self) -> Vec<String> {
        snapgate_core::detect::crawler_headers(&self.config.crawler_headers)
    }

    /// One auto-preheat sweep over this site's route set.
    pub fn auto_preheat_pass(&self) {
        self.preheat.sweep_due();
    }

    pub async fn stats(&self) -> Result<SiteStats, AppError> {
        self.preheat.site_stats().await
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stop the engine: cancel every loop, wait for in-flight work to
    /// unwind, then close the browser handles.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(site = %self.config.id, "Stopping engine");

        self.cancel.cancel();
        self.background.close();
        self.background.wait().await;
        self.preheat.shutdown().await;
        self.dispatcher.shutdown().await;
        self.pool.close().await;

        tracing::info!(site = %self.config.id, "Engine stopped");
    }
}

async fn run_cache_cleanup_loop<K: KvStore>(
    cache: Arc<CacheBackend<K>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match cache.clear_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(%removed, "Expired cache entries evicted"),
                    Err(e) => tracing::warn!(error = %e, "Cache cleanup failed"),
                }
            }
        }
    }
}
