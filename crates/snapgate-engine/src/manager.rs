//! Multi-tenant registry: one engine per configured site, plus the
//! auto-preheat daemon that sweeps every preheat-enabled site.
//!
//! The manager is an explicit value constructed once at startup and
//! passed by reference — there is no global registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use snapgate_core::config::SiteConfig;
use snapgate_core::error::AppError;
use snapgate_core::traits::{BrowserDriver, KvStore, WarmFetcher};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::engine::Engine;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct EngineManager<D: BrowserDriver, K: KvStore, W: WarmFetcher + 'static> {
    driver: D,
    store: K,
    warm: Option<W>,
    engines: RwLock<HashMap<String, Arc<Engine<D, K, W>>>>,
    sweep_interval: Duration,
    cancel: CancellationToken,
    daemon: TaskTracker,
}

impl<D: BrowserDriver, K: KvStore, W: WarmFetcher + 'static> EngineManager<D, K, W> {
    pub fn new(driver: D, store: K, warm: Option<W>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            store,
            warm,
            engines: RwLock::new(HashMap::new()),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            cancel: CancellationToken::new(),
            daemon: TaskTracker::new(),
        })
    }

    pub fn with_sweep_interval(driver: D, store: K, warm: Option<W>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            driver,
            store,
            warm,
            engines: RwLock::new(HashMap::new()),
            sweep_interval: interval,
            cancel: CancellationToken::new(),
            daemon: TaskTracker::new(),
        })
    }

    /// Register a site and build its engine. The engine is not started;
    /// reconfiguring a site is remove-then-add.
    pub fn add_site(&self, config: SiteConfig) -> Result<Arc<Engine<D, K, W>>, AppError> {
        let mut engines = self.lock_engines_mut();
        if engines.contains_key(&config.id) {
            return Err(AppError::Config(format!(
                "site {} is already registered",
                config.id
            )));
        }
        let engine = Engine::new(
            config,
            self.driver.clone(),
            self.store.clone(),
            self.warm.clone(),
        )?;
        engines.insert(engine.site_id().to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    /// Deregister a site and stop its engine.
    pub async fn remove_site(&self, site_id: &str) -> Result<(), AppError> {
        let engine = self
            .lock_engines_mut()
            .remove(site_id)
            .ok_or_else(|| AppError::UnknownSite(site_id.to_string()))?;
        engine.stop().await;
        Ok(())
    }

    pub fn get_engine(&self, site_id: &str) -> Option<Arc<Engine<D, K, W>>> {
        self.lock_engines().get(site_id).cloned()
    }

    pub fn list_sites(&self) -> Vec<String> {
        let mut sites: Vec<String> = self.lock_engines().keys().cloned().collect();
        sites.sort();
        sites
    }

    /// Start every registered engine. Per-site failures are logged and
    /// the rest still start; the first error is returned.
    pub async fn start_all(&self) -> Result<(), AppError> {
        let engines = self.snapshot();
        let mut first_error = None;
        for engine in engines {
            if engine.is_started() {
                continue;
            }
            if let Err(e) = engine.start().await {
                tracing::error!(site = %engine.site_id(), error = %e, "Engine start failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start the auto-preheat daemon: a periodic sweep that re-warms
    /// near-expiry routes on every preheat-enabled site.
    pub fn start_auto_preheat(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.child_token();
        self.daemon.spawn(async move {
            let mut ticker = tokio::time::interval(manager.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => manager.auto_preheat_pass(),
                }
            }
            tracing::debug!("Auto-preheat daemon stopped");
        });
    }

    /// One daemon tick over every site. Best-effort by design.
    pub fn auto_preheat_pass(&self) {
        for engine in self.snapshot() {
            if engine.preheat_enabled() && engine.is_started() {
                engine.auto_preheat_pass();
            }
        }
    }

    /// Stop the daemon and every engine, leaving the registry empty.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        self.daemon.close();
        self.daemon.wait().await;

        let engines: Vec<_> = self.lock_engines_mut().drain().map(|(_, e)| e).collect();
        for engine in engines {
            engine.stop().await;
        }
        tracing::info!("All engines stopped");
    }

    fn snapshot(&self) -> Vec<Arc<Engine<D, K, W>>> {
        self.lock_engines().values().cloned().collect()
    }

    fn lock_engines(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Engine<D, K, W>>>> {
        self.engines.read().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_engines_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Engine<D, K, W>>>> {
        self.engines.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapgate_core::config::PoolConfig;
    use snapgate_core::store::MemoryStore;
    use snapgate_core::testutil::{MockDriver, MockWarmFetcher};

    fn config(id: &str) -> SiteConfig {
        let mut config = SiteConfig::new(id, "target.example", "https://target.example");
        config.pool = PoolConfig {
            initial_size: 1,
            min_size: 1,
            max_size: 2,
            ..PoolConfig::default()
        };
        config
    }

    fn manager() -> Arc<EngineManager<MockDriver, MemoryStore, MockWarmFetcher>> {
        EngineManager::new(MockDriver::new(), MemoryStore::new(), None)
    }

    #[tokio::test]
    async fn add_list_get_remove_lifecycle() {
        let manager = manager();
        manager.add_site(config("alpha")).unwrap();
        manager.add_site(config("beta")).unwrap();

        assert_eq!(manager.list_sites(), vec!["alpha", "beta"]);
        assert!(manager.get_engine("alpha").is_some());
        assert!(manager.get_engine("missing").is_none());

        manager.remove_site("alpha").await.unwrap();
        assert_eq!(manager.list_sites(), vec!["beta"]);
        assert!(matches!(
            manager.remove_site("alpha").await,
            Err(AppError::UnknownSite(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_site_registration_is_rejected() {
        let manager = manager();
        manager.add_site(config("alpha")).unwrap();
        assert!(matches!(
            manager.add_site(config("alpha")),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn start_all_and_stop_all() {
        let manager = manager();
        manager.add_site(config("alpha")).unwrap();
        manager.add_site(config("beta")).unwrap();

        manager.start_all().await.unwrap();
        assert!(manager.get_engine("alpha").unwrap().is_started());
        assert!(manager.get_engine("beta").unwrap().is_started());

        // Exactly one engine per active site; starting again is a no-op
        // because both are already running.
        manager.start_all().await.unwrap();

        manager.stop_all().await;
        assert!(manager.list_sites().is_empty());
    }

    #[tokio::test]
    async fn auto_preheat_daemon_rewarns_stale_sites() {
        let driver = MockDriver::new().page(
            "https://target.example/",
            "<html><body>home</body></html>",
        );
        let manager = EngineManager::<_, _, MockWarmFetcher>::with_sweep_interval(
            driver.clone(),
            MemoryStore::new(),
            None,
            Duration::from_millis(50),
        );

        let mut site = config("alpha");
        site.preheat.enabled = true;
        site.preheat.max_depth = 1;
        // Cached entries go stale immediately, so every sweep re-warms.
        site.cache.ttl = Duration::from_millis(1);
        site.preheat.refresh_margin = Duration::ZERO;
        manager.add_site(site).unwrap();
        manager.start_all().await.unwrap();

        let engine = manager.get_engine("alpha").unwrap();
        engine.trigger_preheat().unwrap();
        for _ in 0..100 {
            if !engine.preheat_status().is_running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let renders_after_preheat = driver.renders();

        manager.start_auto_preheat();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(
            driver.renders() > renders_after_preheat,
            "daemon must re-warm stale routes"
        );
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn removed_site_is_stopped() {
        let manager = manager();
        let engine = manager.add_site(config("alpha")).unwrap();
        manager.start_all().await.unwrap();
        assert!(engine.is_started());

        manager.remove_site("alpha").await.unwrap();
        assert!(!engine.is_started());
    }
}
