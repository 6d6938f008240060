//! Link discoverer: bounded-depth, bounded-concurrency breadth
//! traversal of a site, recording its route set as it goes.
//!
//! One crawler value exists per run; the preheat manager creates it
//! fresh each time. Pages are rendered through the dispatcher — never
//! the cache — because traversal must see the live DOM.

use std::collections::HashSet;
use std::sync::Arc;

use scraper::{Html, Selector};
use snapgate_core::config::RenderOptions;
use snapgate_core::error::AppError;
use snapgate_core::model::UrlRecord;
use snapgate_core::traits::{BrowserDriver, KvStore};
use snapgate_core::urlutil::{is_static_asset, normalize_route, same_domain};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::dispatcher::Dispatcher;
use crate::keys;

pub struct Crawler<D: BrowserDriver, K: KvStore> {
    site_id: String,
    base_url: Url,
    domain: String,
    max_depth: usize,
    concurrency: usize,
    dispatcher: Arc<Dispatcher<D, K>>,
    store: K,
    cancel: CancellationToken,
}

impl<D: BrowserDriver, K: KvStore> Crawler<D, K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site_id: impl Into<String>,
        base_url: Url,
        domain: impl Into<String>,
        max_depth: usize,
        concurrency: usize,
        dispatcher: Arc<Dispatcher<D, K>>,
        store: K,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            base_url,
            domain: domain.into(),
            max_depth,
            concurrency: concurrency.max(1),
            dispatcher,
            store,
            cancel,
        }
    }

    /// Run one crawl. Clears the previously recorded route set first,
    /// so a re-run never leaves a mix of old and new routes. Returns
    /// the number of routes recorded.
    ///
    /// Store failures abort the crawl; a failed render of a single
    /// page only prunes that branch.
    pub async fn run(&self) -> Result<usize, AppError> {
        tracing::info!(site = %self.site_id, base = %self.base_url, "Starting crawl");

        self.store.delete(&keys::routes(&self.site_id)).await?;
        self.store.delete(&keys::url_status(&self.site_id)).await?;

        let mut visited: HashSet<String> = HashSet::new();
        let base_route = normalize_route(&self.base_url);
        visited.insert(base_route.clone());
        self.record_route(&base_route).await?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut frontier = vec![self.base_url.clone()];
        let mut depth = 0;

        while !frontier.is_empty() && depth < self.max_depth {
            if self.cancel.is_cancelled() {
                tracing::info!(site = %self.site_id, "Crawl cancelled");
                break;
            }

            let mut renders: JoinSet<Vec<Url>> = JoinSet::new();
            for url in frontier.drain(..) {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| AppError::Cancelled)?;
                let dispatcher = Arc::clone(&self.dispatcher);
                let cancel = self.cancel.clone();
                renders.spawn(async move {
                    let _permit = permit;
                    if cancel.is_cancelled() {
                        return Vec::new();
                    }
                    match dispatcher.render(url.as_str(), &RenderOptions::default()).await {
                        Ok(result) if result.success => extract_links(&result.html, &url),
                        Ok(result) => {
                            tracing::warn!(
                                url = %url,
                                error = result.error.as_deref().unwrap_or("unknown"),
                                "Crawl render failed; pruning branch"
                            );
                            Vec::new()
                        }
                        Err(e) => {
                            tracing::warn!(url = %url, error = %e, "Crawl render failed; pruning branch");
                            Vec::new()
                        }
                    }
                });
            }

            let mut next = Vec::new();
            while let Some(joined) = renders.join_next().await {
                let Ok(links) = joined else { continue };
                for link in links {
                    if !same_domain(&link, &self.domain) {
                        continue;
                    }
                    let route = normalize_route(&link);
                    if is_static_asset(&route) {
                        continue;
                    }
                    if visited.insert(route.clone()) {
                        self.record_route(&route).await?;
                        next.push(link);
                    }
                }
            }

            frontier = next;
            depth += 1;
        }

        tracing::info!(site = %self.site_id, routes = visited.len(), "Crawl finished");
        Ok(visited.len())
    }

    async fn record_route(&self, route: &str) -> Result<(), AppError> {
        self.store
            .set_add(&keys::routes(&self.site_id), route)
            .await?;
        let record = serde_json::to_string(&UrlRecord::pending(route))?;
        self.store
            .hash_set(&keys::url_status(&self.site_id), route, &record)
            .await
    }
}

/// Harvest anchor targets from a rendered document, resolved against
/// the page URL and filtered to navigable http(s) links.
fn extract_links(html: &str, page_url: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let anchor_selector = Selector::parse("a[href]").unwrap();

    let mut links = Vec::new();
    for element in document.select(&anchor_selector) {
        let Some(href) = element.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty()
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("data:")
            || href.starts_with("blob:")
        {
            continue;
        }
        let Ok(resolved) = page_url.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        links.push(resolved);
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapgate_core::cache::{CacheBackend, LruRenderCache};
    use snapgate_core::config::{PoolConfig, ScalingConfig, WaitUntil};
    use snapgate_core::store::MemoryStore;
    use snapgate_core::testutil::{FailingStore, MockDriver};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::executor::RenderExecutor;
    use crate::pool::BrowserPool;

    async fn dispatcher_for<K: KvStore>(
        driver: MockDriver,
    ) -> Arc<Dispatcher<MockDriver, K>> {
        let depth = Arc::new(AtomicUsize::new(0));
        let pool = BrowserPool::new(
            driver,
            PoolConfig {
                initial_size: 2,
                min_size: 1,
                max_size: 4,
                ..PoolConfig::default()
            },
            ScalingConfig::default(),
            Arc::clone(&depth),
        );
        pool.init().await.unwrap();
        let cache = Arc::new(CacheBackend::<K>::Memory(LruRenderCache::new(
            100,
            Duration::from_secs(60),
        )));
        let (dispatcher, queue_rx) = Dispatcher::new(
            pool,
            RenderExecutor::new(Duration::from_secs(5), WaitUntil::Default),
            cache,
            32,
            depth,
            CancellationToken::new(),
        );
        tokio::spawn(Arc::clone(&dispatcher).run(queue_rx));
        dispatcher
    }

    fn crawler<K: KvStore>(
        dispatcher: Arc<Dispatcher<MockDriver, K>>,
        store: K,
        max_depth: usize,
    ) -> Crawler<MockDriver, K> {
        Crawler::new(
            "site-1",
            Url::parse("https://target.example/").unwrap(),
            "target.example",
            max_depth,
            4,
            dispatcher,
            store,
            CancellationToken::new(),
        )
    }

    fn three_page_driver() -> MockDriver {
        MockDriver::new()
            .page(
                "https://target.example/",
                r#"<html><body>
                    <a href="/about">About</a>
                    <a href="/contact">Contact</a>
                    <a href="https://other.example/elsewhere">Elsewhere</a>
                    <a href="ftp://target.example/file">Legacy</a>
                    <a href="javascript:void(0)">Noop</a>
                    <a href="/banner.png">Banner</a>
                </body></html>"#,
            )
            .page(
                "https://target.example/about",
                r#"<html><body><a href="/">Home</a><a href="/contact">Contact</a></body></html>"#,
            )
            .page(
                "https://target.example/contact",
                r#"<html><body><a href="/">Home</a></body></html>"#,
            )
    }

    #[tokio::test]
    async fn discovers_same_domain_routes_only() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher_for::<MemoryStore>(three_page_driver()).await;
        let crawled = crawler(dispatcher, store.clone(), 3).run().await.unwrap();

        assert_eq!(crawled, 3);
        let routes = store.set_members(&keys::routes("site-1")).await.unwrap();
        assert_eq!(routes, vec!["/", "/about", "/contact"]);
    }

    #[tokio::test]
    async fn records_pending_status_for_each_route() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher_for::<MemoryStore>(three_page_driver()).await;
        crawler(dispatcher, store.clone(), 3).run().await.unwrap();

        let records = store.hash_get_all(&keys::url_status("site-1")).await.unwrap();
        assert_eq!(records.len(), 3);
        let about: UrlRecord = serde_json::from_str(&records["/about"]).unwrap();
        assert_eq!(about.status, snapgate_core::model::UrlStatus::Pending);
    }

    #[tokio::test]
    async fn rerun_clears_previous_route_set() {
        let store = MemoryStore::new();
        // Seed a stale route from an earlier crawl.
        store
            .set_add(&keys::routes("site-1"), "/stale-route")
            .await
            .unwrap();

        let dispatcher = dispatcher_for::<MemoryStore>(three_page_driver()).await;
        crawler(dispatcher, store.clone(), 3).run().await.unwrap();

        let routes = store.set_members(&keys::routes("site-1")).await.unwrap();
        assert!(!routes.contains(&"/stale-route".to_string()));
        assert_eq!(routes.len(), 3);
    }

    #[tokio::test]
    async fn depth_bound_limits_traversal() {
        // Chain: / -> /l1 -> /l2 -> /l3
        let driver = MockDriver::new()
            .page(
                "https://target.example/",
                r#"<html><body><a href="/l1">1</a></body></html>"#,
            )
            .page(
                "https://target.example/l1",
                r#"<html><body><a href="/l2">2</a></body></html>"#,
            )
            .page(
                "https://target.example/l2",
                r#"<html><body><a href="/l3">3</a></body></html>"#,
            );
        let store = MemoryStore::new();
        let dispatcher = dispatcher_for::<MemoryStore>(driver).await;
        crawler(dispatcher, store.clone(), 2).run().await.unwrap();

        let routes = store.set_members(&keys::routes("site-1")).await.unwrap();
        // Depth 2 renders / and /l1; /l2 is recorded but not expanded.
        assert_eq!(routes, vec!["/", "/l1", "/l2"]);
    }

    #[tokio::test]
    async fn failed_page_prunes_branch_not_crawl() {
        let driver = three_page_driver().fail_url("https://target.example/about", "reset");
        let store = MemoryStore::new();
        let dispatcher = dispatcher_for::<MemoryStore>(driver).await;
        let crawled = crawler(dispatcher, store.clone(), 3).run().await.unwrap();

        // /about is still recorded (discovered from /), just not expanded.
        assert_eq!(crawled, 3);
    }

    #[tokio::test]
    async fn store_failure_aborts_the_crawl() {
        let dispatcher = dispatcher_for::<FailingStore>(three_page_driver()).await;
        let result = crawler(dispatcher, FailingStore, 3).run().await;
        assert!(matches!(result, Err(AppError::Store(_))));
    }

    #[test]
    fn link_extraction_resolves_and_filters() {
        let page = Url::parse("https://target.example/docs/").unwrap();
        let links = extract_links(
            r#"<html><body>
                <a href="intro">Relative</a>
                <a href="/pricing">Rooted</a>
                <a href="https://target.example/full">Absolute</a>
                <a href="mailto:x@example.com">Mail</a>
                <a href="javascript:void(0)">Noop</a>
            </body></html>"#,
            &page,
        );
        let as_strings: Vec<String> = links.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            as_strings,
            vec![
                "https://target.example/docs/intro",
                "https://target.example/pricing",
                "https://target.example/full",
            ]
        );
    }

    #[test]
    fn fragment_links_become_distinct_routes() {
        let page = Url::parse("https://target.example/").unwrap();
        let links = extract_links(
            r##"<html><body><a href="/#/dashboard">App</a></body></html>"##,
            &page,
        );
        assert_eq!(links.len(), 1);
        assert_eq!(normalize_route(&links[0]), "/#/dashboard");
    }
}
