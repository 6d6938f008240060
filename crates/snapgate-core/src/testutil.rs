//! Test utilities: mock implementations of the core capability traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks
//! use `Arc<Mutex<_>>` interior mutability so tests can assert on
//! recorded calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::WaitUntil;
use crate::error::AppError;
use crate::traits::{BrowserDriver, BrowserSession, WarmFetcher};

// ---------------------------------------------------------------------------
// MockDriver / MockSession
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockScript {
    /// Exact-URL page bodies. URLs not listed get a default document.
    pages: HashMap<String, String>,
    /// URLs whose render fails with the given message.
    failures: HashMap<String, String>,
    /// URLs whose render panics (for recovery tests).
    panics: HashSet<String>,
    /// Artificial render latency (for timeout tests).
    delay: Option<Duration>,
    /// Remaining launches that should fail.
    launch_failures: usize,
}

/// Mock browser driver with scripted per-URL behavior and call counters.
#[derive(Clone, Default)]
pub struct MockDriver {
    script: Arc<Mutex<MockScript>>,
    launches: Arc<AtomicUsize>,
    renders: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `html` for exactly `url`.
    pub fn page(self, url: &str, html: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .pages
            .insert(url.to_string(), html.to_string());
        self
    }

    /// Fail renders of `url` with a navigation error.
    pub fn fail_url(self, url: &str, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .failures
            .insert(url.to_string(), message.to_string());
        self
    }

    /// Panic inside renders of `url`.
    pub fn panic_url(self, url: &str) -> Self {
        self.script.lock().unwrap().panics.insert(url.to_string());
        self
    }

    pub fn with_render_delay(self, delay: Duration) -> Self {
        self.script.lock().unwrap().delay = Some(delay);
        self
    }

    /// Make the next `n` launches fail.
    pub fn fail_next_launches(&self, n: usize) {
        self.script.lock().unwrap().launch_failures = n;
    }

    /// Stop failing a previously scripted URL.
    pub fn heal_url(&self, url: &str) {
        self.script.lock().unwrap().failures.remove(url);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl BrowserDriver for MockDriver {
    type Session = MockSession;

    async fn launch(&self) -> Result<MockSession, AppError> {
        {
            let mut script = self.script.lock().unwrap();
            if script.launch_failures > 0 {
                script.launch_failures -= 1;
                return Err(AppError::Browser("mock launch failure".into()));
            }
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            script: Arc::clone(&self.script),
            renders: Arc::clone(&self.renders),
            closes: Arc::clone(&self.closes),
        })
    }
}

/// Session handed out by [`MockDriver`]; shares the driver's script.
pub struct MockSession {
    script: Arc<Mutex<MockScript>>,
    renders: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl BrowserSession for MockSession {
    async fn render(
        &self,
        url: &str,
        _wait: WaitUntil,
        _timeout: Duration,
    ) -> Result<String, AppError> {
        self.renders.fetch_add(1, Ordering::SeqCst);

        // Check the panic script and drop the guard before panicking so a
        // scripted panic does not poison the shared mutex (which the pool's
        // handle-replacement path also locks).
        if self.script.lock().unwrap().panics.contains(url) {
            panic!("scripted render panic for {url}");
        }

        let (delay, outcome) = {
            let script = self.script.lock().unwrap();
            let outcome = if let Some(message) = script.failures.get(url) {
                Err(AppError::Navigation {
                    url: url.to_string(),
                    message: message.clone(),
                })
            } else {
                Ok(script.pages.get(url).cloned().unwrap_or_else(|| {
                    "<html><head><title>mock</title></head><body>mock page</body></html>"
                        .to_string()
                }))
            };
            (script.delay, outcome)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn close(&self) -> Result<(), AppError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockWarmFetcher
// ---------------------------------------------------------------------------

/// Warm fetcher that records fetched URLs and returns a fixed body.
#[derive(Clone)]
pub struct MockWarmFetcher {
    body: String,
    pub fetched: Arc<Mutex<Vec<String>>>,
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockWarmFetcher {
    pub fn new(body: &str) -> Self {
        Self {
            body: body.to_string(),
            fetched: Arc::new(Mutex::new(Vec::new())),
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        let fetcher = Self::new("");
        *fetcher.error.lock().unwrap() = Some(error);
        fetcher
    }
}

impl WarmFetcher for MockWarmFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        self.fetched.lock().unwrap().push(url.to_string());
        Ok(self.body.clone())
    }
}

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// Store that fails every operation, for degraded-mode tests.
#[derive(Clone, Default)]
pub struct FailingStore;

impl crate::traits::KvStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, AppError> {
        Err(AppError::Store("store down".into()))
    }

    async fn set_with_ttl(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<(), AppError> {
        Err(AppError::Store("store down".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), AppError> {
        Err(AppError::Store("store down".into()))
    }

    async fn hash_set(&self, _key: &str, _field: &str, _value: &str) -> Result<(), AppError> {
        Err(AppError::Store("store down".into()))
    }

    async fn hash_get(&self, _key: &str, _field: &str) -> Result<Option<String>, AppError> {
        Err(AppError::Store("store down".into()))
    }

    async fn hash_get_all(
        &self,
        _key: &str,
    ) -> Result<HashMap<String, String>, AppError> {
        Err(AppError::Store("store down".into()))
    }

    async fn set_add(&self, _key: &str, _member: &str) -> Result<(), AppError> {
        Err(AppError::Store("store down".into()))
    }

    async fn set_members(&self, _key: &str) -> Result<Vec<String>, AppError> {
        Err(AppError::Store("store down".into()))
    }

    async fn incr_by(&self, _key: &str, _delta: i64) -> Result<i64, AppError> {
        Err(AppError::Store("store down".into()))
    }
}
