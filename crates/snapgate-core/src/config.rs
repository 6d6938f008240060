use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// How the surrounding service answers non-crawler traffic for a site.
///
/// The render engine itself only cares about `Static` (enables the
/// static-file fast path); the other modes are consumed by the proxy
/// layer in front of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SiteMode {
    #[default]
    Proxy,
    Static,
    Redirect,
}

/// Browser wait policy applied after navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// No in-flight network requests for 500ms.
    NetworkIdle0,
    /// At most two in-flight network requests for 500ms.
    NetworkIdle2,
    DomContentLoaded,
    Load,
    /// Driver default (load event plus a short settle delay).
    #[default]
    Default,
}

/// Whether preheat warms routes with a full browser render or a plain
/// HTTP GET carrying a crawler User-Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreheatMode {
    #[default]
    Render,
    Http,
}

/// Per-task render options. All fields optional; engine defaults apply.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Overrides the engine's default render timeout.
    pub timeout: Option<Duration>,
    /// Overrides the engine's default wait policy.
    pub wait_until: Option<WaitUntil>,
}

impl RenderOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_wait_until(mut self, wait: WaitUntil) -> Self {
        self.wait_until = Some(wait);
        self
    }
}

/// Browser pool sizing and health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Handles launched at engine start.
    pub initial_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// A handle older than this is replaced at the next health pass.
    #[serde(with = "secs")]
    pub max_lifetime: Duration,
    /// An `available` handle idle longer than this is replaced.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// Consecutive errors before a handle is considered unhealthy.
    pub max_errors: u32,
    #[serde(with = "secs")]
    pub health_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 2,
            min_size: 1,
            max_size: 8,
            max_lifetime: Duration::from_secs(2 * 60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            max_errors: 4,
            health_interval: Duration::from_secs(30),
        }
    }
}

/// Dynamic pool scaling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub enabled: bool,
    /// Fraction of current size added/removed per step; at least one
    /// handle moves per step.
    pub factor: f64,
    #[serde(with = "secs")]
    pub interval: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            factor: 0.25,
            interval: Duration::from_secs(10),
        }
    }
}

/// Render-cache sizing and freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window; an older entry is treated as absent.
    #[serde(with = "secs")]
    pub ttl: Duration,
    /// Entry capacity of the in-memory backend.
    pub capacity: usize,
    /// Use the durable key-value store instead of the in-memory LRU.
    pub durable: bool,
    #[serde(with = "secs")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            capacity: 1000,
            durable: false,
            cleanup_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Preheat and crawl behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreheatConfig {
    pub enabled: bool,
    pub mode: PreheatMode,
    /// Crawl depth bound, counting the base URL as depth 0.
    pub max_depth: usize,
    /// Concurrent page traversals during a crawl.
    pub crawl_concurrency: usize,
    /// Upper bound on routes warmed per preheat run.
    pub max_urls: usize,
    /// Cap on concurrent warms (also bounded by pool size).
    pub warm_concurrency: usize,
    /// A route whose status record is within this margin of the cache
    /// TTL is re-warmed by the auto-preheat sweep.
    #[serde(with = "secs")]
    pub refresh_margin: Duration,
}

impl Default for PreheatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: PreheatMode::Render,
            max_depth: 3,
            crawl_concurrency: 4,
            max_urls: 1000,
            warm_concurrency: 10,
            refresh_margin: Duration::from_secs(10 * 60),
        }
    }
}

/// Full per-site configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Stable site identifier, used as the cache/store namespace.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Configured domain. A port here makes domain matching port-exact.
    pub domain: String,
    /// Origin the crawler starts from, e.g. `https://app.example.com`.
    pub base_url: String,
    #[serde(default)]
    pub mode: SiteMode,
    /// Root directory for `SiteMode::Static` sites.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    /// Default render timeout.
    #[serde(default = "default_render_timeout", with = "secs")]
    pub render_timeout: Duration,
    #[serde(default)]
    pub wait_until: WaitUntil,
    /// Site-specific crawler User-Agent substrings, merged with the
    /// built-in list.
    #[serde(default)]
    pub crawler_headers: Vec<String>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub preheat: PreheatConfig,
}

fn default_render_timeout() -> Duration {
    Duration::from_secs(30)
}

impl SiteConfig {
    pub fn new(id: impl Into<String>, domain: impl Into<String>, base_url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            domain: domain.into(),
            base_url: base_url.into(),
            mode: SiteMode::default(),
            static_dir: None,
            render_timeout: default_render_timeout(),
            wait_until: WaitUntil::default(),
            crawler_headers: Vec::new(),
            pool: PoolConfig::default(),
            scaling: ScalingConfig::default(),
            cache: CacheConfig::default(),
            preheat: PreheatConfig::default(),
        }
    }

    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.is_empty() {
            return Err(AppError::Config("site id must not be empty".into()));
        }
        if self.domain.is_empty() {
            return Err(AppError::Config("site domain must not be empty".into()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| AppError::Config(format!("invalid base_url '{}': {e}", self.base_url)))?;
        if self.pool.min_size == 0 || self.pool.min_size > self.pool.max_size {
            return Err(AppError::Config(format!(
                "pool sizes must satisfy 1 <= min ({}) <= max ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.pool.initial_size < self.pool.min_size || self.pool.initial_size > self.pool.max_size {
            return Err(AppError::Config(format!(
                "initial pool size {} outside [{}, {}]",
                self.pool.initial_size, self.pool.min_size, self.pool.max_size
            )));
        }
        if self.mode == SiteMode::Static && self.static_dir.is_none() {
            return Err(AppError::Config(
                "static mode requires static_dir".into(),
            ));
        }
        Ok(())
    }
}

/// Serde helper: durations persisted as whole seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
