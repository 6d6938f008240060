use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a single render execution. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResult {
    pub html: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl RenderResult {
    pub fn ok(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            html: String::new(),
            success: false,
            error: Some(error.into()),
        }
    }

    /// True for successful renders that actually carry a document —
    /// the only results worth caching.
    pub fn is_cacheable(&self) -> bool {
        self.success && !self.html.is_empty()
    }
}

/// A render result together with its cache provenance.
#[derive(Debug, Clone)]
pub struct CachedRender {
    pub result: RenderResult,
    pub hit_cache: bool,
}

/// Preheat status of a discovered route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    Pending,
    Cached,
    Failed,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Cached => "cached",
            UrlStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UrlStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UrlStatus::Pending),
            "cached" => Ok(UrlStatus::Cached),
            "failed" => Ok(UrlStatus::Failed),
            _ => Err(format!("Unknown url status: {s}")),
        }
    }
}

/// Persisted record of a discovered route.
///
/// Created by the crawler; mutated by every (re)warm attempt. Individual
/// records are never deleted — the whole set is cleared when a fresh
/// crawl starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRecord {
    pub route: String,
    pub status: UrlStatus,
    pub updated_at: DateTime<Utc>,
    /// Cached payload size in bytes; zero until first successful warm.
    pub size: u64,
}

impl UrlRecord {
    pub fn pending(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            status: UrlStatus::Pending,
            updated_at: Utc::now(),
            size: 0,
        }
    }

    pub fn mark_cached(&mut self, size: u64) {
        self.status = UrlStatus::Cached;
        self.size = size;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self) {
        self.status = UrlStatus::Failed;
        self.updated_at = Utc::now();
    }
}

/// Status of a preheat run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreheatStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PreheatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreheatStatus::Pending => "pending",
            PreheatStatus::Running => "running",
            PreheatStatus::Completed => "completed",
            PreheatStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PreheatStatus::Completed | PreheatStatus::Failed)
    }
}

impl fmt::Display for PreheatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PreheatStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PreheatStatus::Pending),
            "running" => Ok(PreheatStatus::Running),
            "completed" => Ok(PreheatStatus::Completed),
            "failed" => Ok(PreheatStatus::Failed),
            _ => Err(format!("Unknown preheat status: {s}")),
        }
    }
}

/// Progress counters for a preheat run, updated after every URL.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PreheatProgress {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// One preheat run. Terminal once completed or failed; at most one
/// active per site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreheatTask {
    pub id: Uuid,
    pub status: PreheatStatus,
    pub progress: PreheatProgress,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PreheatTask {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: PreheatStatus::Pending,
            progress: PreheatProgress::default(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }
}

impl Default for PreheatTask {
    fn default() -> Self {
        Self::new()
    }
}

/// Site-level aggregates, persisted via the key-value capability and
/// refreshed at the end of every preheat run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteStats {
    pub url_count: u64,
    pub cached_count: u64,
    /// Estimated cache footprint in bytes.
    pub cache_bytes: u64,
    pub last_preheat_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_result_cacheable() {
        assert!(RenderResult::ok("<html></html>").is_cacheable());
        assert!(!RenderResult::ok("").is_cacheable());
        assert!(!RenderResult::failed("nav error").is_cacheable());
    }

    #[test]
    fn url_status_roundtrip() {
        for status in [UrlStatus::Pending, UrlStatus::Cached, UrlStatus::Failed] {
            let parsed: UrlStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("warm".parse::<UrlStatus>().is_err());
    }

    #[test]
    fn preheat_status_terminal_states() {
        assert!(!PreheatStatus::Pending.is_terminal());
        assert!(!PreheatStatus::Running.is_terminal());
        assert!(PreheatStatus::Completed.is_terminal());
        assert!(PreheatStatus::Failed.is_terminal());
    }

    #[test]
    fn url_record_transitions() {
        let mut rec = UrlRecord::pending("/about");
        assert_eq!(rec.status, UrlStatus::Pending);
        assert_eq!(rec.size, 0);

        rec.mark_cached(2048);
        assert_eq!(rec.status, UrlStatus::Cached);
        assert_eq!(rec.size, 2048);

        rec.mark_failed();
        assert_eq!(rec.status, UrlStatus::Failed);
        // Size of the last good payload is retained.
        assert_eq!(rec.size, 2048);
    }

    #[test]
    fn url_record_serde_roundtrip() {
        let rec = UrlRecord::pending("/contact?lang=en");
        let json = serde_json::to_string(&rec).unwrap();
        let back: UrlRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.route, rec.route);
        assert_eq!(back.status, rec.status);
    }
}
