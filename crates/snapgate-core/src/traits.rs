use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::config::WaitUntil;
use crate::error::AppError;

/// Launches headless-browser sessions.
///
/// One driver is shared per engine; each call to [`launch`](Self::launch)
/// produces an independent session owned by exactly one pool handle.
pub trait BrowserDriver: Send + Sync + Clone + 'static {
    type Session: BrowserSession;

    fn launch(&self) -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

/// One live headless-browser instance.
///
/// `render` must report timeouts distinctly from navigation failures
/// ([`AppError::Timeout`] vs [`AppError::Navigation`]) so the pool can
/// classify handle health correctly.
pub trait BrowserSession: Send + Sync + 'static {
    /// Navigate to `url`, apply the wait policy, and return the fully
    /// rendered document HTML.
    fn render(
        &self,
        url: &str,
        wait: WaitUntil,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Terminate the underlying browser process.
    fn close(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Plain HTTP fetch with a spoofed crawler User-Agent, for the
/// lightweight preheat mode where a full render is unnecessary.
pub trait WarmFetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Durable key-value capability used by the cache (durable mode), the
/// crawler's route set, preheat status records, and site statistics.
///
/// Implementations must apply each operation atomically with respect to
/// concurrent calls on the same key; callers never compose read-modify-
/// write sequences that need cross-key transactions.
pub trait KvStore: Send + Sync + Clone + 'static {
    // -- strings -----------------------------------------------------------

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    /// Set a string value that expires after `ttl`.
    fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    // -- hashes ------------------------------------------------------------

    fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn hash_get(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn hash_get_all(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, String>, AppError>> + Send;

    // -- sets --------------------------------------------------------------

    fn set_add(&self, key: &str, member: &str)
    -> impl Future<Output = Result<(), AppError>> + Send;

    fn set_members(&self, key: &str) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    // -- counters ----------------------------------------------------------

    fn incr_by(&self, key: &str, delta: i64)
    -> impl Future<Output = Result<i64, AppError>> + Send;
}
