use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use snapgate_core::config::PoolConfig;
use snapgate_core::traits::BrowserSession;
use uuid::Uuid;

/// Lifecycle state of a pool handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Available,
    Working,
    Closed,
}

impl fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleStatus::Available => "available",
            HandleStatus::Working => "working",
            HandleStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Why the health pass decided to replace a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceReason {
    Expired,
    TooManyErrors,
    IdleTooLong,
    Unhealthy,
}

impl fmt::Display for ReplaceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplaceReason::Expired => "expired",
            ReplaceReason::TooManyErrors => "too many errors",
            ReplaceReason::IdleTooLong => "idle too long",
            ReplaceReason::Unhealthy => "marked unhealthy",
        };
        write!(f, "{s}")
    }
}

/// One headless-browser instance owned by the pool.
///
/// Exactly one task owns a handle at a time; the session is behind an
/// `Arc` only so a timed-out execution can be abandoned without losing
/// the handle's bookkeeping.
pub struct BrowserHandle<S: BrowserSession> {
    id: String,
    pub session: Arc<S>,
    status: HandleStatus,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    error_count: u32,
}

impl<S: BrowserSession> BrowserHandle<S> {
    pub fn new(session: S) -> Self {
        let now = Instant::now();
        Self {
            id: format!("handle-{}", &Uuid::new_v4().to_string()[..8]),
            session: Arc::new(session),
            status: HandleStatus::Available,
            created_at: now,
            last_used: now,
            healthy: true,
            error_count: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> HandleStatus {
        self.status
    }

    pub fn set_status(&mut self, status: HandleStatus) {
        self.status = status;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// A successful render resets the consecutive-error streak.
    pub fn record_success(&mut self) {
        self.last_used = Instant::now();
        self.error_count = 0;
    }

    pub fn record_failure(&mut self) {
        self.last_used = Instant::now();
        self.error_count += 1;
    }

    /// Flag the handle for replacement regardless of thresholds
    /// (e.g. after a recovered panic).
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Used when a replacement launch fails and the handle must stay in
    /// service without immediately re-tripping the health check.
    pub fn reset_errors(&mut self) {
        self.error_count = 0;
        self.healthy = true;
    }

    /// Health verdict against the pool policy, or `None` if the handle
    /// can stay.
    pub fn replace_reason(&self, config: &PoolConfig) -> Option<ReplaceReason> {
        if !self.healthy {
            return Some(ReplaceReason::Unhealthy);
        }
        if self.error_count > config.max_errors {
            return Some(ReplaceReason::TooManyErrors);
        }
        if self.age() > config.max_lifetime {
            return Some(ReplaceReason::Expired);
        }
        if self.status == HandleStatus::Available && self.idle_for() > config.idle_timeout {
            return Some(ReplaceReason::IdleTooLong);
        }
        None
    }
}

/// Point-in-time view of a handle, for ops and tests.
#[derive(Debug, Clone)]
pub struct HandleSnapshot {
    pub id: String,
    pub status: HandleStatus,
    pub healthy: bool,
    pub error_count: u32,
    pub age: Duration,
}

impl<S: BrowserSession> From<&BrowserHandle<S>> for HandleSnapshot {
    fn from(handle: &BrowserHandle<S>) -> Self {
        Self {
            id: handle.id.clone(),
            status: handle.status,
            healthy: handle.healthy,
            error_count: handle.error_count,
            age: handle.age(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapgate_core::testutil::MockDriver;
    use snapgate_core::traits::BrowserDriver;

    async fn handle() -> BrowserHandle<snapgate_core::testutil::MockSession> {
        BrowserHandle::new(MockDriver::new().launch().await.unwrap())
    }

    #[tokio::test]
    async fn fresh_handle_is_healthy() {
        let h = handle().await;
        assert!(h.is_healthy());
        assert_eq!(h.error_count(), 0);
        assert_eq!(h.status(), HandleStatus::Available);
        assert!(h.replace_reason(&PoolConfig::default()).is_none());
        assert!(h.id().starts_with("handle-"));
    }

    #[tokio::test]
    async fn error_streak_trips_replacement() {
        let config = PoolConfig::default();
        let mut h = handle().await;
        for _ in 0..=config.max_errors {
            h.record_failure();
        }
        assert_eq!(
            h.replace_reason(&config),
            Some(ReplaceReason::TooManyErrors)
        );

        // A success in between clears the streak.
        h.record_success();
        assert!(h.replace_reason(&config).is_none());
    }

    #[tokio::test]
    async fn unhealthy_flag_wins_over_thresholds() {
        let mut h = handle().await;
        h.mark_unhealthy();
        assert_eq!(
            h.replace_reason(&PoolConfig::default()),
            Some(ReplaceReason::Unhealthy)
        );

        h.reset_errors();
        assert!(h.replace_reason(&PoolConfig::default()).is_none());
    }

    #[tokio::test]
    async fn idle_timeout_only_applies_to_available_handles() {
        let config = PoolConfig {
            idle_timeout: Duration::ZERO,
            ..PoolConfig::default()
        };
        let mut h = handle().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.replace_reason(&config), Some(ReplaceReason::IdleTooLong));

        h.set_status(HandleStatus::Working);
        assert!(h.replace_reason(&config).is_none());
    }
}
