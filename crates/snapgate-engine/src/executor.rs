use std::time::Duration;

use snapgate_core::config::{RenderOptions, WaitUntil};
use snapgate_core::model::RenderResult;
use snapgate_core::traits::BrowserSession;
use snapgate_core::urlutil::{is_payment_callback, is_static_asset};

/// Hard ceiling on any single render, bounding worst-case hold time on
/// a shared handle regardless of per-task overrides.
pub const MAX_RENDER_TIMEOUT: Duration = Duration::from_secs(120);

/// True for URLs that must never reach the browser driver: static
/// assets and payment-provider callbacks short-circuit to a trivial
/// empty success.
pub fn should_short_circuit(url: &str) -> bool {
    is_static_asset(url) || is_payment_callback(url)
}

/// Drives one render on a borrowed session and validates the outcome.
///
/// Never returns an error: every failure mode is folded into a
/// `success = false` result so the dispatcher can uniformly record it
/// against the task and the handle.
#[derive(Clone)]
pub struct RenderExecutor {
    default_timeout: Duration,
    default_wait: WaitUntil,
}

impl RenderExecutor {
    pub fn new(default_timeout: Duration, default_wait: WaitUntil) -> Self {
        Self {
            default_timeout,
            default_wait,
        }
    }

    /// Task timeout: the task's override, else the engine default,
    /// ceilinged at [`MAX_RENDER_TIMEOUT`].
    pub fn effective_timeout(&self, options: &RenderOptions) -> Duration {
        options
            .timeout
            .unwrap_or(self.default_timeout)
            .min(MAX_RENDER_TIMEOUT)
    }

    pub async fn execute<S: BrowserSession>(
        &self,
        session: &S,
        url: &str,
        options: &RenderOptions,
    ) -> RenderResult {
        if should_short_circuit(url) {
            tracing::debug!(%url, "Short-circuiting non-renderable URL");
            return RenderResult::ok(String::new());
        }

        let wait = options.wait_until.unwrap_or(self.default_wait);
        let timeout = self.effective_timeout(options);

        match session.render(url, wait, timeout).await {
            Ok(html) => validate_document(url, html),
            Err(e) => {
                tracing::debug!(%url, error = %e, "Render failed");
                RenderResult::failed(e.to_string())
            }
        }
    }
}

/// Structural validation of a rendered document. Tolerant on purpose:
/// a missing `<body>` alone is logged, not failed, to keep false
/// negatives down on exotic-but-valid markup.
fn validate_document(url: &str, html: String) -> RenderResult {
    if html.trim().is_empty() {
        return RenderResult::failed(format!("empty document for {url}"));
    }
    let lower = html.to_lowercase();
    if !lower.contains("<html") {
        return RenderResult::failed(format!("document for {url} has no <html> element"));
    }
    if !lower.contains("<body") {
        tracing::warn!(%url, "Rendered document has no <body> element");
    }
    RenderResult::ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapgate_core::testutil::MockDriver;
    use snapgate_core::traits::BrowserDriver;

    fn executor() -> RenderExecutor {
        RenderExecutor::new(Duration::from_secs(30), WaitUntil::Default)
    }

    #[tokio::test]
    async fn renders_and_validates_a_page() {
        let driver = MockDriver::new().page(
            "https://site.example/about",
            "<html><body>about us</body></html>",
        );
        let session = driver.launch().await.unwrap();

        let result = executor()
            .execute(&session, "https://site.example/about", &RenderOptions::default())
            .await;

        assert!(result.success);
        assert!(result.html.contains("about us"));
        assert_eq!(driver.renders(), 1);
    }

    #[tokio::test]
    async fn static_asset_short_circuits_without_driver() {
        let driver = MockDriver::new();
        let session = driver.launch().await.unwrap();

        let result = executor()
            .execute(&session, "https://site.example/logo.png", &RenderOptions::default())
            .await;

        assert!(result.success);
        assert!(result.html.is_empty());
        assert_eq!(driver.renders(), 0);
    }

    #[tokio::test]
    async fn payment_callback_short_circuits_without_driver() {
        let driver = MockDriver::new();
        let session = driver.launch().await.unwrap();

        let result = executor()
            .execute(
                &session,
                "https://site.example/pay/callback?notify=1",
                &RenderOptions::default(),
            )
            .await;

        assert!(result.success);
        assert!(result.html.is_empty());
        assert_eq!(driver.renders(), 0);
    }

    #[tokio::test]
    async fn navigation_failure_becomes_failed_result() {
        let driver = MockDriver::new().fail_url("https://site.example/broken", "connection reset");
        let session = driver.launch().await.unwrap();

        let result = executor()
            .execute(&session, "https://site.example/broken", &RenderOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn empty_document_fails_validation() {
        let driver = MockDriver::new().page("https://site.example/blank", "   ");
        let session = driver.launch().await.unwrap();

        let result = executor()
            .execute(&session, "https://site.example/blank", &RenderOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("empty document"));
    }

    #[tokio::test]
    async fn missing_body_is_tolerated() {
        let driver = MockDriver::new().page(
            "https://site.example/odd",
            "<html><head><title>odd</title></head></html>",
        );
        let session = driver.launch().await.unwrap();

        let result = executor()
            .execute(&session, "https://site.example/odd", &RenderOptions::default())
            .await;

        assert!(result.success);
    }

    #[test]
    fn timeout_override_is_ceilinged() {
        let exec = executor();
        assert_eq!(
            exec.effective_timeout(&RenderOptions::default()),
            Duration::from_secs(30)
        );
        assert_eq!(
            exec.effective_timeout(
                &RenderOptions::default().with_timeout(Duration::from_secs(10))
            ),
            Duration::from_secs(10)
        );
        assert_eq!(
            exec.effective_timeout(
                &RenderOptions::default().with_timeout(Duration::from_secs(600))
            ),
            MAX_RENDER_TIMEOUT
        );
    }
}
