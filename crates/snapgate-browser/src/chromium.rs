use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use snapgate_core::config::WaitUntil;
use snapgate_core::error::AppError;
use snapgate_core::traits::{BrowserDriver, BrowserSession};

/// Settle time applied after the load event for network-idle policies;
/// the CDP load event fires before late XHR-driven DOM updates land.
const NETWORK_IDLE_SETTLE: Duration = Duration::from_millis(500);

/// Extra settle time when the URL carries a fragment: fragment routers
/// resolve the view client-side after the network-level load event.
const FRAGMENT_SETTLE: Duration = Duration::from_millis(800);

/// Headless-Chromium driver using the Chrome DevTools Protocol.
///
/// Each [`launch`](BrowserDriver::launch) starts one Chromium process
/// owned by exactly one pool handle; every render opens a fresh tab,
/// reads the rendered DOM, and closes the tab.
#[derive(Clone, Default)]
pub struct ChromiumDriver {
    chrome_binary: Option<PathBuf>,
}

impl ChromiumDriver {
    pub fn new() -> Self {
        Self {
            chrome_binary: find_chrome_binary(),
        }
    }

    /// Use a specific Chrome/Chromium binary instead of probing.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            chrome_binary: Some(binary),
        }
    }
}

impl BrowserDriver for ChromiumDriver {
    type Session = ChromiumSession;

    async fn launch(&self) -> Result<ChromiumSession, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox();

        if let Some(bin) = &self.chrome_binary {
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--single-process")
            .arg("--ignore-certificate-errors")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::Browser(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Browser(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(ChromiumSession {
            browser: tokio::sync::Mutex::new(browser),
            handler_task,
        })
    }
}

/// One live Chromium process plus its CDP event pump.
pub struct ChromiumSession {
    browser: tokio::sync::Mutex<Browser>,
    handler_task: tokio::task::JoinHandle<()>,
}

impl ChromiumSession {
    async fn render_inner(&self, url: &str, wait: WaitUntil) -> Result<String, AppError> {
        let page = {
            let browser = self.browser.lock().await;
            browser.new_page(url).await.map_err(|e| AppError::Navigation {
                url: url.to_string(),
                message: format!("Failed to open page: {e}"),
            })?
        };

        page.wait_for_navigation()
            .await
            .map_err(|e| AppError::Navigation {
                url: url.to_string(),
                message: format!("Navigation did not complete: {e}"),
            })?;

        match wait {
            WaitUntil::NetworkIdle0 | WaitUntil::NetworkIdle2 => {
                tokio::time::sleep(NETWORK_IDLE_SETTLE).await;
            }
            WaitUntil::DomContentLoaded | WaitUntil::Load => {}
            WaitUntil::Default => {
                tokio::time::sleep(NETWORK_IDLE_SETTLE / 2).await;
            }
        }

        if url.contains('#') {
            tokio::time::sleep(FRAGMENT_SETTLE).await;
        }

        let html = page.content().await.map_err(|e| AppError::Browser(format!(
            "Failed to read page content for {url}: {e}"
        )))?;

        // Free the tab; a close failure only leaks one tab until the
        // handle itself is replaced.
        let _ = page.close().await;

        Ok(html)
    }
}

impl BrowserSession for ChromiumSession {
    async fn render(
        &self,
        url: &str,
        wait: WaitUntil,
        timeout: Duration,
    ) -> Result<String, AppError> {
        match tokio::time::timeout(timeout, self.render_inner(url, wait)).await {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(timeout.as_secs())),
        }
    }

    async fn close(&self) -> Result<(), AppError> {
        let mut browser = self.browser.lock().await;
        let result = browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| AppError::Browser(format!("Failed to close browser: {e}")));
        self.handler_task.abort();
        result
    }
}

/// Tries to locate the real Chrome/Chromium binary.
///
/// Snap-packaged Chromium exposes a wrapper that strips standard Chrome
/// CLI flags; we look for the real binary inside the snap first, then
/// fall back to well-known system paths. `None` lets chromiumoxide do
/// its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    let candidates: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}
