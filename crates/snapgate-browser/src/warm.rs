use std::time::Duration;

use reqwest::Client;
use snapgate_core::error::AppError;
use snapgate_core::traits::WarmFetcher;

/// User-Agent sent by the lightweight warm path so the origin (or this
/// middleware itself, when warming through the front door) takes the
/// request for crawler traffic.
const WARM_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

/// Plain-HTTP cache warmer.
///
/// Used by the `PreheatMode::Http` configuration, where a GET with a
/// crawler User-Agent is enough to populate the cache and a full
/// browser render would be wasted work.
#[derive(Clone)]
pub struct HttpWarmFetcher {
    client: Client,
    timeout_secs: u64,
}

impl HttpWarmFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(WARM_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Http(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

impl WarmFetcher for HttpWarmFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::Http(format!("Connection failed: {e}"))
            } else {
                AppError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Http(format!("HTTP {} for {}", status.as_u16(), url)));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::Http(format!("Failed to read response body: {e}")))
    }
}
