use thiserror::Error;

/// Application-wide error types for Snapgate.
#[derive(Error, Debug)]
pub enum AppError {
    /// Browser driver failed (launch, CDP connection, page open).
    #[error("Browser error: {0}")]
    Browser(String),

    /// Page navigation failed before the load event.
    #[error("Navigation error for {url}: {message}")]
    Navigation { url: String, message: String },

    /// Render or fetch timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rendered document failed structural validation.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Plain HTTP request failed (warm fetch).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Key-value store unavailable or failed.
    #[error("Store unavailable: {0}")]
    Store(String),

    /// Static file could not be served.
    #[error("Static file error: {0}")]
    StaticFile(String),

    /// A preheat run is already in progress for this site.
    #[error("Preheat already running for site {0}")]
    PreheatRunning(String),

    /// The crawl phase of a preheat run failed outright.
    #[error("Crawl failed: {0}")]
    CrawlFailed(String),

    /// Browser pool could not be initialized.
    #[error("Pool initialization failed: {0}")]
    PoolInit(String),

    /// The caller went away before a result could be delivered,
    /// or the engine is shutting down.
    #[error("Operation cancelled")]
    Cancelled,

    /// No engine registered for the requested site.
    #[error("Unknown site: {0}")]
    UnknownSite(String),

    /// Site configuration is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying
    /// on a later preheat sweep or live request.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Timeout(_) | AppError::Store(_) => true,
            AppError::Navigation { message, .. } => {
                message.contains("timeout") || message.contains("connect") || message.contains("reset")
            }
            AppError::Http(msg) => msg.contains("timeout") || msg.contains("connect"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::Store("connection refused".into()).is_retryable());
        assert!(
            AppError::Navigation {
                url: "https://a.example/".into(),
                message: "connect refused".into(),
            }
            .is_retryable()
        );
        assert!(!AppError::InvalidDocument("empty".into()).is_retryable());
        assert!(!AppError::PreheatRunning("site-1".into()).is_retryable());
    }
}
