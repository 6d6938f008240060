pub mod cache;
pub mod config;
pub mod detect;
pub mod error;
pub mod model;
pub mod store;
pub mod testutil;
pub mod traits;
pub mod urlutil;

pub use cache::{CacheBackend, KvRenderCache, LruRenderCache, RenderCache};
pub use config::{RenderOptions, SiteConfig, SiteMode, WaitUntil};
pub use error::AppError;
pub use model::{CachedRender, PreheatStatus, PreheatTask, RenderResult, SiteStats, UrlStatus};
pub use store::MemoryStore;
pub use traits::{BrowserDriver, BrowserSession, KvStore, WarmFetcher};
