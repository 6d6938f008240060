pub mod chromium;
pub mod static_files;
pub mod warm;

pub use chromium::{ChromiumDriver, ChromiumSession};
pub use static_files::StaticSiteReader;
pub use warm::HttpWarmFetcher;
