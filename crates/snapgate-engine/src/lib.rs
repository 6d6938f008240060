pub mod crawler;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod handle;
mod keys;
pub mod manager;
pub mod pool;
pub mod preheat;

pub use crawler::Crawler;
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use executor::RenderExecutor;
pub use handle::{BrowserHandle, HandleSnapshot, HandleStatus};
pub use manager::EngineManager;
pub use pool::{BrowserPool, PoolStats};
pub use preheat::{PreheatManager, PreheatSnapshot};
