pub mod alert_engine;
pub mod cache;
pub mod conditions;
pub mod indicators;
pub mod orchestrator;
pub mod provider;
pub mod store;

pub use alert_engine::{AlertEngine, CooldownStore, InMemoryCooldowns, PriceUpdate};
pub use cache::{bar_key, indicator_key, CacheStats, ResultCache};
pub use orchestrator::CandleService;
pub use provider::{CandleFeed, HttpCandleFeed, ProviderClient, SharedRateLimiter};
pub use store::MarketStore;
