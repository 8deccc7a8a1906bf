//! Runtime configuration, read from environment variables with compiled
//! defaults. Cache sizing and TTLs live here because they are deployment
//! concerns, not cache logic.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_MEMORY_BUDGET_BYTES, DEFAULT_RATE_LIMIT_PER_SECOND,
    INDICATOR_CACHE_TTL_SECONDS,
};

/// Sizing for one cache instance
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub memory_budget_bytes: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            memory_budget_bytes: DEFAULT_CACHE_MEMORY_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub provider_base_url: String,
    pub provider_rate_limit_per_second: u32,
    pub bar_cache: CacheSettings,
    pub indicator_cache: CacheSettings,
    pub indicator_cache_ttl: Duration,
    /// Poll cadence for background symbol sync
    pub sync_interval: Duration,
    /// Tickers refreshed by the watch workers
    pub watch_symbols: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/pricewatch.db"),
            provider_base_url: "http://localhost:9000".to_string(),
            provider_rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
            bar_cache: CacheSettings::default(),
            indicator_cache: CacheSettings::default(),
            indicator_cache_ttl: Duration::from_secs(INDICATOR_CACHE_TTL_SECONDS),
            sync_interval: Duration::from_secs(60),
            watch_symbols: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(path) = std::env::var("PRICEWATCH_DB") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("PRICEWATCH_PROVIDER_URL") {
            config.provider_base_url = url;
        }
        if let Some(limit) = env_parse::<u32>("PRICEWATCH_RATE_LIMIT") {
            config.provider_rate_limit_per_second = limit.max(1);
        }
        if let Some(entries) = env_parse::<usize>("PRICEWATCH_CACHE_MAX_ENTRIES") {
            config.bar_cache.max_entries = entries;
            config.indicator_cache.max_entries = entries;
        }
        if let Some(budget) = env_parse::<usize>("PRICEWATCH_CACHE_BUDGET_BYTES") {
            config.bar_cache.memory_budget_bytes = budget;
            config.indicator_cache.memory_budget_bytes = budget;
        }
        if let Some(secs) = env_parse::<u64>("PRICEWATCH_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(secs.max(1));
        }
        if let Ok(symbols) = std::env::var("PRICEWATCH_SYMBOLS") {
            config.watch_symbols = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert!(config.provider_rate_limit_per_second >= 1);
        assert!(config.bar_cache.max_entries > 0);
        assert!(config.sync_interval >= Duration::from_secs(1));
    }
}
