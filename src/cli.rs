use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::models::Interval;
use crate::services::{
    AlertEngine, CandleService, HttpCandleFeed, InMemoryCooldowns, MarketStore, ProviderClient,
    ResultCache, SharedRateLimiter,
};
use crate::worker::SyncWorker;

#[derive(Parser)]
#[command(name = "pricewatch")]
#[command(about = "Market data pipeline and alert engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch and store history for one symbol
    Pull {
        /// Ticker symbol, e.g. AAPL
        ticker: String,
        /// Bar interval (1m, 5m, 15m, 30m, 1H, 1D, 1W, 1M)
        #[arg(short, long, default_value = "1D")]
        interval: String,
        /// Days of history to pull
        #[arg(short, long, default_value_t = 365)]
        days: i64,
    },
    /// Run background sync and alert evaluation for configured symbols
    Watch {
        /// Bar interval to poll
        #[arg(short, long, default_value = "1D")]
        interval: String,
    },
    /// Show store statistics
    Status,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Pull {
            ticker,
            interval,
            days,
        } => pull(&config, &ticker, &interval, days).await,
        Commands::Watch { interval } => watch(&config, &interval).await,
        Commands::Status => status(&config).await,
    }
}

fn build_service(config: &Config, store: Arc<MarketStore>) -> Result<CandleService<HttpCandleFeed>> {
    let feed = HttpCandleFeed::new(&config.provider_base_url)
        .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
    let limiter = Arc::new(SharedRateLimiter::new(config.provider_rate_limit_per_second));
    let provider = ProviderClient::new(feed, limiter);
    let bar_cache = Arc::new(ResultCache::new(
        "bars",
        config.bar_cache.max_entries,
        config.bar_cache.memory_budget_bytes,
    ));
    Ok(CandleService::new(store, provider, bar_cache))
}

async fn pull(config: &Config, ticker: &str, interval: &str, days: i64) -> Result<()> {
    let interval = Interval::from_str(interval)?;
    let store = Arc::new(MarketStore::new(config.database_path.clone()).await?);
    let service = build_service(config, Arc::clone(&store))?;

    let ticker = ticker.to_uppercase();
    let symbol_id = store.ensure_symbol(&ticker).await?;
    let end = chrono::Utc::now();
    let start = end - chrono::Duration::days(days);

    let saved = service
        .fetch_and_save(symbol_id, &ticker, interval, start, end)
        .await?;
    println!("{}: saved {} bars ({})", ticker, saved, interval);
    store.close().await;
    Ok(())
}

async fn watch(config: &Config, interval: &str) -> Result<()> {
    let interval = Interval::from_str(interval)?;
    let store = Arc::new(MarketStore::new(config.database_path.clone()).await?);
    let service = Arc::new(build_service(config, Arc::clone(&store))?);
    let engine = Arc::new(AlertEngine::new(Arc::clone(&store), InMemoryCooldowns::new()));
    let indicator_cache = Arc::new(ResultCache::new(
        "indicators",
        config.indicator_cache.max_entries,
        config.indicator_cache.memory_budget_bytes,
    ));

    let worker = SyncWorker::new(
        service,
        engine,
        indicator_cache,
        config.indicator_cache_ttl,
        interval,
        config.sync_interval,
    );
    crate::worker::sync_worker::run_watch(worker, config.watch_symbols.clone()).await;
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    let store = Arc::new(MarketStore::new(config.database_path.clone()).await?);
    let stats = store.stats().await?;
    println!("symbols:        {}", stats.symbols);
    println!("candles:        {}", stats.candles);
    println!("active alerts:  {}", stats.active_alerts);
    println!("triggers fired: {}", stats.triggers);
    store.close().await;
    Ok(())
}
