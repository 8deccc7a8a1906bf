//! Background symbol sync.
//!
//! One logical unit of work per symbol per iteration: refresh recent bars
//! through the orchestrator's write path, derive the latest price pair,
//! compute indicator snapshots for the symbol's alerts, and hand the
//! update to the alert engine. A symbol's failure never stops the loop.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::models::{Interval, IndicatorSnapshot};
use crate::services::alert_engine::{AlertEngine, CooldownStore, PriceUpdate};
use crate::services::cache::{indicator_key, ResultCache};
use crate::services::indicators;
use crate::services::orchestrator::CandleService;
use crate::services::provider::CandleFeed;

/// How much history each refresh re-requests; wide enough to cover
/// indicator warmup without re-pulling deep history every iteration.
const REFRESH_BARS: i64 = 250;

pub struct SyncWorker<F: CandleFeed, C: CooldownStore> {
    service: Arc<CandleService<F>>,
    engine: Arc<AlertEngine<C>>,
    indicator_cache: Arc<ResultCache<IndicatorSnapshot>>,
    indicator_ttl: Duration,
    interval: Interval,
    poll_interval: Duration,
}

impl<F: CandleFeed, C: CooldownStore> SyncWorker<F, C> {
    pub fn new(
        service: Arc<CandleService<F>>,
        engine: Arc<AlertEngine<C>>,
        indicator_cache: Arc<ResultCache<IndicatorSnapshot>>,
        indicator_ttl: Duration,
        interval: Interval,
        poll_interval: Duration,
    ) -> Self {
        Self {
            service,
            engine,
            indicator_cache,
            indicator_ttl,
            interval,
            poll_interval,
        }
    }

    #[instrument(skip(self, tickers), fields(interval = %self.interval))]
    pub async fn run(&self, tickers: Vec<String>) {
        info!(
            symbols = tickers.len(),
            poll_secs = self.poll_interval.as_secs(),
            "starting sync worker"
        );

        let mut iteration_count = 0u64;
        loop {
            iteration_count += 1;
            let loop_start = std::time::Instant::now();

            for ticker in &tickers {
                if let Err(e) = self.sync_symbol(ticker).await {
                    warn!(
                        iteration = iteration_count,
                        ticker,
                        error = %e,
                        "symbol sync failed, continuing"
                    );
                }
            }

            info!(
                iteration = iteration_count,
                duration_secs = loop_start.elapsed().as_secs_f64(),
                "sync iteration completed"
            );
            sleep(self.poll_interval).await;
        }
    }

    async fn sync_symbol(&self, ticker: &str) -> crate::error::Result<()> {
        let store = self.service.store();
        let symbol_id = store.ensure_symbol(ticker).await?;

        let end = Utc::now();
        let start = end - ChronoDuration::seconds(REFRESH_BARS * self.interval.duration_secs());
        let saved = self
            .service
            .fetch_and_save(symbol_id, ticker, self.interval, start, end)
            .await?;
        if saved > 0 {
            // New bars change every series derived from this symbol; cached
            // snapshots would otherwise serve value pairs up to a full TTL
            // stale and crossing conditions could miss the transition
            self.indicator_cache.invalidate_by_symbol(ticker).await;
        }

        let bars = store
            .query_candles(symbol_id, self.interval, start, end)
            .await?;
        if bars.is_empty() {
            return Ok(());
        }

        let current_price = bars[bars.len() - 1].close;
        let previous_price = (bars.len() >= 2).then(|| bars[bars.len() - 2].close);
        let bar_timestamp = Some(bars[bars.len() - 1].time);

        let indicator_data_map = self.snapshots_for_symbol(symbol_id, ticker, &bars).await?;

        let update = PriceUpdate {
            current_price,
            previous_price,
            indicator_data: None,
            indicator_data_map: Some(indicator_data_map),
            bar_timestamp,
        };

        let fired = self.engine.evaluate_symbol_alerts(symbol_id, &update).await?;
        if !fired.is_empty() {
            info!(ticker, triggers = fired.len(), "alerts fired");
        }
        Ok(())
    }

    /// Compute (or reuse cached) snapshots for every distinct indicator
    /// among the symbol's active alerts. A failed computation leaves its
    /// map entry absent; the engine then skips that alert only.
    async fn snapshots_for_symbol(
        &self,
        symbol_id: i64,
        ticker: &str,
        bars: &[crate::models::Candle],
    ) -> crate::error::Result<HashMap<String, IndicatorSnapshot>> {
        let alerts = self.service.store().load_active_alerts(symbol_id).await?;
        let mut map = HashMap::new();

        for alert in &alerts {
            let Some(spec) = &alert.indicator else { continue };
            let fragment = spec.cache_fragment();
            if map.contains_key(&fragment) {
                continue;
            }

            let key = indicator_key(ticker, self.interval, &fragment, None);
            if let Some(snapshot) = self.indicator_cache.get(key).await {
                map.insert(fragment, snapshot);
                continue;
            }

            if let Some(snapshot) = indicators::snapshot_for_alert(bars, alert) {
                self.indicator_cache
                    .set(key, snapshot.clone(), Some(ticker), self.indicator_ttl)
                    .await;
                map.insert(fragment, snapshot);
            }
        }
        Ok(map)
    }
}

/// Convenience entry point used by the watch command.
pub async fn run_watch<F: CandleFeed, C: CooldownStore>(
    worker: SyncWorker<F, C>,
    tickers: Vec<String>,
) {
    if tickers.is_empty() {
        error!("no symbols configured, nothing to watch");
        return;
    }
    worker.run(tickers).await;
}
