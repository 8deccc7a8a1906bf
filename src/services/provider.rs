//! Upstream market-data client.
//!
//! Fetching a wide time range is split into interval-appropriate chunk
//! windows processed sequentially under a global rate limiter. Each window
//! is retried with randomized exponential backoff; windows that exhaust
//! their retries are bisected and re-queued with a smaller retry budget
//! until they either succeed or shrink below a one-hour floor, at which
//! point the slice is abandoned. A partial chart beats a failed chart load,
//! so `fetch` never errors for partial failure.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::constants::{
    PROVIDER_HTTP_TIMEOUT_SECS, PROVIDER_MAX_RETRIES, PROVIDER_MAX_SPLIT_DEPTH,
    PROVIDER_MIN_SPLIT_WINDOW_SECS, PROVIDER_SPLIT_RETRIES,
};
use crate::models::{Candle, Interval};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited by upstream")]
    RateLimit,

    #[error("No data available")]
    NoData,
}

/// Shared rate limiter for provider requests across all concurrent tasks.
///
/// Sliding window: timestamps of recent requests are retained for one
/// second and a caller at the limit sleeps until the oldest expires.
#[derive(Debug)]
pub struct SharedRateLimiter {
    request_timestamps: TokioMutex<Vec<SystemTime>>,
    rate_limit_per_second: u32,
}

impl SharedRateLimiter {
    pub fn new(rate_limit_per_second: u32) -> Self {
        Self {
            request_timestamps: TokioMutex::new(Vec::new()),
            rate_limit_per_second: rate_limit_per_second.max(1),
        }
    }

    /// Async-safe; callable from multiple concurrent tasks.
    pub async fn enforce(&self) {
        let window = StdDuration::from_secs(1);
        let current_time = SystemTime::now();
        let mut timestamps = self.request_timestamps.lock().await;

        timestamps.retain(|&timestamp| {
            current_time
                .duration_since(timestamp)
                .unwrap_or(StdDuration::ZERO)
                < window
        });

        if timestamps.len() >= self.rate_limit_per_second as usize {
            if let Some(&oldest) = timestamps.first() {
                let elapsed = current_time
                    .duration_since(oldest)
                    .unwrap_or(StdDuration::ZERO);
                let wait_time = window.saturating_sub(elapsed);
                if !wait_time.is_zero() {
                    // Drop lock before sleeping so other tasks can check
                    drop(timestamps);
                    sleep(wait_time + StdDuration::from_millis(20)).await;
                    let mut timestamps = self.request_timestamps.lock().await;
                    timestamps.push(SystemTime::now());
                    return;
                }
            }
        }
        timestamps.push(current_time);
    }
}

/// One raw window fetch against the upstream. The seam the chunking and
/// retry machinery is tested through.
pub trait CandleFeed: Send + Sync {
    fn fetch_window(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Candle>, ProviderError>> + Send;
}

/// HTTP implementation of [`CandleFeed`] against a columnar history
/// endpoint: parallel `t`/`o`/`h`/`l`/`c`/`v` arrays in one JSON object.
#[derive(Clone)]
pub struct HttpCandleFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCandleFeed {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(PROVIDER_HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn parse_columnar(data: &Value, interval: Interval) -> Result<Vec<Candle>, ProviderError> {
        let required_keys = ["t", "o", "h", "l", "c", "v"];
        for key in &required_keys {
            if data.get(key).is_none() {
                return Err(ProviderError::InvalidResponse(format!(
                    "missing key: {}",
                    key
                )));
            }
        }

        let times = data["t"]
            .as_array()
            .ok_or_else(|| ProviderError::InvalidResponse("invalid times".to_string()))?;
        let opens = data["o"]
            .as_array()
            .ok_or_else(|| ProviderError::InvalidResponse("invalid opens".to_string()))?;
        let highs = data["h"]
            .as_array()
            .ok_or_else(|| ProviderError::InvalidResponse("invalid highs".to_string()))?;
        let lows = data["l"]
            .as_array()
            .ok_or_else(|| ProviderError::InvalidResponse("invalid lows".to_string()))?;
        let closes = data["c"]
            .as_array()
            .ok_or_else(|| ProviderError::InvalidResponse("invalid closes".to_string()))?;
        let volumes = data["v"]
            .as_array()
            .ok_or_else(|| ProviderError::InvalidResponse("invalid volumes".to_string()))?;

        let length = times.len();
        if [opens.len(), highs.len(), lows.len(), closes.len(), volumes.len()]
            .iter()
            .any(|&len| len != length)
        {
            return Err(ProviderError::InvalidResponse(
                "inconsistent array lengths".to_string(),
            ));
        }

        let mut result = Vec::with_capacity(length);
        for i in 0..length {
            // Some endpoints send timestamps as strings, some as integers
            let timestamp = if let Some(ts_str) = times[i].as_str() {
                ts_str.parse::<i64>().map_err(|_| {
                    ProviderError::InvalidResponse(format!(
                        "cannot parse timestamp '{}' at index {}",
                        ts_str, i
                    ))
                })?
            } else if let Some(ts_int) = times[i].as_i64() {
                ts_int
            } else {
                return Err(ProviderError::InvalidResponse(format!(
                    "invalid timestamp at index {}",
                    i
                )));
            };

            let time = DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
                ProviderError::InvalidResponse(format!("timestamp {} out of range", timestamp))
            })?;

            result.push(Candle {
                symbol_id: 0,
                time,
                interval,
                open: opens[i].as_f64().unwrap_or(f64::NAN),
                high: highs[i].as_f64().unwrap_or(f64::NAN),
                low: lows[i].as_f64().unwrap_or(f64::NAN),
                close: closes[i].as_f64().unwrap_or(f64::NAN),
                volume: volumes[i].as_u64().unwrap_or(0),
            });
        }
        Ok(result)
    }
}

impl CandleFeed for HttpCandleFeed {
    async fn fetch_window(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ProviderError> {
        let url = format!("{}/history", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("resolution", interval.as_str()),
                ("from", &start.timestamp().to_string()),
                ("to", &end.timestamp().to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimit);
        }
        if !status.is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {} from provider",
                status.as_u16()
            )));
        }

        let body: Value = response.json().await?;
        if body.get("s").and_then(|s| s.as_str()) == Some("no_data") {
            return Ok(Vec::new());
        }
        Self::parse_columnar(&body, interval)
    }
}

/// A fetch window on the work queue, carrying its bisection depth.
#[derive(Debug, Clone, Copy)]
struct FetchWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    depth: u32,
}

/// Chunking, retry, and bisection on top of a [`CandleFeed`].
pub struct ProviderClient<F: CandleFeed> {
    feed: F,
    limiter: Arc<SharedRateLimiter>,
    max_retries: u32,
    split_retries: u32,
}

impl<F: CandleFeed> ProviderClient<F> {
    pub fn new(feed: F, limiter: Arc<SharedRateLimiter>) -> Self {
        Self {
            feed,
            limiter,
            max_retries: PROVIDER_MAX_RETRIES,
            split_retries: PROVIDER_SPLIT_RETRIES,
        }
    }

    #[cfg(test)]
    fn with_retries(feed: F, limiter: Arc<SharedRateLimiter>, max: u32, split: u32) -> Self {
        Self {
            feed,
            limiter,
            max_retries: max,
            split_retries: split,
        }
    }

    /// Fetch `[start, end)` for one symbol: ordered ascending, unique by
    /// timestamp, interval-aligned. Slices that cannot be fetched are
    /// omitted rather than failing the whole call.
    pub async fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Candle> {
        let floor = Utc::now() - interval.max_lookback();
        let start = if start < floor {
            debug!(
                symbol,
                interval = %interval,
                requested = %start,
                clamped = %floor,
                "clamping start to lookback ceiling"
            );
            floor
        } else {
            start
        };
        if start >= end {
            return Vec::new();
        }

        let mut queue: VecDeque<FetchWindow> = self
            .chunk_windows(interval, start, end)
            .into_iter()
            .collect();
        let mut collected: BTreeMap<i64, Candle> = BTreeMap::new();
        let mut abandoned = 0usize;

        while let Some(window) = queue.pop_front() {
            let budget = if window.depth == 0 {
                self.max_retries
            } else {
                self.split_retries
            };

            match self
                .fetch_window_with_retry(symbol, interval, window, budget)
                .await
            {
                Ok(bars) => {
                    for mut bar in bars {
                        if !bar.is_valid() {
                            continue;
                        }
                        if bar.time < window.start || bar.time >= window.end {
                            continue;
                        }
                        // Snap daily/weekly bars onto the canonical grid and
                        // deduplicate on the aligned timestamp
                        bar.time = interval.align(bar.time);
                        collected.insert(bar.time.timestamp(), bar);
                    }
                }
                Err(e) => {
                    let span_secs = (window.end - window.start).num_seconds();
                    if span_secs > PROVIDER_MIN_SPLIT_WINDOW_SECS
                        && window.depth < PROVIDER_MAX_SPLIT_DEPTH
                    {
                        let mid = window.start + ChronoDuration::seconds(span_secs / 2);
                        debug!(
                            symbol,
                            start = %window.start,
                            end = %window.end,
                            depth = window.depth,
                            error = %e,
                            "window failed, bisecting"
                        );
                        queue.push_back(FetchWindow {
                            start: window.start,
                            end: mid,
                            depth: window.depth + 1,
                        });
                        queue.push_back(FetchWindow {
                            start: mid,
                            end: window.end,
                            depth: window.depth + 1,
                        });
                    } else {
                        abandoned += 1;
                        warn!(
                            symbol,
                            start = %window.start,
                            end = %window.end,
                            error = %e,
                            "abandoning unfetchable slice"
                        );
                    }
                }
            }
        }

        if abandoned > 0 {
            warn!(
                symbol,
                interval = %interval,
                abandoned_slices = abandoned,
                "fetch completed with gaps"
            );
        }
        collected.into_values().collect()
    }

    async fn fetch_window_with_retry(
        &self,
        symbol: &str,
        interval: Interval,
        window: FetchWindow,
        max_retries: u32,
    ) -> Result<Vec<Candle>, ProviderError> {
        let mut last_error = ProviderError::NoData;
        for attempt in 0..max_retries {
            if attempt > 0 {
                let delay = StdDuration::from_secs_f64(
                    2.0_f64.powi(attempt as i32 - 1) + rand::random::<f64>(),
                );
                let delay = delay.min(StdDuration::from_secs(60));
                debug!(
                    symbol,
                    attempt = attempt + 1,
                    max_retries,
                    error = %last_error,
                    wait_secs = delay.as_secs_f64(),
                    "provider retry backoff"
                );
                sleep(delay).await;
            }

            self.limiter.enforce().await;

            match self
                .feed
                .fetch_window(symbol, interval, window.start, window.end)
                .await
            {
                Ok(bars) => return Ok(bars),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn chunk_windows(
        &self,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<FetchWindow> {
        let chunk = interval.chunk_window();
        let mut windows = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let chunk_end = (cursor + chunk).min(end);
            windows.push(FetchWindow {
                start: cursor,
                end: chunk_end,
                depth: 0,
            });
            cursor = chunk_end;
        }
        windows
    }
}
