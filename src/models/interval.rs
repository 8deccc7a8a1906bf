use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{
    BAR_TTL_DAILY_SECONDS, BAR_TTL_HOURLY_SECONDS, BAR_TTL_INTRADAY_SECONDS,
    BAR_TTL_WEEKLY_SECONDS,
};
use crate::error::AppError;

/// Bar interval for market data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// 1-minute candles
    Minute1,
    /// 5-minute candles
    Minute5,
    /// 15-minute candles
    Minute15,
    /// 30-minute candles
    Minute30,
    /// 1-hour candles
    Hour1,
    /// Daily candles
    Day1,
    /// Weekly candles
    Week1,
    /// Monthly candles
    Month1,
}

impl Interval {
    /// Convert to interval string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Hour1 => "1H",
            Interval::Day1 => "1D",
            Interval::Week1 => "1W",
            Interval::Month1 => "1M",
        }
    }

    /// Nominal bar duration in seconds.
    ///
    /// Monthly bars use 30 days; exact month lengths do not matter for
    /// coverage estimation, which is deliberately calendar-naive.
    pub fn duration_secs(&self) -> i64 {
        match self {
            Interval::Minute1 => 60,
            Interval::Minute5 => 5 * 60,
            Interval::Minute15 => 15 * 60,
            Interval::Minute30 => 30 * 60,
            Interval::Hour1 => 3_600,
            Interval::Day1 => 86_400,
            Interval::Week1 => 7 * 86_400,
            Interval::Month1 => 30 * 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs())
    }

    pub fn is_intraday(&self) -> bool {
        matches!(
            self,
            Interval::Minute1
                | Interval::Minute5
                | Interval::Minute15
                | Interval::Minute30
                | Interval::Hour1
        )
    }

    /// Maximum time span requested from the provider in a single chunk.
    ///
    /// Upstream endpoints reject very wide windows for fine intervals, so
    /// minute data is capped at roughly a week per request and daily data
    /// at roughly five years.
    pub fn chunk_window(&self) -> Duration {
        match self {
            Interval::Minute1 | Interval::Minute5 | Interval::Minute15 | Interval::Minute30 => {
                Duration::days(7)
            }
            Interval::Hour1 => Duration::days(60),
            Interval::Day1 | Interval::Week1 | Interval::Month1 => Duration::days(5 * 365),
        }
    }

    /// Hard lookback ceiling. Requests further back than this are clamped
    /// rather than failed.
    pub fn max_lookback(&self) -> Duration {
        match self {
            Interval::Minute1 | Interval::Minute5 | Interval::Minute15 | Interval::Minute30 => {
                Duration::days(30)
            }
            Interval::Hour1 => Duration::days(730),
            Interval::Day1 | Interval::Week1 | Interval::Month1 => Duration::days(20 * 365),
        }
    }

    /// TTL for cached bar lists of this interval. Intraday data goes stale
    /// quickly; daily and coarser data can be cached much longer.
    pub fn bar_cache_ttl_secs(&self) -> u64 {
        match self {
            Interval::Minute1 | Interval::Minute5 | Interval::Minute15 | Interval::Minute30 => {
                BAR_TTL_INTRADAY_SECONDS
            }
            Interval::Hour1 => BAR_TTL_HOURLY_SECONDS,
            Interval::Day1 => BAR_TTL_DAILY_SECONDS,
            Interval::Week1 | Interval::Month1 => BAR_TTL_WEEKLY_SECONDS,
        }
    }

    /// Snap a timestamp to the canonical bar boundary for this interval.
    ///
    /// Intraday bars floor to the interval grid, daily bars to midnight
    /// UTC, weekly bars to Monday midnight, monthly bars to the first of
    /// the month.
    pub fn align(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Interval::Minute1
            | Interval::Minute5
            | Interval::Minute15
            | Interval::Minute30
            | Interval::Hour1 => {
                let secs = self.duration_secs();
                let ts = t.timestamp() - t.timestamp().rem_euclid(secs);
                DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or(t)
            }
            Interval::Day1 => t.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
            Interval::Week1 => {
                let days = t.weekday().num_days_from_monday() as i64;
                (t.date_naive() - Duration::days(days))
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
            }
            Interval::Month1 => t
                .date_naive()
                .with_day(1)
                .unwrap_or(t.date_naive())
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc(),
        }
    }

    /// Get all available intervals
    pub fn all() -> Vec<Interval> {
        vec![
            Interval::Minute1,
            Interval::Minute5,
            Interval::Minute15,
            Interval::Minute30,
            Interval::Hour1,
            Interval::Day1,
            Interval::Week1,
            Interval::Month1,
        ]
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Interval {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::Minute1),
            "5m" => Ok(Interval::Minute5),
            "15m" => Ok(Interval::Minute15),
            "30m" => Ok(Interval::Minute30),
            "1H" | "1h" => Ok(Interval::Hour1),
            "1D" | "1d" => Ok(Interval::Day1),
            "1W" | "1w" => Ok(Interval::Week1),
            "1M" => Ok(Interval::Month1),
            other => Err(AppError::InvalidInput(format!("invalid interval: {}", other))),
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::Day1
    }
}
