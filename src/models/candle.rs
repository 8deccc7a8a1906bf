use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Interval;

/// One OHLCV bar for a symbol at a fixed interval.
///
/// Unique per `(symbol_id, time, interval)`; consumers discard rows whose
/// OHLC values are not all finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol_id: i64,

    /// Bar timestamp, UTC, aligned to the interval grid
    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,

    pub interval: Interval,

    /// Opening price
    pub open: f64,

    /// Highest price
    pub high: f64,

    /// Lowest price
    pub low: f64,

    /// Closing price
    pub close: f64,

    /// Trading volume
    pub volume: u64,
}

impl Candle {
    pub fn new(
        symbol_id: i64,
        time: DateTime<Utc>,
        interval: Interval,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Self {
        Self {
            symbol_id,
            time,
            interval,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A candle is usable only when every OHLC value is finite.
    pub fn is_valid(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
    }
}

/// Boundary filter for computed numeric series: NaN and infinities become
/// `None` so downstream storage and JSON never see unrepresentable values.
pub fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle::new(1, Utc::now(), Interval::Day1, 10.0, 11.0, 9.0, close, 1000)
    }

    #[test]
    fn test_finite_filters_nan_and_infinity() {
        assert_eq!(finite(1.5), Some(1.5));
        assert_eq!(finite(f64::NAN), None);
        assert_eq!(finite(f64::INFINITY), None);
        assert_eq!(finite(f64::NEG_INFINITY), None);
    }

    #[test]
    fn test_candle_validity() {
        assert!(candle(10.5).is_valid());
        assert!(!candle(f64::NAN).is_valid());
        assert!(!candle(f64::INFINITY).is_valid());
    }
}
