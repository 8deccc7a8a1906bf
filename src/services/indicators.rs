//! Indicator snapshot computation.
//!
//! The alert engine only consumes the snapshot contract (value, previous
//! value, optional bands); the math here is the minimal set needed to
//! produce those snapshots from stored bars. Every output passes through
//! the finite-number boundary, so a short or degenerate series yields
//! `None` fields instead of NaN.

use crate::models::{finite, Alert, Candle, IndicatorSnapshot};

/// Simple moving average series; positions before `period` fill are `None`.
pub fn sma(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut values = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return values;
    }
    for i in (period - 1)..closes.len() {
        let window = &closes[i + 1 - period..=i];
        let sum: f64 = window.iter().sum();
        values[i] = finite(sum / period as f64);
    }
    values
}

/// Percentage distance of close from its moving average.
pub fn ma_score(close: f64, ma: f64) -> Option<f64> {
    if ma == 0.0 {
        return Some(0.0);
    }
    finite(((close - ma) / ma) * 100.0)
}

/// Rolling standard deviation matching the `sma` alignment.
fn rolling_stddev(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut values = vec![None; closes.len()];
    if period < 2 || closes.len() < period {
        return values;
    }
    for i in (period - 1)..closes.len() {
        let window = &closes[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        values[i] = finite(variance.sqrt());
    }
    values
}

fn param(alert: &Alert, key: &str, default: f64) -> f64 {
    alert
        .indicator
        .as_ref()
        .and_then(|spec| {
            spec.params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
        })
        .unwrap_or(default)
}

/// Build the snapshot an indicator-based alert evaluates against.
///
/// Returns `None` when the series is too short for the configured period;
/// the engine treats that as "condition cannot fire", not as an error.
pub fn snapshot_for_alert(bars: &[Candle], alert: &Alert) -> Option<IndicatorSnapshot> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let period = param(alert, "period", 20.0).max(1.0) as usize;
    if closes.len() < period + 1 {
        return None;
    }

    let ma = sma(&closes, period);
    let value = *ma.last()?;
    let prev_value = ma[ma.len() - 2];
    let (value, prev_value) = (value?, prev_value?);

    let is_score = alert
        .indicator
        .as_ref()
        .map(|spec| spec.name == "ma_score")
        .unwrap_or(false);
    if is_score {
        // Score space: percentage distance of close from its moving
        // average. A sign change is price crossing the average, so the
        // turns_positive/negative conditions apply directly. No bands.
        let score = ma_score(*closes.last()?, value)?;
        let prev_score = ma_score(closes[closes.len() - 2], prev_value)?;
        return Some(IndicatorSnapshot {
            value: Some(score),
            prev_value: Some(prev_score),
            slope: finite(score - prev_score),
            ..Default::default()
        });
    }

    let width = param(alert, "width", 2.0);
    let stddev = rolling_stddev(&closes, period);
    let dev = stddev.last().copied().flatten();
    let upper_band = dev.and_then(|d| finite(value + width * d));
    let lower_band = dev.and_then(|d| finite(value - width * d));

    let slope = finite(value - prev_value);
    let prev_slope = if ma.len() >= 3 {
        match (prev_value, ma[ma.len() - 3]) {
            (prev, Some(prev_prev)) => finite(prev - prev_prev),
            _ => None,
        }
    } else {
        None
    };

    Some(IndicatorSnapshot {
        value: Some(value),
        prev_value: Some(prev_value),
        upper_band,
        lower_band,
        slope,
        prev_slope,
        signal: None,
        prev_signal: None,
    })
}
