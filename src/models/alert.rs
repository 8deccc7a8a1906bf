use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Closed vocabulary of alert conditions.
///
/// Adding a condition is a compile-time-checked change: every consumer
/// matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    Above,
    Below,
    CrossesUp,
    CrossesDown,
    IndicatorCrossesUpper,
    IndicatorCrossesLower,
    IndicatorTurnsPositive,
    IndicatorTurnsNegative,
    IndicatorSlopeBullish,
    IndicatorSlopeBearish,
    IndicatorSignalChange,
    BandExtremes,
    BandCross,
}

impl AlertCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCondition::Above => "above",
            AlertCondition::Below => "below",
            AlertCondition::CrossesUp => "crosses_up",
            AlertCondition::CrossesDown => "crosses_down",
            AlertCondition::IndicatorCrossesUpper => "indicator_crosses_upper",
            AlertCondition::IndicatorCrossesLower => "indicator_crosses_lower",
            AlertCondition::IndicatorTurnsPositive => "indicator_turns_positive",
            AlertCondition::IndicatorTurnsNegative => "indicator_turns_negative",
            AlertCondition::IndicatorSlopeBullish => "indicator_slope_bullish",
            AlertCondition::IndicatorSlopeBearish => "indicator_slope_bearish",
            AlertCondition::IndicatorSignalChange => "indicator_signal_change",
            AlertCondition::BandExtremes => "band_extremes",
            AlertCondition::BandCross => "band_cross",
        }
    }

    /// Whether this condition reads indicator snapshots instead of raw price.
    pub fn is_indicator(&self) -> bool {
        !matches!(
            self,
            AlertCondition::Above
                | AlertCondition::Below
                | AlertCondition::CrossesUp
                | AlertCondition::CrossesDown
        )
    }
}

impl fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AlertCondition {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "above" => Ok(AlertCondition::Above),
            "below" => Ok(AlertCondition::Below),
            "crosses_up" => Ok(AlertCondition::CrossesUp),
            "crosses_down" => Ok(AlertCondition::CrossesDown),
            "indicator_crosses_upper" => Ok(AlertCondition::IndicatorCrossesUpper),
            "indicator_crosses_lower" => Ok(AlertCondition::IndicatorCrossesLower),
            "indicator_turns_positive" => Ok(AlertCondition::IndicatorTurnsPositive),
            "indicator_turns_negative" => Ok(AlertCondition::IndicatorTurnsNegative),
            "indicator_slope_bullish" => Ok(AlertCondition::IndicatorSlopeBullish),
            "indicator_slope_bearish" => Ok(AlertCondition::IndicatorSlopeBearish),
            "indicator_signal_change" => Ok(AlertCondition::IndicatorSignalChange),
            "band_extremes" => Ok(AlertCondition::BandExtremes),
            "band_cross" => Ok(AlertCondition::BandCross),
            other => Err(AppError::InvalidInput(format!(
                "invalid alert condition: {}",
                other
            ))),
        }
    }
}

/// How often an alert may fire.
///
/// `Once` is a one-shot transition to a disabled terminal state; the bar
/// modes re-arm automatically whenever the bar timestamp advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Once,
    OncePerBar,
    OncePerBarClose,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Once => "once",
            TriggerMode::OncePerBar => "once_per_bar",
            TriggerMode::OncePerBarClose => "once_per_bar_close",
        }
    }
}

impl FromStr for TriggerMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(TriggerMode::Once),
            "once_per_bar" => Ok(TriggerMode::OncePerBar),
            "once_per_bar_close" => Ok(TriggerMode::OncePerBarClose),
            other => Err(AppError::InvalidInput(format!(
                "invalid trigger mode: {}",
                other
            ))),
        }
    }
}

/// Direction of a fired trigger. Band conditions can fire both directions
/// in one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    Upper,
    Lower,
}

impl TriggerDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerDirection::Upper => "upper",
            TriggerDirection::Lower => "lower",
        }
    }
}

/// Which indicator feeds an indicator-based alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    /// Indicator name, e.g. "sma", "rsi"
    pub name: String,
    /// Optional output field for multi-output indicators
    pub field: Option<String>,
    /// Parameters, e.g. [("period", 20.0)]
    pub params: Vec<(String, f64)>,
}

impl IndicatorSpec {
    /// Cache key fragment: name plus params sorted by key so equivalent
    /// specs hash identically.
    pub fn cache_fragment(&self) -> String {
        let mut params = self.params.clone();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let parts: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!(
            "{}:{}:{}",
            self.name,
            self.field.as_deref().unwrap_or(""),
            parts.join(",")
        )
    }
}

/// A configured alert rule.
///
/// Created by user action; the engine mutates trigger bookkeeping fields
/// (`last_triggered_at`, `last_triggered_bar`, `is_active` for one-shot
/// mode) and never deletes rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub symbol_id: i64,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub indicator: Option<IndicatorSpec>,
    pub trigger_mode: TriggerMode,
    pub cooldown_minutes: i64,
    /// Whether the upper direction is armed (band conditions)
    pub upper_enabled: bool,
    /// Whether the lower direction is armed (band conditions)
    pub lower_enabled: bool,
    pub message_upper: Option<String>,
    pub message_lower: Option<String>,
    pub is_active: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_triggered_bar: Option<DateTime<Utc>>,
}

impl Alert {
    /// Message for a fired direction, falling back to a generated default.
    pub fn message_for(&self, direction: TriggerDirection) -> String {
        let configured = match direction {
            TriggerDirection::Upper => self.message_upper.as_ref(),
            TriggerDirection::Lower => self.message_lower.as_ref(),
        };
        configured.cloned().unwrap_or_else(|| {
            format!(
                "alert {} fired: {} ({})",
                self.id,
                self.condition,
                direction.as_str()
            )
        })
    }
}

/// One fired trigger. Append-only; created exclusively by the alert engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTrigger {
    pub alert_id: i64,
    pub triggered_at: DateTime<Utc>,
    pub observed_price: Option<f64>,
    pub indicator_value: Option<f64>,
    pub direction: TriggerDirection,
    pub message: String,
}

/// Snapshot of an indicator's latest state, produced by the indicator
/// collaborator from stored bars.
///
/// All fields pass through the finite-number boundary: a `None` means the
/// value was unavailable or not representable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub value: Option<f64>,
    pub prev_value: Option<f64>,
    pub upper_band: Option<f64>,
    pub lower_band: Option<f64>,
    pub slope: Option<f64>,
    pub prev_slope: Option<f64>,
    pub signal: Option<f64>,
    pub prev_signal: Option<f64>,
}
