//! Pure rule evaluation for alert conditions.
//!
//! Every condition is a total function over the latest sample pair; no I/O
//! and no state. An evaluation returns zero, one, or two firings: band
//! conditions can legitimately cross both bands between two consecutive
//! samples (a data gap straddling the whole band), and each direction gets
//! its own firing.

use crate::models::{AlertCondition, IndicatorSnapshot, TriggerDirection};

/// One qualifying fire with the value that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Firing {
    pub direction: TriggerDirection,
    pub observed: f64,
}

/// Inputs for one evaluation: the latest price pair and, for indicator
/// conditions, the indicator snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalInput<'a> {
    pub current_price: f64,
    pub previous_price: Option<f64>,
    pub snapshot: Option<&'a IndicatorSnapshot>,
}

/// Per-direction arming for band conditions.
#[derive(Debug, Clone, Copy)]
pub struct EnabledDirections {
    pub upper: bool,
    pub lower: bool,
}

/// Evaluate `condition` against `input`, returning every qualifying firing.
pub fn evaluate(
    condition: AlertCondition,
    threshold: f64,
    enabled: EnabledDirections,
    input: EvalInput<'_>,
) -> Vec<Firing> {
    match condition {
        AlertCondition::Above => {
            let fired = match input.previous_price {
                // Crossing semantics when we know where we came from
                Some(prev) => input.current_price > threshold && prev <= threshold,
                // Current-only fallback for the first sample
                None => input.current_price > threshold,
            };
            fired
                .then_some(Firing {
                    direction: TriggerDirection::Upper,
                    observed: input.current_price,
                })
                .into_iter()
                .collect()
        }
        AlertCondition::Below => {
            let fired = match input.previous_price {
                Some(prev) => input.current_price < threshold && prev >= threshold,
                None => input.current_price < threshold,
            };
            fired
                .then_some(Firing {
                    direction: TriggerDirection::Lower,
                    observed: input.current_price,
                })
                .into_iter()
                .collect()
        }
        AlertCondition::CrossesUp => {
            // Strict straddle: previous < threshold <= current
            let fired = matches!(input.previous_price,
                Some(prev) if prev < threshold && input.current_price >= threshold);
            fired
                .then_some(Firing {
                    direction: TriggerDirection::Upper,
                    observed: input.current_price,
                })
                .into_iter()
                .collect()
        }
        AlertCondition::CrossesDown => {
            // Strict straddle: previous > threshold >= current
            let fired = matches!(input.previous_price,
                Some(prev) if prev > threshold && input.current_price <= threshold);
            fired
                .then_some(Firing {
                    direction: TriggerDirection::Lower,
                    observed: input.current_price,
                })
                .into_iter()
                .collect()
        }
        AlertCondition::IndicatorCrossesUpper => {
            let Some((value, prev)) = value_pair(input.snapshot) else {
                return Vec::new();
            };
            // Band value wins over the static threshold when present
            let band = input
                .snapshot
                .and_then(|s| s.upper_band)
                .unwrap_or(threshold);
            (prev < band && value >= band)
                .then_some(Firing {
                    direction: TriggerDirection::Upper,
                    observed: value,
                })
                .into_iter()
                .collect()
        }
        AlertCondition::IndicatorCrossesLower => {
            let Some((value, prev)) = value_pair(input.snapshot) else {
                return Vec::new();
            };
            let band = input
                .snapshot
                .and_then(|s| s.lower_band)
                .unwrap_or(threshold);
            (prev > band && value <= band)
                .then_some(Firing {
                    direction: TriggerDirection::Lower,
                    observed: value,
                })
                .into_iter()
                .collect()
        }
        AlertCondition::IndicatorTurnsPositive => {
            let Some((value, prev)) = value_pair(input.snapshot) else {
                return Vec::new();
            };
            (prev <= 0.0 && value > 0.0)
                .then_some(Firing {
                    direction: TriggerDirection::Upper,
                    observed: value,
                })
                .into_iter()
                .collect()
        }
        AlertCondition::IndicatorTurnsNegative => {
            let Some((value, prev)) = value_pair(input.snapshot) else {
                return Vec::new();
            };
            (prev >= 0.0 && value < 0.0)
                .then_some(Firing {
                    direction: TriggerDirection::Lower,
                    observed: value,
                })
                .into_iter()
                .collect()
        }
        AlertCondition::IndicatorSlopeBullish => slope_change(input.snapshot, true),
        AlertCondition::IndicatorSlopeBearish => slope_change(input.snapshot, false),
        AlertCondition::IndicatorSignalChange => {
            let Some(snapshot) = input.snapshot else {
                return Vec::new();
            };
            let (Some(signal), Some(prev_signal)) = (snapshot.signal, snapshot.prev_signal) else {
                return Vec::new();
            };
            if signal == prev_signal {
                return Vec::new();
            }
            let direction = if signal > prev_signal {
                TriggerDirection::Upper
            } else {
                TriggerDirection::Lower
            };
            vec![Firing {
                direction,
                observed: signal,
            }]
        }
        AlertCondition::BandExtremes => {
            // State check, not a crossing: value currently beyond a band
            let Some(snapshot) = input.snapshot else {
                return Vec::new();
            };
            let Some(value) = snapshot.value else {
                return Vec::new();
            };
            let mut firings = Vec::new();
            if enabled.upper {
                if let Some(upper) = snapshot.upper_band {
                    if value > upper {
                        firings.push(Firing {
                            direction: TriggerDirection::Upper,
                            observed: value,
                        });
                    }
                }
            }
            if enabled.lower {
                if let Some(lower) = snapshot.lower_band {
                    if value < lower {
                        firings.push(Firing {
                            direction: TriggerDirection::Lower,
                            observed: value,
                        });
                    }
                }
            }
            firings
        }
        AlertCondition::BandCross => {
            // Both bands can be crossed between consecutive samples; the
            // directions are evaluated independently, never assumed
            // mutually exclusive
            let Some(snapshot) = input.snapshot else {
                return Vec::new();
            };
            let Some((value, prev)) = value_pair(input.snapshot) else {
                return Vec::new();
            };
            let mut firings = Vec::new();
            if enabled.upper {
                if let Some(upper) = snapshot.upper_band {
                    if crossed(prev, value, upper) {
                        firings.push(Firing {
                            direction: TriggerDirection::Upper,
                            observed: value,
                        });
                    }
                }
            }
            if enabled.lower {
                if let Some(lower) = snapshot.lower_band {
                    if crossed(prev, value, lower) {
                        firings.push(Firing {
                            direction: TriggerDirection::Lower,
                            observed: value,
                        });
                    }
                }
            }
            firings
        }
    }
}

fn value_pair(snapshot: Option<&IndicatorSnapshot>) -> Option<(f64, f64)> {
    let snapshot = snapshot?;
    Some((snapshot.value?, snapshot.prev_value?))
}

/// A band was crossed in either direction between two samples.
fn crossed(prev: f64, current: f64, band: f64) -> bool {
    (prev < band && current >= band) || (prev > band && current <= band)
}

/// Slope sign change, preferring explicit slope fields and falling back to
/// the sign of `value - prev_value`.
fn slope_change(snapshot: Option<&IndicatorSnapshot>, bullish: bool) -> Vec<Firing> {
    let Some(snapshot) = snapshot else {
        return Vec::new();
    };

    let fired = match (snapshot.slope, snapshot.prev_slope) {
        (Some(slope), Some(prev_slope)) => {
            if bullish {
                prev_slope <= 0.0 && slope > 0.0
            } else {
                prev_slope >= 0.0 && slope < 0.0
            }
        }
        _ => match (snapshot.value, snapshot.prev_value) {
            (Some(value), Some(prev)) => {
                let delta = value - prev;
                if bullish {
                    delta > 0.0
                } else {
                    delta < 0.0
                }
            }
            _ => false,
        },
    };

    if !fired {
        return Vec::new();
    }
    let observed = snapshot.value.or(snapshot.slope).unwrap_or(0.0);
    vec![Firing {
        direction: if bullish {
            TriggerDirection::Upper
        } else {
            TriggerDirection::Lower
        },
        observed,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: EnabledDirections = EnabledDirections {
        upper: true,
        lower: true,
    };

    fn price(current: f64, previous: Option<f64>) -> EvalInput<'static> {
        EvalInput {
            current_price: current,
            previous_price: previous,
            snapshot: None,
        }
    }

    #[test]
    fn test_above_fires_on_cross_not_on_level() {
        let fired = evaluate(AlertCondition::Above, 150.0, BOTH, price(155.0, Some(145.0)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].direction, TriggerDirection::Upper);

        // Already above: previous did not come from at-or-below threshold
        let fired = evaluate(AlertCondition::Above, 150.0, BOTH, price(156.0, Some(155.0)));
        assert!(fired.is_empty());
    }

    #[test]
    fn test_above_falls_back_to_level_without_previous() {
        let fired = evaluate(AlertCondition::Above, 150.0, BOTH, price(155.0, None));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_crosses_up_truth_table() {
        assert_eq!(
            evaluate(AlertCondition::CrossesUp, 150.0, BOTH, price(155.0, Some(145.0))).len(),
            1
        );
        assert!(evaluate(AlertCondition::CrossesUp, 150.0, BOTH, price(145.0, Some(155.0))).is_empty());
        // Inclusive at the boundary
        assert_eq!(
            evaluate(AlertCondition::CrossesUp, 150.0, BOTH, price(150.0, Some(145.0))).len(),
            1
        );
        // No previous sample: crossing is undefined
        assert!(evaluate(AlertCondition::CrossesUp, 150.0, BOTH, price(155.0, None)).is_empty());
    }

    #[test]
    fn test_crosses_down_truth_table() {
        assert_eq!(
            evaluate(AlertCondition::CrossesDown, 150.0, BOTH, price(145.0, Some(155.0))).len(),
            1
        );
        assert!(
            evaluate(AlertCondition::CrossesDown, 150.0, BOTH, price(155.0, Some(145.0))).is_empty()
        );
        assert_eq!(
            evaluate(AlertCondition::CrossesDown, 150.0, BOTH, price(150.0, Some(155.0))).len(),
            1
        );
    }

    fn snapshot_input(snapshot: &IndicatorSnapshot) -> EvalInput<'_> {
        EvalInput {
            current_price: 0.0,
            previous_price: None,
            snapshot: Some(snapshot),
        }
    }

    #[test]
    fn test_band_cross_gap_fires_both_directions() {
        // 80 -> 20 gaps across both bands at 70 and 30
        let snapshot = IndicatorSnapshot {
            value: Some(20.0),
            prev_value: Some(80.0),
            upper_band: Some(70.0),
            lower_band: Some(30.0),
            ..Default::default()
        };
        let fired = evaluate(AlertCondition::BandCross, 0.0, BOTH, snapshot_input(&snapshot));
        assert_eq!(fired.len(), 2);
        assert!(fired.iter().any(|f| f.direction == TriggerDirection::Upper));
        assert!(fired.iter().any(|f| f.direction == TriggerDirection::Lower));
    }

    #[test]
    fn test_band_cross_respects_enabled_directions() {
        let snapshot = IndicatorSnapshot {
            value: Some(20.0),
            prev_value: Some(80.0),
            upper_band: Some(70.0),
            lower_band: Some(30.0),
            ..Default::default()
        };
        let upper_only = EnabledDirections {
            upper: true,
            lower: false,
        };
        let fired = evaluate(AlertCondition::BandCross, 0.0, upper_only, snapshot_input(&snapshot));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].direction, TriggerDirection::Upper);
    }

    #[test]
    fn test_band_extremes_is_a_state_check() {
        let snapshot = IndicatorSnapshot {
            value: Some(85.0),
            prev_value: Some(84.0),
            upper_band: Some(70.0),
            lower_band: Some(30.0),
            ..Default::default()
        };
        // No crossing happened, but the value sits beyond the upper band
        let fired = evaluate(AlertCondition::BandExtremes, 0.0, BOTH, snapshot_input(&snapshot));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].direction, TriggerDirection::Upper);
    }

    #[test]
    fn test_turns_positive_requires_sign_change() {
        let crossing = IndicatorSnapshot {
            value: Some(0.4),
            prev_value: Some(-0.2),
            ..Default::default()
        };
        assert_eq!(
            evaluate(AlertCondition::IndicatorTurnsPositive, 0.0, BOTH, snapshot_input(&crossing)).len(),
            1
        );

        let already_positive = IndicatorSnapshot {
            value: Some(0.4),
            prev_value: Some(0.2),
            ..Default::default()
        };
        assert!(evaluate(
            AlertCondition::IndicatorTurnsPositive,
            0.0,
            BOTH,
            snapshot_input(&already_positive)
        )
        .is_empty());
    }

    #[test]
    fn test_slope_prefers_explicit_fields() {
        let snapshot = IndicatorSnapshot {
            value: Some(10.0),
            prev_value: Some(11.0), // fallback would say bearish
            slope: Some(0.5),
            prev_slope: Some(-0.5),
            ..Default::default()
        };
        let fired = evaluate(
            AlertCondition::IndicatorSlopeBullish,
            0.0,
            BOTH,
            snapshot_input(&snapshot),
        );
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_signal_change_fires_on_any_change() {
        let snapshot = IndicatorSnapshot {
            signal: Some(1.0),
            prev_signal: Some(-1.0),
            ..Default::default()
        };
        assert_eq!(
            evaluate(AlertCondition::IndicatorSignalChange, 0.0, BOTH, snapshot_input(&snapshot)).len(),
            1
        );

        let unchanged = IndicatorSnapshot {
            signal: Some(1.0),
            prev_signal: Some(1.0),
            ..Default::default()
        };
        assert!(evaluate(
            AlertCondition::IndicatorSignalChange,
            0.0,
            BOTH,
            snapshot_input(&unchanged)
        )
        .is_empty());
    }

    #[test]
    fn test_indicator_crossing_uses_band_over_threshold() {
        let snapshot = IndicatorSnapshot {
            value: Some(75.0),
            prev_value: Some(65.0),
            upper_band: Some(70.0),
            ..Default::default()
        };
        // Threshold of 90 would not fire; the band at 70 does
        let fired = evaluate(
            AlertCondition::IndicatorCrossesUpper,
            90.0,
            BOTH,
            snapshot_input(&snapshot),
        );
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_missing_snapshot_never_fires() {
        for condition in [
            AlertCondition::IndicatorCrossesUpper,
            AlertCondition::IndicatorCrossesLower,
            AlertCondition::IndicatorTurnsPositive,
            AlertCondition::IndicatorTurnsNegative,
            AlertCondition::IndicatorSlopeBullish,
            AlertCondition::IndicatorSlopeBearish,
            AlertCondition::IndicatorSignalChange,
            AlertCondition::BandExtremes,
            AlertCondition::BandCross,
        ] {
            assert!(evaluate(condition, 0.0, BOTH, price(100.0, Some(99.0))).is_empty());
        }
    }
}
