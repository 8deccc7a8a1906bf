//! Alert evaluation engine.
//!
//! One call evaluates every active alert for a symbol against the latest
//! price/indicator sample. Gating (trigger mode, then cooldown) runs before
//! rule evaluation so disarmed alerts cost nothing and duplicate side
//! effects cannot happen. A single alert's failure is isolated: it is
//! logged and the pass continues.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

use crate::constants::{ALERT_BATCH_THRESHOLD, ALERT_PASS_BUDGET_MS, MIN_COOLDOWN_SECONDS};
use crate::error::Result;
use crate::models::{Alert, AlertTrigger, IndicatorSnapshot, TriggerMode};
use crate::services::conditions::{self, EnabledDirections, EvalInput, Firing};
use crate::services::store::MarketStore;

/// Injected duplicate-fire suppression state.
///
/// The in-memory implementation is correct for a single engine instance
/// only; running multiple instances requires an implementation backed by a
/// shared TTL store.
pub trait CooldownStore: Send + Sync {
    fn last_trigger(&self, alert_id: i64) -> Option<DateTime<Utc>>;
    fn record_trigger(&self, alert_id: i64, at: DateTime<Utc>);
}

/// Single-process cooldown map. Cleared only by process restart.
#[derive(Debug, Default)]
pub struct InMemoryCooldowns {
    map: RwLock<HashMap<i64, DateTime<Utc>>>,
}

impl InMemoryCooldowns {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CooldownStore for InMemoryCooldowns {
    fn last_trigger(&self, alert_id: i64) -> Option<DateTime<Utc>> {
        self.map.read().ok()?.get(&alert_id).copied()
    }

    fn record_trigger(&self, alert_id: i64, at: DateTime<Utc>) {
        if let Ok(mut map) = self.map.write() {
            map.insert(alert_id, at);
        }
    }
}

/// Latest sample for one symbol, as supplied by pollers or chart requests.
#[derive(Debug, Clone, Default)]
pub struct PriceUpdate {
    pub current_price: f64,
    pub previous_price: Option<f64>,
    /// Fallback snapshot when an alert's indicator has no map entry
    pub indicator_data: Option<IndicatorSnapshot>,
    /// Snapshots keyed by indicator cache fragment
    pub indicator_data_map: Option<HashMap<String, IndicatorSnapshot>>,
    /// Timestamp of the bar this sample belongs to
    pub bar_timestamp: Option<DateTime<Utc>>,
}

pub struct AlertEngine<C: CooldownStore> {
    store: Arc<MarketStore>,
    cooldowns: C,
    batch_threshold: usize,
    pass_budget_ms: u64,
    min_cooldown_secs: i64,
}

impl<C: CooldownStore> AlertEngine<C> {
    pub fn new(store: Arc<MarketStore>, cooldowns: C) -> Self {
        Self {
            store,
            cooldowns,
            batch_threshold: ALERT_BATCH_THRESHOLD,
            pass_budget_ms: ALERT_PASS_BUDGET_MS,
            min_cooldown_secs: MIN_COOLDOWN_SECONDS,
        }
    }

    #[cfg(test)]
    pub fn with_limits(
        store: Arc<MarketStore>,
        cooldowns: C,
        batch_threshold: usize,
        min_cooldown_secs: i64,
    ) -> Self {
        Self {
            store,
            cooldowns,
            batch_threshold,
            pass_budget_ms: ALERT_PASS_BUDGET_MS,
            min_cooldown_secs,
        }
    }

    /// Evaluate all active alerts for a symbol against one price update.
    /// Returns the triggers that fired and were durably persisted.
    pub async fn evaluate_symbol_alerts(
        &self,
        symbol_id: i64,
        update: &PriceUpdate,
    ) -> Result<Vec<AlertTrigger>> {
        let pass_start = Instant::now();
        let alerts = self.store.load_active_alerts(symbol_id).await?;
        if alerts.is_empty() {
            return Ok(Vec::new());
        }

        let triggered = if alerts.len() >= self.batch_threshold {
            self.evaluate_batch(&alerts, update).await?
        } else {
            self.evaluate_full(&alerts, update).await?
        };

        let elapsed_ms = pass_start.elapsed().as_millis() as u64;
        if elapsed_ms > self.pass_budget_ms {
            // Observability signal only, never a failure
            warn!(
                symbol_id,
                alerts = alerts.len(),
                elapsed_ms,
                budget_ms = self.pass_budget_ms,
                "alert evaluation pass exceeded latency budget"
            );
        }
        Ok(triggered)
    }

    /// Full path: per-alert logging, both directions, one transaction per
    /// fired alert.
    async fn evaluate_full(
        &self,
        alerts: &[Alert],
        update: &PriceUpdate,
    ) -> Result<Vec<AlertTrigger>> {
        let now = Utc::now();
        let mut triggered = Vec::new();

        for alert in alerts {
            if !self.passes_gates(alert, update, now) {
                continue;
            }

            let firings = self.evaluate_conditions(alert, update);
            if firings.is_empty() {
                continue;
            }
            debug!(
                alert_id = alert.id,
                condition = %alert.condition,
                firings = firings.len(),
                "alert fired"
            );

            // One row per qualifying direction, persisted in a single
            // transaction: either every direction's row is durable and the
            // bookkeeping runs, or nothing changes
            let rows: Vec<AlertTrigger> = firings
                .iter()
                .map(|firing| self.build_trigger(alert, firing, update, now))
                .collect();
            if let Err(e) = self.store.insert_triggers(&rows).await {
                warn!(alert_id = alert.id, error = %e, "failed to persist triggers");
                continue;
            }

            if let Err(e) = self
                .store
                .mark_triggered(alert, now, update.bar_timestamp)
                .await
            {
                warn!(alert_id = alert.id, error = %e, "failed to update alert after trigger");
            }
            self.cooldowns.record_trigger(alert.id, now);
            triggered.extend(rows);
        }
        Ok(triggered)
    }

    /// Simplified batch path for very large alert sets: no per-alert debug
    /// logging, first qualifying direction only, bulk trigger persistence.
    async fn evaluate_batch(
        &self,
        alerts: &[Alert],
        update: &PriceUpdate,
    ) -> Result<Vec<AlertTrigger>> {
        let now = Utc::now();
        let mut triggered = Vec::new();
        let mut fired_alerts = Vec::new();

        for alert in alerts {
            if !self.passes_gates(alert, update, now) {
                continue;
            }
            let firings = self.evaluate_conditions(alert, update);
            if let Some(firing) = firings.first() {
                triggered.push(self.build_trigger(alert, firing, update, now));
                fired_alerts.push(alert);
            }
        }

        if triggered.is_empty() {
            return Ok(Vec::new());
        }

        self.store.insert_triggers(&triggered).await?;
        for alert in fired_alerts {
            if let Err(e) = self
                .store
                .mark_triggered(alert, now, update.bar_timestamp)
                .await
            {
                warn!(alert_id = alert.id, error = %e, "failed to update alert after trigger");
            }
            self.cooldowns.record_trigger(alert.id, now);
        }
        Ok(triggered)
    }

    /// Gate order matters: trigger mode first, then cooldown, and only then
    /// is the rule itself evaluated.
    fn passes_gates(&self, alert: &Alert, update: &PriceUpdate, now: DateTime<Utc>) -> bool {
        match alert.trigger_mode {
            TriggerMode::Once => {
                if alert.last_triggered_at.is_some() {
                    return false;
                }
            }
            TriggerMode::OncePerBar | TriggerMode::OncePerBarClose => {
                if let (Some(last_bar), Some(bar)) =
                    (alert.last_triggered_bar, update.bar_timestamp)
                {
                    if last_bar == bar {
                        return false;
                    }
                }
            }
        }

        let effective_cooldown_secs =
            (alert.cooldown_minutes * 60).max(self.min_cooldown_secs);
        if let Some(last) = self.cooldowns.last_trigger(alert.id) {
            let elapsed = (now - last).num_seconds();
            if elapsed < effective_cooldown_secs {
                return false;
            }
        }
        true
    }

    fn evaluate_conditions(&self, alert: &Alert, update: &PriceUpdate) -> Vec<Firing> {
        let snapshot = self.snapshot_for(alert, update);
        let input = EvalInput {
            current_price: update.current_price,
            previous_price: update.previous_price,
            snapshot,
        };
        conditions::evaluate(
            alert.condition,
            alert.threshold,
            EnabledDirections {
                upper: alert.upper_enabled,
                lower: alert.lower_enabled,
            },
            input,
        )
    }

    /// Snapshot resolution: the per-indicator map entry wins, the shared
    /// fallback snapshot covers the rest. A missing snapshot for an
    /// indicator condition simply yields no firing.
    fn snapshot_for<'a>(
        &self,
        alert: &Alert,
        update: &'a PriceUpdate,
    ) -> Option<&'a IndicatorSnapshot> {
        if !alert.condition.is_indicator() {
            return None;
        }
        if let (Some(spec), Some(map)) = (&alert.indicator, &update.indicator_data_map) {
            if let Some(snapshot) = map.get(&spec.cache_fragment()) {
                return Some(snapshot);
            }
        }
        update.indicator_data.as_ref()
    }

    fn build_trigger(
        &self,
        alert: &Alert,
        firing: &Firing,
        update: &PriceUpdate,
        now: DateTime<Utc>,
    ) -> AlertTrigger {
        let indicator_value = alert.condition.is_indicator().then_some(firing.observed);
        AlertTrigger {
            alert_id: alert.id,
            triggered_at: now,
            observed_price: Some(update.current_price),
            indicator_value,
            direction: firing.direction,
            message: alert.message_for(firing.direction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertCondition, TriggerDirection};
    use std::time::Instant;
    use tempfile::tempdir;

    async fn engine() -> (tempfile::TempDir, Arc<MarketStore>, AlertEngine<InMemoryCooldowns>) {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(
            MarketStore::new(temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let engine = AlertEngine::new(Arc::clone(&store), InMemoryCooldowns::new());
        (temp_dir, store, engine)
    }

    fn base_alert(symbol_id: i64) -> Alert {
        Alert {
            id: 0,
            symbol_id,
            condition: AlertCondition::Above,
            threshold: 150.0,
            indicator: None,
            trigger_mode: TriggerMode::OncePerBar,
            cooldown_minutes: 5,
            upper_enabled: true,
            lower_enabled: true,
            message_upper: Some("up".to_string()),
            message_lower: Some("down".to_string()),
            is_active: true,
            last_triggered_at: None,
            last_triggered_bar: None,
        }
    }

    fn update(current: f64, previous: Option<f64>) -> PriceUpdate {
        PriceUpdate {
            current_price: current,
            previous_price: previous,
            bar_timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_above_cross_fires_and_persists() {
        let (_dir, store, engine) = engine().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        store.create_alert(&base_alert(symbol_id)).await.unwrap();

        let fired = engine
            .evaluate_symbol_alerts(symbol_id, &update(155.0, Some(145.0)))
            .await
            .unwrap();

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].direction, TriggerDirection::Upper);
        assert_eq!(fired[0].message, "up");
        let rows = store.triggers_for_alert(fired[0].alert_id).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_immediate_refire() {
        let (_dir, store, engine) = engine().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        store.create_alert(&base_alert(symbol_id)).await.unwrap();

        let first = engine
            .evaluate_symbol_alerts(symbol_id, &update(155.0, Some(145.0)))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Same qualifying sample immediately again, with a new bar so only
        // the cooldown gate applies
        let mut second_update = update(155.0, Some(145.0));
        second_update.bar_timestamp = Some(Utc::now() + chrono::Duration::seconds(60));
        let second = engine
            .evaluate_symbol_alerts(symbol_id, &second_update)
            .await
            .unwrap();
        assert!(second.is_empty(), "cooldown must suppress the refire");
    }

    #[tokio::test]
    async fn test_once_mode_fires_exactly_once() {
        let (_dir, store, _) = engine().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        let mut alert = base_alert(symbol_id);
        alert.trigger_mode = TriggerMode::Once;
        let id = store.create_alert(&alert).await.unwrap();

        // Zero effective cooldown so only the mode gate is exercised
        let engine = AlertEngine::with_limits(
            Arc::new(MarketStore::new(_dir.path().join("test.db")).await.unwrap()),
            InMemoryCooldowns::new(),
            ALERT_BATCH_THRESHOLD,
            0,
        );

        let first = engine
            .evaluate_symbol_alerts(symbol_id, &update(155.0, Some(145.0)))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let reloaded = engine.store.load_alert(id).await.unwrap();
        assert!(!reloaded.is_active, "one-shot alerts disable themselves");

        let second = engine
            .evaluate_symbol_alerts(symbol_id, &update(155.0, Some(145.0)))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_once_per_bar_rearms_on_new_bar() {
        let (_dir, store, _) = engine().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        store.create_alert(&base_alert(symbol_id)).await.unwrap();

        let engine = AlertEngine::with_limits(
            Arc::new(MarketStore::new(_dir.path().join("test.db")).await.unwrap()),
            InMemoryCooldowns::new(),
            ALERT_BATCH_THRESHOLD,
            0,
        );

        let bar1 = Utc::now();
        let mut u = update(155.0, Some(145.0));
        u.bar_timestamp = Some(bar1);
        assert_eq!(engine.evaluate_symbol_alerts(symbol_id, &u).await.unwrap().len(), 1);

        // Same bar: gated
        assert!(engine.evaluate_symbol_alerts(symbol_id, &u).await.unwrap().is_empty());

        // Bar advances: re-armed
        u.bar_timestamp = Some(bar1 + chrono::Duration::days(1));
        assert_eq!(engine.evaluate_symbol_alerts(symbol_id, &u).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_band_cross_gap_emits_two_trigger_rows() {
        let (_dir, store, engine) = engine().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        let mut alert = base_alert(symbol_id);
        alert.condition = AlertCondition::BandCross;
        let id = store.create_alert(&alert).await.unwrap();

        let mut u = update(20.0, Some(80.0));
        u.indicator_data = Some(IndicatorSnapshot {
            value: Some(20.0),
            prev_value: Some(80.0),
            upper_band: Some(70.0),
            lower_band: Some(30.0),
            ..Default::default()
        });

        let fired = engine.evaluate_symbol_alerts(symbol_id, &u).await.unwrap();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired.iter().filter(|t| t.direction == TriggerDirection::Upper).count(), 1);
        assert_eq!(fired.iter().filter(|t| t.direction == TriggerDirection::Lower).count(), 1);
        assert_eq!(store.triggers_for_alert(id).await.unwrap().len(), 2);

        // Direction-specific messages
        let upper = fired.iter().find(|t| t.direction == TriggerDirection::Upper).unwrap();
        let lower = fired.iter().find(|t| t.direction == TriggerDirection::Lower).unwrap();
        assert_eq!(upper.message, "up");
        assert_eq!(lower.message, "down");

        // Bookkeeping ran after both rows persisted
        let after = store.load_alert(id).await.unwrap();
        assert!(after.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn test_malformed_alert_does_not_block_siblings() {
        let (_dir, store, engine) = engine().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();

        // An indicator alert with no snapshot available is skipped
        let mut broken = base_alert(symbol_id);
        broken.condition = AlertCondition::BandCross;
        store.create_alert(&broken).await.unwrap();
        store.create_alert(&base_alert(symbol_id)).await.unwrap();

        let fired = engine
            .evaluate_symbol_alerts(symbol_id, &update(155.0, Some(145.0)))
            .await
            .unwrap();
        assert_eq!(fired.len(), 1, "healthy sibling still evaluates");
    }

    #[tokio::test]
    async fn test_batch_path_handles_large_alert_sets() {
        let (_dir, store, _) = engine().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        for _ in 0..50 {
            store.create_alert(&base_alert(symbol_id)).await.unwrap();
        }

        // Force the batch path with a low threshold
        let engine = AlertEngine::with_limits(
            Arc::new(MarketStore::new(_dir.path().join("test.db")).await.unwrap()),
            InMemoryCooldowns::new(),
            10,
            0,
        );

        let start = Instant::now();
        let fired = engine
            .evaluate_symbol_alerts(symbol_id, &update(155.0, Some(145.0)))
            .await
            .unwrap();
        assert_eq!(fired.len(), 50);
        assert!(start.elapsed().as_millis() < 5_000);
    }

    #[tokio::test]
    async fn test_indicator_map_entry_wins_over_fallback() {
        let (_dir, store, engine) = engine().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        let mut alert = base_alert(symbol_id);
        alert.condition = AlertCondition::IndicatorTurnsPositive;
        alert.indicator = Some(crate::models::IndicatorSpec {
            name: "macd".to_string(),
            field: None,
            params: vec![],
        });
        store.create_alert(&alert).await.unwrap();

        let fragment = alert.indicator.as_ref().unwrap().cache_fragment();
        let mut map = HashMap::new();
        map.insert(
            fragment,
            IndicatorSnapshot {
                value: Some(0.5),
                prev_value: Some(-0.5),
                ..Default::default()
            },
        );

        let mut u = update(100.0, Some(99.0));
        // Fallback snapshot would not fire; the map entry does
        u.indicator_data = Some(IndicatorSnapshot {
            value: Some(0.5),
            prev_value: Some(0.4),
            ..Default::default()
        });
        u.indicator_data_map = Some(map);

        let fired = engine.evaluate_symbol_alerts(symbol_id, &u).await.unwrap();
        assert_eq!(fired.len(), 1);
    }
}
