//! SQLite persistence for candles, alerts, and fired triggers.
//!
//! The candle table is idempotent on `(symbol_id, interval, timestamp)`:
//! re-persisting an overlapping range is an upsert, never a duplicate.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{AppError, Result};
use crate::models::{
    Alert, AlertCondition, AlertTrigger, Candle, IndicatorSpec, Interval, TriggerDirection,
    TriggerMode,
};

const DB_SCHEMA_VERSION: &str = "1";

/// SQLite-backed market store
#[derive(Debug)]
pub struct MarketStore {
    pool: SqlitePool,
}

impl MarketStore {
    /// Open (creating if missing) with WAL and a generous busy timeout.
    pub async fn new(database_path: PathBuf) -> Result<Self> {
        info!("Initializing SQLite store at: {:?}", database_path);

        if let Some(parent) = database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(connect_options).await?;
        let store = Self { pool };
        store.initialize_schema().await?;
        info!("SQLite store initialized");
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS symbols (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL UNIQUE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol_id INTEGER NOT NULL,
                interval TEXT NOT NULL,
                timestamp DATETIME NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol_id INTEGER NOT NULL,
                condition TEXT NOT NULL,
                threshold REAL NOT NULL,
                indicator_name TEXT,
                indicator_field TEXT,
                indicator_params TEXT,
                trigger_mode TEXT NOT NULL DEFAULT 'once_per_bar',
                cooldown_minutes INTEGER NOT NULL DEFAULT 5,
                upper_enabled INTEGER NOT NULL DEFAULT 1,
                lower_enabled INTEGER NOT NULL DEFAULT 1,
                message_upper TEXT,
                message_lower TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_triggered_at DATETIME,
                last_triggered_bar DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_triggers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id INTEGER NOT NULL,
                triggered_at DATETIME NOT NULL,
                observed_price REAL,
                indicator_value REAL,
                trigger_type TEXT NOT NULL,
                trigger_message TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = vec![
            // Candle uniqueness invariant; makes upserts idempotent
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_candles_unique ON candles(symbol_id, interval, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_candles_lookup ON candles(symbol_id, interval, timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_alerts_symbol_active ON alerts(symbol_id, is_active)",
            "CREATE INDEX IF NOT EXISTS idx_triggers_alert ON alert_triggers(alert_id, triggered_at DESC)",
        ];
        for index in indexes {
            sqlx::query(index).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)")
            .bind(DB_SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Resolve a ticker to its symbol id, creating the row if needed.
    pub async fn ensure_symbol(&self, ticker: &str) -> Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO symbols (ticker) VALUES (?1)")
            .bind(ticker)
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM symbols WHERE ticker = ?1")
            .bind(ticker)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn ticker_for(&self, symbol_id: i64) -> Result<String> {
        sqlx::query_scalar("SELECT ticker FROM symbols WHERE id = ?1")
            .bind(symbol_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("symbol {}", symbol_id)))
    }

    /// Idempotent bulk upsert on the candle uniqueness invariant.
    pub async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut transaction = self.pool.begin().await?;
        let mut affected_rows = 0;

        for candle in candles {
            let result = sqlx::query(
                r#"
                INSERT OR REPLACE INTO candles
                (symbol_id, interval, timestamp, open, high, low, close, volume)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(candle.symbol_id)
            .bind(candle.interval.as_str())
            .bind(candle.time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume as i64)
            .execute(&mut *transaction)
            .await?;
            affected_rows += result.rows_affected() as usize;
        }

        transaction.commit().await?;
        Ok(affected_rows)
    }

    /// Bars for `[start, end]` ascending. Rows with non-finite OHLC are
    /// discarded here so consumers never see them.
    pub async fn query_candles(
        &self,
        symbol_id: i64,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, open, high, low, close, volume
            FROM candles
            WHERE symbol_id = ?1 AND interval = ?2 AND timestamp >= ?3 AND timestamp <= ?4
            ORDER BY timestamp ASC
            "#,
        )
        .bind(symbol_id)
        .bind(interval.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let candle = Candle {
                symbol_id,
                time: row.try_get("timestamp")?,
                interval,
                open: row.try_get("open")?,
                high: row.try_get("high")?,
                low: row.try_get("low")?,
                close: row.try_get("close")?,
                volume: row.try_get::<i64, _>("volume")?.max(0) as u64,
            };
            if candle.is_valid() {
                candles.push(candle);
            }
        }
        Ok(candles)
    }

    pub async fn count_candles(&self, symbol_id: i64, interval: Interval) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM candles WHERE symbol_id = ?1 AND interval = ?2",
        )
        .bind(symbol_id)
        .bind(interval.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn create_alert(&self, alert: &Alert) -> Result<i64> {
        let params_json = match &alert.indicator {
            Some(spec) => Some(serde_json::to_string(&spec.params)?),
            None => None,
        };
        let result = sqlx::query(
            r#"
            INSERT INTO alerts
            (symbol_id, condition, threshold, indicator_name, indicator_field,
             indicator_params, trigger_mode, cooldown_minutes, upper_enabled,
             lower_enabled, message_upper, message_lower, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(alert.symbol_id)
        .bind(alert.condition.as_str())
        .bind(alert.threshold)
        .bind(alert.indicator.as_ref().map(|s| s.name.clone()))
        .bind(alert.indicator.as_ref().and_then(|s| s.field.clone()))
        .bind(params_json)
        .bind(alert.trigger_mode.as_str())
        .bind(alert.cooldown_minutes)
        .bind(alert.upper_enabled)
        .bind(alert.lower_enabled)
        .bind(alert.message_upper.clone())
        .bind(alert.message_lower.clone())
        .bind(alert.is_active)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// All active alerts for a symbol. Rows with an unparseable condition
    /// or mode are skipped rather than failing the load.
    pub async fn load_active_alerts(&self, symbol_id: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM alerts WHERE symbol_id = ?1 AND is_active = 1 ORDER BY id ASC",
        )
        .bind(symbol_id)
        .fetch_all(&self.pool)
        .await?;

        let mut alerts = Vec::with_capacity(rows.len());
        for row in rows {
            match Self::row_to_alert(&row) {
                Ok(alert) => alerts.push(alert),
                Err(e) => {
                    tracing::warn!(symbol_id, error = %e, "skipping malformed alert row");
                }
            }
        }
        Ok(alerts)
    }

    pub async fn load_alert(&self, alert_id: i64) -> Result<Alert> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?1")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("alert {}", alert_id)))?;
        Self::row_to_alert(&row)
    }

    fn row_to_alert(row: &sqlx::sqlite::SqliteRow) -> Result<Alert> {
        let condition = AlertCondition::from_str(&row.try_get::<String, _>("condition")?)?;
        let trigger_mode = TriggerMode::from_str(&row.try_get::<String, _>("trigger_mode")?)?;

        let indicator_name: Option<String> = row.try_get("indicator_name")?;
        let indicator = match indicator_name {
            Some(name) => {
                let params: Vec<(String, f64)> = row
                    .try_get::<Option<String>, _>("indicator_params")?
                    .map(|json| serde_json::from_str(&json))
                    .transpose()?
                    .unwrap_or_default();
                Some(IndicatorSpec {
                    name,
                    field: row.try_get("indicator_field")?,
                    params,
                })
            }
            None => None,
        };

        Ok(Alert {
            id: row.try_get("id")?,
            symbol_id: row.try_get("symbol_id")?,
            condition,
            threshold: row.try_get("threshold")?,
            indicator,
            trigger_mode,
            cooldown_minutes: row.try_get("cooldown_minutes")?,
            upper_enabled: row.try_get("upper_enabled")?,
            lower_enabled: row.try_get("lower_enabled")?,
            message_upper: row.try_get("message_upper")?,
            message_lower: row.try_get("message_lower")?,
            is_active: row.try_get("is_active")?,
            last_triggered_at: row.try_get("last_triggered_at")?,
            last_triggered_bar: row.try_get("last_triggered_bar")?,
        })
    }

    pub async fn insert_trigger(&self, trigger: &AlertTrigger) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO alert_triggers
            (alert_id, triggered_at, observed_price, indicator_value, trigger_type, trigger_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(trigger.alert_id)
        .bind(trigger.triggered_at)
        .bind(trigger.observed_price)
        .bind(trigger.indicator_value)
        .bind(trigger.direction.as_str())
        .bind(trigger.message.clone())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Bulk variant used by the batch evaluation path.
    pub async fn insert_triggers(&self, triggers: &[AlertTrigger]) -> Result<usize> {
        if triggers.is_empty() {
            return Ok(0);
        }
        let mut transaction = self.pool.begin().await?;
        for trigger in triggers {
            sqlx::query(
                r#"
                INSERT INTO alert_triggers
                (alert_id, triggered_at, observed_price, indicator_value, trigger_type, trigger_message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(trigger.alert_id)
            .bind(trigger.triggered_at)
            .bind(trigger.observed_price)
            .bind(trigger.indicator_value)
            .bind(trigger.direction.as_str())
            .bind(trigger.message.clone())
            .execute(&mut *transaction)
            .await?;
        }
        transaction.commit().await?;
        Ok(triggers.len())
    }

    /// Post-fire bookkeeping: stamps `last_triggered_at`, records the bar
    /// timestamp for bar-scoped modes, and deactivates one-shot alerts.
    pub async fn mark_triggered(
        &self,
        alert: &Alert,
        triggered_at: DateTime<Utc>,
        bar_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let deactivate = alert.trigger_mode == TriggerMode::Once;
        let bar = match alert.trigger_mode {
            TriggerMode::OncePerBar | TriggerMode::OncePerBarClose => bar_timestamp,
            TriggerMode::Once => None,
        };
        sqlx::query(
            r#"
            UPDATE alerts
            SET last_triggered_at = ?1,
                last_triggered_bar = COALESCE(?2, last_triggered_bar),
                is_active = CASE WHEN ?3 THEN 0 ELSE is_active END
            WHERE id = ?4
            "#,
        )
        .bind(triggered_at)
        .bind(bar)
        .bind(deactivate)
        .bind(alert.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn triggers_for_alert(&self, alert_id: i64) -> Result<Vec<AlertTrigger>> {
        let rows = sqlx::query(
            "SELECT * FROM alert_triggers WHERE alert_id = ?1 ORDER BY triggered_at ASC, id ASC",
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;

        let mut triggers = Vec::with_capacity(rows.len());
        for row in rows {
            let direction = match row.try_get::<String, _>("trigger_type")?.as_str() {
                "upper" => TriggerDirection::Upper,
                "lower" => TriggerDirection::Lower,
                other => {
                    return Err(AppError::Parse(format!("invalid trigger_type: {}", other)))
                }
            };
            triggers.push(AlertTrigger {
                alert_id: row.try_get("alert_id")?,
                triggered_at: row.try_get("triggered_at")?,
                observed_price: row.try_get("observed_price")?,
                indicator_value: row.try_get("indicator_value")?,
                direction,
                message: row.try_get("trigger_message")?,
            });
        }
        Ok(triggers)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let candles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM candles")
            .fetch_one(&self.pool)
            .await?;
        let symbols: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM symbols")
            .fetch_one(&self.pool)
            .await?;
        let alerts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        let triggers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alert_triggers")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            candles,
            symbols,
            active_alerts: alerts,
            triggers,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("SQLite store connection pool closed");
    }
}

/// Store statistics for the status command
#[derive(Debug)]
pub struct StoreStats {
    pub candles: i64,
    pub symbols: i64,
    pub active_alerts: i64,
    pub triggers: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, MarketStore) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let store = MarketStore::new(db_path).await.unwrap();
        (temp_dir, store)
    }

    fn daily_candle(symbol_id: i64, day: u32, close: f64) -> Candle {
        Candle::new(
            symbol_id,
            Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap(),
            Interval::Day1,
            close - 1.0,
            close + 1.0,
            close - 2.0,
            close,
            1_000,
        )
    }

    fn price_alert(symbol_id: i64) -> Alert {
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
            message_upper: Some("broke out".to_string()),
            message_lower: None,
            is_active: true,
            last_triggered_at: None,
            last_triggered_bar: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_uniqueness() {
        let (_dir, store) = store().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        let candles = vec![daily_candle(symbol_id, 5, 100.0), daily_candle(symbol_id, 6, 101.0)];

        store.upsert_candles(&candles).await.unwrap();
        store.upsert_candles(&candles).await.unwrap();

        let count = store.count_candles(symbol_id, Interval::Day1).await.unwrap();
        assert_eq!(count, 2, "overlapping upserts must not duplicate rows");
        store.close().await;
    }

    #[tokio::test]
    async fn test_query_returns_ascending_range() {
        let (_dir, store) = store().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        let candles: Vec<Candle> = (1..=10).map(|d| daily_candle(symbol_id, d, 100.0 + d as f64)).collect();
        store.upsert_candles(&candles).await.unwrap();

        let result = store
            .query_candles(
                symbol_id,
                Interval::Day1,
                Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 1, 7, 0, 0, 0).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(result.len(), 5);
        for pair in result.windows(2) {
            assert!(pair[0].time < pair[1].time);
        }
        store.close().await;
    }

    #[tokio::test]
    async fn test_ensure_symbol_is_stable() {
        let (_dir, store) = store().await;
        let a = store.ensure_symbol("AAA").await.unwrap();
        let b = store.ensure_symbol("AAA").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.ticker_for(a).await.unwrap(), "AAA");
        store.close().await;
    }

    #[tokio::test]
    async fn test_alert_round_trip_with_indicator_spec() {
        let (_dir, store) = store().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        let mut alert = price_alert(symbol_id);
        alert.condition = AlertCondition::BandCross;
        alert.indicator = Some(IndicatorSpec {
            name: "bollinger".to_string(),
            field: Some("mid".to_string()),
            params: vec![("period".to_string(), 20.0), ("width".to_string(), 2.0)],
        });

        let id = store.create_alert(&alert).await.unwrap();
        let loaded = store.load_alert(id).await.unwrap();

        assert_eq!(loaded.condition, AlertCondition::BandCross);
        assert_eq!(loaded.indicator, alert.indicator);
        assert_eq!(loaded.trigger_mode, TriggerMode::OncePerBar);
        store.close().await;
    }

    #[tokio::test]
    async fn test_mark_triggered_once_deactivates() {
        let (_dir, store) = store().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        let mut alert = price_alert(symbol_id);
        alert.trigger_mode = TriggerMode::Once;
        let id = store.create_alert(&alert).await.unwrap();
        let loaded = store.load_alert(id).await.unwrap();

        store.mark_triggered(&loaded, Utc::now(), None).await.unwrap();

        let after = store.load_alert(id).await.unwrap();
        assert!(!after.is_active);
        assert!(after.last_triggered_at.is_some());
        assert!(store.load_active_alerts(symbol_id).await.unwrap().is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn test_trigger_rows_are_append_only() {
        let (_dir, store) = store().await;
        let symbol_id = store.ensure_symbol("AAA").await.unwrap();
        let id = store.create_alert(&price_alert(symbol_id)).await.unwrap();

        let trigger = AlertTrigger {
            alert_id: id,
            triggered_at: Utc::now(),
            observed_price: Some(155.0),
            indicator_value: None,
            direction: TriggerDirection::Upper,
            message: "broke out".to_string(),
        };
        store.insert_trigger(&trigger).await.unwrap();
        store.insert_trigger(&trigger).await.unwrap();

        let rows = store.triggers_for_alert(id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].direction, TriggerDirection::Upper);
        store.close().await;
    }
}
