//! Tunables for the data pipeline and alert engine.
//!
//! Values here are compiled defaults; the ones that operators commonly
//! adjust are also overridable through environment variables (see
//! `config.rs`).

/// Floor applied to every alert cooldown, regardless of configuration.
///
/// Prevents a misconfigured `cooldown_minutes = 0` alert from firing on
/// every single price update.
pub const MIN_COOLDOWN_SECONDS: i64 = 60;

/// Alert count at which `evaluate_symbol_alerts` switches to the simplified
/// batch path (no per-alert debug logging, single-direction evaluation,
/// bulk trigger persistence).
pub const ALERT_BATCH_THRESHOLD: usize = 1_000;

/// Wall-clock budget for one evaluation pass. Exceeding it logs a warning;
/// it never fails the call.
pub const ALERT_PASS_BUDGET_MS: u64 = 500;

/// Coverage ratio below which the orchestrator attempts a gap fill.
pub const COVERAGE_FETCH_THRESHOLD: f64 = 0.5;

/// Hard cap on the number of missing bars a single gap fill may request.
/// Above this the fetch is skipped entirely rather than risking a
/// pathological upstream request.
pub const MAX_GAP_FETCH_BARS: i64 = 10_000;

/// Timeout for the whole gap-fill fetch-and-persist step.
pub const GAP_FETCH_TIMEOUT_SECS: u64 = 30;

/// Maximum retries for a provider chunk at split depth 0.
pub const PROVIDER_MAX_RETRIES: u32 = 5;

/// Reduced retry budget for windows produced by bisection.
pub const PROVIDER_SPLIT_RETRIES: u32 = 2;

/// Maximum bisection depth for a failing fetch window.
pub const PROVIDER_MAX_SPLIT_DEPTH: u32 = 6;

/// Windows at or below this span are abandoned instead of split further.
pub const PROVIDER_MIN_SPLIT_WINDOW_SECS: i64 = 3_600;

/// Per-request HTTP timeout for the provider transport.
pub const PROVIDER_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default global provider rate limit (requests per second).
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 5;

/// Fraction of entries evicted when a cache reaches its entry limit.
pub const CACHE_EVICT_FRACTION: f64 = 0.10;

/// Default entry limit per cache instance.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 2_000;

/// Default memory budget per cache instance (64 MB).
pub const DEFAULT_CACHE_MEMORY_BUDGET_BYTES: usize = 64 * 1024 * 1024;

/// Fixed TTL for computed indicator results.
pub const INDICATOR_CACHE_TTL_SECONDS: u64 = 300;

/// Bar-cache TTLs by interval class.
pub const BAR_TTL_INTRADAY_SECONDS: u64 = 60;
pub const BAR_TTL_HOURLY_SECONDS: u64 = 300;
pub const BAR_TTL_DAILY_SECONDS: u64 = 3_600;
pub const BAR_TTL_WEEKLY_SECONDS: u64 = 4 * 3_600;
