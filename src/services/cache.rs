//! LRU+TTL result caches.
//!
//! Two independently configured instances are built at startup: one for raw
//! bar lists, one for computed indicator snapshots. Caching is strictly an
//! optimization layer: every internal failure path degrades to a miss and
//! nothing here ever surfaces as an error to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::constants::CACHE_EVICT_FRACTION;
use crate::models::{Candle, IndicatorSnapshot, Interval};

/// Rough in-memory footprint of a cached value, used against the memory
/// budget. Estimates do not have to be exact; they have to be monotone in
/// actual size.
pub trait EstimateSize {
    fn estimate_size(&self) -> usize;
}

impl EstimateSize for Vec<Candle> {
    fn estimate_size(&self) -> usize {
        self.len() * std::mem::size_of::<Candle>() + std::mem::size_of::<Self>()
    }
}

impl EstimateSize for IndicatorSnapshot {
    fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    symbol: Option<String>,
    created_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
    access_count: u64,
    size_estimate: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

#[derive(Debug, Default)]
struct CacheInner<V> {
    entries: HashMap<u64, CacheEntry<V>>,
    by_symbol: HashMap<String, HashSet<u64>>,
    total_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> CacheInner<V> {
    fn remove_entry(&mut self, key: u64) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(&key)?;
        self.total_size = self.total_size.saturating_sub(entry.size_estimate);
        if let Some(symbol) = &entry.symbol {
            if let Some(keys) = self.by_symbol.get_mut(symbol) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.by_symbol.remove(symbol);
                }
            }
        }
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            self.remove_entry(key);
            self.evictions += 1;
        }
    }

    fn clear_all(&mut self) {
        self.entries.clear();
        self.by_symbol.clear();
        self.total_size = 0;
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub total_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub generated_at: DateTime<Utc>,
}

/// LRU+TTL cache with a memory budget and symbol-keyed invalidation.
pub struct ResultCache<V> {
    name: &'static str,
    max_entries: usize,
    memory_budget_bytes: usize,
    inner: RwLock<CacheInner<V>>,
}

impl<V: Clone + EstimateSize> ResultCache<V> {
    pub fn new(name: &'static str, max_entries: usize, memory_budget_bytes: usize) -> Self {
        Self {
            name,
            max_entries: max_entries.max(1),
            memory_budget_bytes,
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                by_symbol: HashMap::new(),
                total_size: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Lookup. Expired entries across the whole cache are purged first, so
    /// a stale hit is never returned.
    pub async fn get(&self, key: u64) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.purge_expired(now);

        match inner.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_accessed = now;
                entry.access_count += 1;
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert, evicting as needed. Never fails; over-budget conditions that
    /// survive LRU eviction clear the whole cache as a fail-safe reset.
    pub async fn set(&self, key: u64, value: V, symbol: Option<&str>, ttl: Duration) {
        let size_estimate = value.estimate_size();
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.purge_expired(now);

        // Replacing an existing entry must not double-count its size or
        // leave a dangling reverse-index key
        inner.remove_entry(key);

        if inner.entries.len() >= self.max_entries {
            self.evict_lru(&mut inner);
        }

        if self.memory_budget_bytes > 0
            && inner.total_size + size_estimate > self.memory_budget_bytes
        {
            self.evict_lru(&mut inner);
            if inner.total_size + size_estimate > self.memory_budget_bytes {
                warn!(
                    cache = self.name,
                    size_bytes = inner.total_size,
                    budget_bytes = self.memory_budget_bytes,
                    "memory budget exceeded after eviction, clearing cache"
                );
                inner.clear_all();
            }
        }

        inner.total_size += size_estimate;
        if let Some(symbol) = symbol {
            inner
                .by_symbol
                .entry(symbol.to_string())
                .or_default()
                .insert(key);
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                symbol: symbol.map(|s| s.to_string()),
                created_at: now,
                ttl,
                last_accessed: now,
                access_count: 0,
                size_estimate,
            },
        );
    }

    /// Drop every entry tagged with `symbol`. O(entries-for-that-symbol)
    /// via the reverse index.
    pub async fn invalidate_by_symbol(&self, symbol: &str) -> usize {
        let mut inner = self.inner.write().await;
        let keys: Vec<u64> = inner
            .by_symbol
            .get(symbol)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for key in &keys {
            inner.remove_entry(*key);
        }
        if !keys.is_empty() {
            debug!(cache = self.name, symbol, removed = keys.len(), "invalidated by symbol");
        }
        keys.len()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.clear_all();
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            name: self.name.to_string(),
            entries: inner.entries.len(),
            total_size_bytes: inner.total_size,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            generated_at: Utc::now(),
        }
    }

    /// Evict the least-recently-accessed 10% of entries (at least one).
    fn evict_lru(&self, inner: &mut CacheInner<V>) {
        if inner.entries.is_empty() {
            return;
        }
        let count = ((inner.entries.len() as f64 * CACHE_EVICT_FRACTION).ceil() as usize).max(1);
        let mut by_age: Vec<(u64, Instant)> = inner
            .entries
            .iter()
            .map(|(k, e)| (*k, e.last_accessed))
            .collect();
        by_age.sort_by_key(|(_, accessed)| *accessed);
        for (key, _) in by_age.into_iter().take(count) {
            inner.remove_entry(key);
            inner.evictions += 1;
        }
    }
}

/// Deterministic key for a bar-list lookup. The range is normalized onto
/// the interval grid so equivalent requests hit the same entry.
///
/// Flooring `start` widens the effective range: a request starting mid-bar
/// can be served a cached list whose first bar precedes its own store
/// query. Acceptable for chart serving; callers needing exact range
/// boundaries must trim the result themselves.
pub fn bar_key(ticker: &str, interval: Interval, start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    let mut hasher = DefaultHasher::new();
    "bars".hash(&mut hasher);
    ticker.hash(&mut hasher);
    interval.as_str().hash(&mut hasher);
    interval.align(start).timestamp().hash(&mut hasher);
    interval.align(end).timestamp().hash(&mut hasher);
    hasher.finish()
}

/// Deterministic key for a computed indicator snapshot.
pub fn indicator_key(
    ticker: &str,
    interval: Interval,
    fragment: &str,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    "indicator".hash(&mut hasher);
    ticker.hash(&mut hasher);
    interval.as_str().hash(&mut hasher);
    fragment.hash(&mut hasher);
    if let Some((start, end)) = range {
        interval.align(start).timestamp().hash(&mut hasher);
        interval.align(end).timestamp().hash(&mut hasher);
    }
    hasher.finish()
}
