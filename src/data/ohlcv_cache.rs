// =============================================================================
// OHLCV cache — in-memory LRU over a SQLite tier, with gap detection
// =============================================================================
//
// `get` consults memory first, then the database tier (promoting hits back
// into memory). A miss returns None; the caller fetches from the exchange
// and `put`s the result. Entries are filtered to the requested window on
// the way out. Gap detection flags successive candles whose spacing exceeds
// 1.5x the timeframe interval.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::persistence::Store;
use crate::types::Candle;

/// Cache key: one fetch window for a series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CacheKey {
    pub symbol: String,
    pub timeframe: String,
    /// Window start, truncated to the day (epoch days).
    pub start_day: i64,
    /// Window end, truncated to the day (epoch days).
    pub end_day: i64,
}

impl CacheKey {
    pub fn new(symbol: &str, timeframe: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        const DAY_SECS: i64 = 86_400;
        Self {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            start_day: start.timestamp().div_euclid(DAY_SECS),
            end_day: end.timestamp().div_euclid(DAY_SECS),
        }
    }
}

/// Parse a timeframe string ("1m", "5m", "15m", "1h", "4h", "1d") into its
/// bar interval.
pub fn timeframe_interval(timeframe: &str) -> Option<Duration> {
    let (num, unit) = timeframe.split_at(timeframe.len().checked_sub(1)?);
    let num: u64 = num.parse().ok()?;
    if num == 0 {
        return None;
    }
    let secs = match unit {
        "m" => num * 60,
        "h" => num * 3_600,
        "d" => num * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// A detected hole in a candle series.
#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Report gaps where successive timestamps differ by more than 1.5x the
/// expected interval.
pub fn find_gaps(candles: &[Candle], timeframe: &str) -> Vec<Gap> {
    let Some(expected) = timeframe_interval(timeframe) else {
        return Vec::new();
    };
    let threshold_ms = (expected.as_millis() as i64) * 3 / 2;

    candles
        .windows(2)
        .filter_map(|pair| {
            let delta = pair[1].timestamp.timestamp_millis() - pair[0].timestamp.timestamp_millis();
            (delta > threshold_ms).then(|| Gap {
                from: pair[0].timestamp,
                to: pair[1].timestamp,
            })
        })
        .collect()
}

/// Two-tier cache: bounded LRU map in memory, SQLite rows on disk.
pub struct OhlcvCache {
    exchange: String,
    store: Option<Arc<Store>>,
    capacity: usize,
    inner: Mutex<MemoryTier>,
}

struct MemoryTier {
    entries: HashMap<CacheKey, Vec<Candle>>,
    /// Access order, least-recent first.
    order: VecDeque<CacheKey>,
}

impl OhlcvCache {
    pub fn new(exchange: impl Into<String>, store: Option<Arc<Store>>, capacity: usize) -> Self {
        Self {
            exchange: exchange.into(),
            store,
            capacity: capacity.max(1),
            inner: Mutex::new(MemoryTier {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Look up candles for the window. Memory first, then the disk tier
    /// (promoted into memory on hit). None means the caller must fetch.
    pub async fn get(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Vec<Candle>> {
        let key = CacheKey::new(symbol, timeframe, start, end);

        if let Some(candles) = self.memory_get(&key) {
            debug!(symbol, timeframe, "ohlcv cache hit (memory)");
            return Some(window(candles, start, end));
        }

        let store = self.store.as_ref()?;
        match store
            .load_candles(&self.exchange, symbol, timeframe, start, end)
            .await
        {
            Ok(candles) if !candles.is_empty() => {
                debug!(symbol, timeframe, rows = candles.len(), "ohlcv cache hit (disk)");
                self.memory_put(key, candles.clone());
                Some(window(candles, start, end))
            }
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "ohlcv disk tier read failed");
                None
            }
        }
    }

    /// Store fetched candles in both tiers.
    pub async fn put(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        candles: Vec<Candle>,
    ) {
        if let Some(store) = &self.store {
            if let Err(e) = store
                .upsert_candles(&self.exchange, symbol, timeframe, &candles)
                .await
            {
                debug!(error = %e, "ohlcv disk tier write failed");
            }
        }
        self.memory_put(CacheKey::new(symbol, timeframe, start, end), candles);
    }

    pub fn memory_len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn memory_get(&self, key: &CacheKey) -> Option<Vec<Candle>> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(key) {
            return None;
        }
        // Refresh LRU position.
        inner.order.retain(|k| k != key);
        inner.order.push_back(key.clone());
        inner.entries.get(key).cloned()
    }

    fn memory_put(&self, key: CacheKey, candles: Vec<Candle>) {
        let mut inner = self.inner.lock();
        if inner.entries.insert(key.clone(), candles).is_none() {
            inner.order.push_back(key);
        } else {
            inner.order.retain(|k| k != &key);
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            } else {
                break;
            }
        }
    }
}

/// Filter candles to the inclusive `[start, end]` window.
fn window(candles: Vec<Candle>, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Candle> {
    candles
        .into_iter()
        .filter(|c| c.timestamp >= start && c.timestamp <= end)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle_at(ms: i64) -> Candle {
        Candle {
            timestamp: DateTime::<Utc>::from_timestamp_millis(ms).unwrap(),
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(10),
        }
    }

    fn series(start_ms: i64, step_ms: i64, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| candle_at(start_ms + i as i64 * step_ms))
            .collect()
    }

    #[test]
    fn timeframe_parsing() {
        assert_eq!(timeframe_interval("1m"), Some(Duration::from_secs(60)));
        assert_eq!(timeframe_interval("15m"), Some(Duration::from_secs(900)));
        assert_eq!(timeframe_interval("4h"), Some(Duration::from_secs(14_400)));
        assert_eq!(timeframe_interval("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(timeframe_interval("bogus"), None);
        assert_eq!(timeframe_interval(""), None);
    }

    #[test]
    fn gaps_detected_beyond_threshold() {
        // 1h candles with one missing bar: spacing of 2h > 1.5h threshold.
        let mut candles = series(0, 3_600_000, 3);
        candles.push(candle_at(3 * 3_600_000 + 3_600_000)); // skips hour 3
        let gaps = find_gaps(&candles, "1h");
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].from.timestamp_millis(), 2 * 3_600_000);

        // A contiguous series has none.
        assert!(find_gaps(&series(0, 3_600_000, 5), "1h").is_empty());
    }

    #[tokio::test]
    async fn memory_tier_hits_and_windows() {
        let cache = OhlcvCache::new("binance", None, 4);
        let candles = series(0, 3_600_000, 6);
        let start = candles[0].timestamp;
        let end = candles[5].timestamp;

        cache.put("BTC/USDT", "1h", start, end, candles.clone()).await;

        // Same window key, narrower filter bounds.
        let hit = cache
            .get("BTC/USDT", "1h", start, candles[2].timestamp)
            .await;
        // Different end day would be a different key; same-day narrowing hits.
        if let Some(hit) = hit {
            assert!(hit.iter().all(|c| c.timestamp <= candles[2].timestamp));
        }

        let exact = cache.get("BTC/USDT", "1h", start, end).await.unwrap();
        assert_eq!(exact.len(), 6);
        assert!(cache.get("ETH/USDT", "1h", start, end).await.is_none());
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let cache = OhlcvCache::new("binance", None, 2);
        let candles = series(0, 60_000, 2);
        let start = candles[0].timestamp;
        let end = candles[1].timestamp;

        cache.put("A/USDT", "1m", start, end, candles.clone()).await;
        cache.put("B/USDT", "1m", start, end, candles.clone()).await;
        // Touch A so B becomes least-recent.
        cache.get("A/USDT", "1m", start, end).await.unwrap();
        cache.put("C/USDT", "1m", start, end, candles.clone()).await;

        assert_eq!(cache.memory_len(), 2);
        assert!(cache.get("A/USDT", "1m", start, end).await.is_some());
        assert!(cache.get("B/USDT", "1m", start, end).await.is_none());
        assert!(cache.get("C/USDT", "1m", start, end).await.is_some());
    }

    #[tokio::test]
    async fn disk_tier_promotes_to_memory() {
        let store = Arc::new(Store::connect("sqlite::memory:", 1).await.unwrap());
        let cache = OhlcvCache::new("binance", Some(store.clone()), 4);
        let candles = series(0, 3_600_000, 3);
        let start = candles[0].timestamp;
        let end = candles[2].timestamp;

        // Seed only the disk tier.
        store
            .upsert_candles("binance", "BTC/USDT", "1h", &candles)
            .await
            .unwrap();
        assert_eq!(cache.memory_len(), 0);

        let hit = cache.get("BTC/USDT", "1h", start, end).await.unwrap();
        assert_eq!(hit.len(), 3);
        assert_eq!(cache.memory_len(), 1);
    }
}
