//! Price oracle: external spot index behind a TTL cache.
//!
//! Mark price equals index in the MVP; the accessors stay separate so a
//! basis (order-book mid EMA) can be introduced without touching callers.

use crate::clock::Clock;
use crate::config::{ORACLE_CACHE_TTL_SECONDS, ORACLE_TIMEOUT_SECONDS};
use crate::lock;
use crate::types::OracleData;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Latest spot price for a market, or None when the upstream has no
    /// quote for it or the fetch failed.
    async fn fetch_index_price(&self, market: &str) -> Option<Decimal>;
}

/// Kraken public ticker. Only BTC-USD-PERP is quoted for now.
pub struct KrakenFeed {
    client: reqwest::Client,
    url: String,
}

impl KrakenFeed {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ORACLE_TIMEOUT_SECONDS))
            .build()
            .unwrap_or_default();
        Self { client, url }
    }
}

#[async_trait]
impl PriceFeed for KrakenFeed {
    async fn fetch_index_price(&self, market: &str) -> Option<Decimal> {
        if market != "BTC-USD-PERP" {
            return None;
        }
        let response = match self.client.get(&self.url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(target = "bank", error = %e, "index price fetch failed");
                return None;
            }
        };
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(target = "bank", error = %e, "index price response was not json");
                return None;
            }
        };
        // {"result": {"XXBTZUSD": {"c": ["<last>", "<lot>"], ...}}}
        let result = body.get("result")?.as_object()?;
        let pair = result.values().next()?;
        let last = pair.get("c")?.get(0)?.as_str()?;
        match Decimal::from_str(last) {
            Ok(price) => Some(price),
            Err(e) => {
                warn!(target = "bank", error = %e, last, "unparseable index price");
                None
            }
        }
    }
}

struct CacheEntry {
    price: Decimal,
    fetched_at: u64,
}

pub struct PriceOracle {
    feed: Arc<dyn PriceFeed>,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl_seconds: u64,
}

impl PriceOracle {
    pub fn new(feed: Arc<dyn PriceFeed>, clock: Arc<dyn Clock>) -> Self {
        Self {
            feed,
            clock,
            cache: Mutex::new(HashMap::new()),
            ttl_seconds: ORACLE_CACHE_TTL_SECONDS,
        }
    }

    /// Cached index price. On upstream failure the last good value is
    /// returned even past its TTL; None only when nothing was ever cached.
    pub async fn index_price(&self, market: &str) -> Option<Decimal> {
        let now = self.clock.now();
        {
            let cache = lock(&self.cache, "oracle_cache");
            if let Some(entry) = cache.get(market) {
                if now.saturating_sub(entry.fetched_at) < self.ttl_seconds {
                    return Some(entry.price);
                }
            }
        }

        if let Some(price) = self.feed.fetch_index_price(market).await {
            let mut cache = lock(&self.cache, "oracle_cache");
            cache.insert(
                market.to_string(),
                CacheEntry {
                    price,
                    fetched_at: now,
                },
            );
            debug!(target = "bank", market, %price, "index price refreshed");
            return Some(price);
        }

        let cache = lock(&self.cache, "oracle_cache");
        match cache.get(market) {
            Some(entry) => {
                warn!(
                    target = "bank",
                    market,
                    price = %entry.price,
                    age_seconds = now.saturating_sub(entry.fetched_at),
                    "oracle upstream failed, returning stale price"
                );
                Some(entry.price)
            }
            None => None,
        }
    }

    /// Mark price used for PnL and liquidation. Equals index in the MVP.
    pub async fn mark_price(&self, market: &str) -> Option<Decimal> {
        self.index_price(market).await
    }

    pub async fn oracle_data(&self, market: &str) -> OracleData {
        let index = self.index_price(market).await;
        let mark = self.mark_price(market).await;
        OracleData {
            market: market.to_string(),
            index_price_usd: index,
            mark_price_usd: mark,
            timestamp: self.clock.now(),
        }
    }

    /// Drop the cached value for a market; test support.
    pub fn invalidate(&self, market: &str) {
        let mut cache = lock(&self.cache, "oracle_cache");
        cache.remove(market);
    }
}

/// Configurable in-process feed; test support.
pub struct StubFeed {
    price: Mutex<Option<Decimal>>,
}

impl StubFeed {
    pub fn new(price: Option<Decimal>) -> Self {
        Self {
            price: Mutex::new(price),
        }
    }

    pub fn set_price(&self, price: Option<Decimal>) {
        *lock(&self.price, "stub_feed") = price;
    }
}

#[async_trait]
impl PriceFeed for StubFeed {
    async fn fetch_index_price(&self, _market: &str) -> Option<Decimal> {
        *lock(&self.price, "stub_feed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rust_decimal_macros::dec;

    fn oracle_with(price: Option<Decimal>) -> (PriceOracle, Arc<StubFeed>, Arc<ManualClock>) {
        let feed = Arc::new(StubFeed::new(price));
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let oracle = PriceOracle::new(feed.clone(), clock.clone());
        (oracle, feed, clock)
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let (oracle, feed, clock) = oracle_with(Some(dec!(50000)));
        assert_eq!(oracle.index_price("BTC-USD-PERP").await, Some(dec!(50000)));
        // upstream moves but the cache is fresh
        feed.set_price(Some(dec!(51000)));
        clock.advance(10);
        assert_eq!(oracle.index_price("BTC-USD-PERP").await, Some(dec!(50000)));
        // past the TTL the new value is fetched
        clock.advance(30);
        assert_eq!(oracle.index_price("BTC-USD-PERP").await, Some(dec!(51000)));
    }

    #[tokio::test]
    async fn stale_fallback_on_upstream_failure() {
        let (oracle, feed, clock) = oracle_with(Some(dec!(50000)));
        assert_eq!(oracle.index_price("BTC-USD-PERP").await, Some(dec!(50000)));
        feed.set_price(None);
        clock.advance(120);
        // stale but served
        assert_eq!(oracle.index_price("BTC-USD-PERP").await, Some(dec!(50000)));
        // cleared cache plus dead upstream: nothing to serve
        oracle.invalidate("BTC-USD-PERP");
        assert_eq!(oracle.index_price("BTC-USD-PERP").await, None);
    }

    #[tokio::test]
    async fn never_cached_returns_none() {
        let (oracle, _feed, _clock) = oracle_with(None);
        assert_eq!(oracle.index_price("BTC-USD-PERP").await, None);
        let data = oracle.oracle_data("BTC-USD-PERP").await;
        assert!(data.index_price_usd.is_none());
        assert!(data.mark_price_usd.is_none());
    }

    #[tokio::test]
    async fn mark_equals_index() {
        let (oracle, _feed, _clock) = oracle_with(Some(dec!(42000)));
        assert_eq!(
            oracle.mark_price("BTC-USD-PERP").await,
            oracle.index_price("BTC-USD-PERP").await
        );
    }
}
