use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{GatewayError, MarketGateway};
use crate::config::CacheSettings;
use crate::models::{AccountSnapshot, Candle, OrderFill, PriceQuote, Side, SymbolRules};
use crate::persistence::{CachedEntry, Freshness, SnapshotCache};

const ACCOUNT_KEY: &str = "account";

/// Market gateway with TTL caching and bounded stale fallback
///
/// A fresh cached value is served without a live call. When the live call
/// fails, a value younger than `stale_max_age_secs` is served instead and
/// tagged degraded. Symbol rules are additionally memoized in-process on
/// first access.
pub struct CachedGateway {
    inner: Arc<dyn MarketGateway>,
    cache: Arc<dyn SnapshotCache>,
    settings: CacheSettings,
    rules: RwLock<HashMap<String, SymbolRules>>,
}

impl CachedGateway {
    pub fn new(
        inner: Arc<dyn MarketGateway>,
        cache: Arc<dyn SnapshotCache>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            inner,
            cache,
            settings,
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the value and whether it came from the stale fallback
    async fn fetch<T, F>(&self, key: &str, ttl_secs: u64, live: F) -> Result<(T, bool), GatewayError>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T, GatewayError>>,
    {
        let now = Utc::now();
        let ttl = Duration::seconds(ttl_secs as i64);
        let stale_max = Duration::seconds(self.settings.stale_max_age_secs as i64);

        let cached = match self.cache.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Cache read for {} failed: {}", key, e);
                None
            }
        };

        if let Some(entry) = &cached {
            if entry.freshness(now, ttl, stale_max) == Freshness::Fresh {
                if let Ok(value) = serde_json::from_value(entry.value.clone()) {
                    return Ok((value, false));
                }
            }
        }

        match live.await {
            Ok(value) => {
                match serde_json::to_value(&value) {
                    Ok(json) => {
                        if let Err(e) = self.cache.set(key, &CachedEntry::new(json)).await {
                            tracing::warn!("Cache write for {} failed: {}", key, e);
                        }
                    }
                    Err(e) => tracing::warn!("Cannot serialize {} for cache: {}", key, e),
                }
                Ok((value, false))
            }
            Err(e) => {
                let fallback = cached
                    .filter(|entry| entry.freshness(now, ttl, stale_max) != Freshness::Expired)
                    .and_then(|entry| {
                        let age = now - entry.stored_at;
                        serde_json::from_value::<T>(entry.value)
                            .ok()
                            .map(|value| (value, age))
                    });

                match fallback {
                    Some((value, age)) => {
                        tracing::warn!(
                            "Live fetch for {} failed ({}), serving cached value {}s old",
                            key,
                            e,
                            age.num_seconds()
                        );
                        Ok((value, true))
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Drop the cached account snapshot (balances change after an order)
    pub async fn invalidate_account(&self) {
        if let Err(e) = self.cache.remove(ACCOUNT_KEY).await {
            tracing::warn!("Cannot invalidate cached account: {}", e);
        }
    }
}

#[async_trait]
impl MarketGateway for CachedGateway {
    async fn price(&self, symbol: &str) -> Result<PriceQuote, GatewayError> {
        let key = format!("price:{}", symbol);
        let (mut quote, degraded): (PriceQuote, bool) = self
            .fetch(&key, self.settings.price_ttl_secs, self.inner.price(symbol))
            .await?;

        quote.degraded = degraded;
        Ok(quote)
    }

    async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let key = format!("candles:{}:{}:{}", symbol, interval, limit);
        let (candles, _) = self
            .fetch(
                &key,
                self.settings.candles_ttl_secs,
                self.inner.candles(symbol, interval, limit),
            )
            .await?;

        Ok(candles)
    }

    async fn account(&self) -> Result<AccountSnapshot, GatewayError> {
        let (mut account, degraded): (AccountSnapshot, bool) = self
            .fetch(ACCOUNT_KEY, self.settings.account_ttl_secs, self.inner.account())
            .await?;

        account.degraded = degraded;
        Ok(account)
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderFill, GatewayError> {
        let result = self.inner.market_order(symbol, side, quantity).await;

        // Balances may have moved even if the response was lost
        self.invalidate_account().await;

        result
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, GatewayError> {
        if let Some(rules) = self.rules.read().await.get(symbol) {
            return Ok(rules.clone());
        }

        let key = format!("rules:{}", symbol);
        let (rules, degraded): (SymbolRules, bool) = self
            .fetch(
                &key,
                self.settings.symbol_rules_ttl_secs,
                self.inner.symbol_rules(symbol),
            )
            .await?;

        if !degraded {
            self.rules
                .write()
                .await
                .insert(symbol.to_string(), rules.clone());
        }

        Ok(rules)
    }
}
