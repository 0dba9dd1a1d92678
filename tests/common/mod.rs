#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spotguard::db::{Ledger, RecoveryItem, SqliteLedger, TradeQuery};
use spotguard::execution::PositionCloser;
use spotguard::{
    AccountSnapshot, Balance, Candle, Direction, Error, Fill, GatewayError, MarketGateway,
    OrderFill, PriceQuote, Result, Side, SymbolRules, TradeRecord, TradeUpdate,
};

// ============================================================================
// Scripted exchange
// ============================================================================

/// In-process exchange: fixed prices, fixed balances, fills at the last price
#[derive(Default)]
pub struct FakeGateway {
    prices: Mutex<HashMap<String, f64>>,
    candles: Mutex<HashMap<String, Vec<Candle>>>,
    balances: Mutex<Vec<Balance>>,
    orders: Mutex<Vec<(String, Side, f64)>>,
    next_order_id: AtomicU64,
    fail_account: AtomicBool,
    fail_orders: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.lock().unwrap().insert(symbol.to_string(), candles);
    }

    pub fn set_balance(&self, asset: &str, total: f64) {
        let mut balances = self.balances.lock().unwrap();
        balances.retain(|b| b.asset != asset);
        balances.push(Balance {
            asset: asset.to_string(),
            free: total,
            locked: 0.0,
            total,
        });
    }

    pub fn fail_account(&self, fail: bool) {
        self.fail_account.store(fail, Ordering::SeqCst);
    }

    pub fn fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<(String, Side, f64)> {
        self.orders.lock().unwrap().clone()
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }
}

#[async_trait]
impl MarketGateway for FakeGateway {
    async fn price(&self, symbol: &str) -> std::result::Result<PriceQuote, GatewayError> {
        match self.prices.lock().unwrap().get(symbol) {
            Some(price) => Ok(PriceQuote {
                symbol: symbol.to_string(),
                price: *price,
                degraded: false,
            }),
            None => Err(GatewayError::Rejected {
                code: -1121,
                message: "Invalid symbol.".to_string(),
            }),
        }
    }

    async fn candles(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Candle>, GatewayError> {
        match self.candles.lock().unwrap().get(symbol) {
            Some(candles) => Ok(candles[candles.len().saturating_sub(limit)..].to_vec()),
            None => Err(GatewayError::Unavailable("candles".to_string())),
        }
    }

    async fn account(&self) -> std::result::Result<AccountSnapshot, GatewayError> {
        if self.fail_account.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout("account".to_string()));
        }
        Ok(AccountSnapshot {
            balances: self.balances.lock().unwrap().clone(),
            degraded: false,
        })
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> std::result::Result<OrderFill, GatewayError> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                code: -2010,
                message: "Account has insufficient balance for requested action.".to_string(),
            });
        }

        let price = self.price(symbol).await?.price;
        self.orders
            .lock()
            .unwrap()
            .push((symbol.to_string(), side, quantity));
        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(OrderFill {
            order_id: Some(order_id.to_string()),
            symbol: symbol.to_string(),
            side,
            executed_qty: quantity,
            cumulative_quote: quantity * price,
            fills: vec![Fill {
                price,
                quantity,
                commission: 0.0,
                commission_asset: "USDT".to_string(),
            }],
        })
    }

    async fn symbol_rules(&self, symbol: &str) -> std::result::Result<SymbolRules, GatewayError> {
        Ok(SymbolRules {
            symbol: symbol.to_string(),
            step_size: 0.001,
            min_notional: 5.0,
            min_qty: 0.001,
        })
    }
}

// ============================================================================
// Failure-injecting ledger
// ============================================================================

/// SQLite ledger whose trade writes can be made to fail on demand
pub struct FailingLedger {
    inner: SqliteLedger,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
}

impl FailingLedger {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteLedger::in_memory().await.unwrap(),
            fail_inserts: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
        })
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

fn disk_error() -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk I/O error"))
}

#[async_trait]
impl Ledger for FailingLedger {
    async fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(disk_error());
        }
        self.inner.insert_trade(trade).await
    }

    async fn update_trade(&self, trade_id: &str, update: &TradeUpdate) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(disk_error());
        }
        self.inner.update_trade(trade_id, update).await
    }

    async fn trade(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        self.inner.trade(trade_id).await
    }

    async fn open_trade_for_symbol(&self, symbol: &str) -> Result<Option<TradeRecord>> {
        self.inner.open_trade_for_symbol(symbol).await
    }

    async fn open_trades(&self) -> Result<Vec<TradeRecord>> {
        self.inner.open_trades().await
    }

    async fn trades(&self, query: &TradeQuery) -> Result<Vec<TradeRecord>> {
        self.inner.trades(query).await
    }

    async fn closed_trades(
        &self,
        since: Option<DateTime<Utc>>,
        symbol: Option<&str>,
    ) -> Result<Vec<TradeRecord>> {
        self.inner.closed_trades(since, symbol).await
    }

    async fn config_value(&self, key: &str) -> Result<Option<String>> {
        self.inner.config_value(key).await
    }

    async fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_config_value(key, value).await
    }

    async fn delete_config_value(&self, key: &str) -> Result<bool> {
        self.inner.delete_config_value(key).await
    }

    async fn config_values(&self) -> Result<BTreeMap<String, String>> {
        self.inner.config_values().await
    }

    async fn push_recovery(&self, reason: &str, payload: &serde_json::Value) -> Result<i64> {
        self.inner.push_recovery(reason, payload).await
    }

    async fn pending_recovery(&self) -> Result<Vec<RecoveryItem>> {
        self.inner.pending_recovery().await
    }

    async fn resolve_recovery(&self, id: i64) -> Result<bool> {
        self.inner.resolve_recovery(id).await
    }

    async fn note_recovery_failure(&self, id: i64, error: &str) -> Result<()> {
        self.inner.note_recovery_failure(id, error).await
    }

    async fn discard_recovery(&self, id: i64) -> Result<bool> {
        self.inner.discard_recovery(id).await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn open_trade(trade_id: &str, symbol: &str, entry_price: f64, quantity: f64) -> TradeRecord {
    TradeRecord {
        trade_id: trade_id.to_string(),
        symbol: symbol.to_string(),
        side: Side::Buy,
        direction: Direction::Long,
        quantity,
        entry_price,
        exit_price: None,
        total_value: entry_price * quantity,
        pnl: None,
        pnl_pct: None,
        fee_quote: 0.0,
        stop_loss: Some(entry_price * 0.95),
        trailing_stop_price: Some(entry_price * 0.97),
        trailing_stop_pct: Some(0.03),
        highest_price: entry_price,
        entry_tag: None,
        exit_reason: None,
        atr: None,
        is_open: true,
        holding_period_ms: None,
        opened_at: Utc::now(),
        closed_at: None,
        created_at: None,
        updated_at: None,
    }
}

/// Fresh lock directory per test
pub fn lock_dir() -> PathBuf {
    std::env::temp_dir().join(format!("spotguard-test-{}", uuid::Uuid::new_v4()))
}

/// Daily candles closing flat at `close` with a constant `range` high-to-low
pub fn flat_candles(count: usize, close: f64, range: f64) -> Vec<Candle> {
    let start = Utc::now() - chrono::Duration::days(count as i64);
    (0..count)
        .map(|day| {
            let open_time = start + chrono::Duration::days(day as i64);
            Candle {
                open_time,
                open: close,
                high: close + range / 2.0,
                low: close - range / 2.0,
                close,
                volume: 1000.0,
                close_time: open_time + chrono::Duration::days(1),
            }
        })
        .collect()
}

pub fn closer(gateway: Arc<FakeGateway>, ledger: Arc<dyn Ledger>) -> PositionCloser {
    closer_in(gateway, ledger, lock_dir())
}

pub fn closer_in(gateway: Arc<FakeGateway>, ledger: Arc<dyn Ledger>, dir: PathBuf) -> PositionCloser {
    PositionCloser::new(gateway, ledger, dir, Duration::from_secs(300), "USDT")
}
