use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(Error::InvalidSide(s.to_string())),
        }
    }
}

/// Only long positions are held
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Long,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
        }
    }
}

/// Why a position was closed
///
/// Free-form tags from the operator are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    Manual,
    Other(String),
}

impl ExitReason {
    pub fn as_str(&self) -> &str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::Manual => "manual_close",
            ExitReason::Other(tag) => tag,
        }
    }
}

impl From<String> for ExitReason {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "STOP_LOSS" => ExitReason::StopLoss,
            "TRAILING_STOP" => ExitReason::TrailingStop,
            "manual_close" => ExitReason::Manual,
            _ => ExitReason::Other(tag),
        }
    }
}

impl From<ExitReason> for String {
    fn from(reason: ExitReason) -> Self {
        reason.as_str().to_string()
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger entry for a held or formerly held asset quantity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub direction: Direction,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub total_value: f64,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub fee_quote: f64,
    pub stop_loss: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
    pub highest_price: f64, // High-water mark for the trailing stop
    pub entry_tag: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub atr: Option<f64>,
    pub is_open: bool,
    pub holding_period_ms: Option<i64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TradeRecord {
    pub fn entry_notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    pub fn value_at(&self, price: f64) -> f64 {
        price * self.quantity
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.value_at(price) - self.entry_notional()
    }

    /// Trailing percent when trailing is configured for this position
    pub fn active_trailing_pct(&self) -> Option<f64> {
        self.trailing_stop_pct.filter(|pct| *pct > 0.0)
    }
}

/// Terminal fields written when a position closes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseUpdate {
    pub exit_price: f64,
    pub closed_at: DateTime<Utc>,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub fee_quote: f64,
    pub exit_reason: ExitReason,
    pub holding_period_ms: i64,
}

/// Partial update applied to a ledger row, keyed by trade id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeUpdate {
    /// Raise the high-water mark and trailing stop (never lowers either)
    Ratchet {
        highest_price: f64,
        trailing_stop_price: f64,
    },
    /// OPEN -> CLOSED transition
    Close(CloseUpdate),
}

/// Price lookup result
///
/// `degraded` marks a value served from cache after the live fetch failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub degraded: bool,
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
    pub total: f64,
}

/// Account balances as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AccountSnapshot {
    pub balances: Vec<Balance>,
    #[serde(default)]
    pub degraded: bool,
}

impl AccountSnapshot {
    /// Free balance for an asset (0 if absent)
    pub fn free(&self, asset: &str) -> f64 {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(0.0)
    }

    /// Map of asset -> total (free + locked)
    pub fn totals(&self) -> HashMap<String, f64> {
        self.balances
            .iter()
            .map(|b| (b.asset.clone(), b.total))
            .collect()
    }
}

/// Single execution within a market order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    pub commission_asset: String,
}

/// Exchange response to a market order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderFill {
    pub order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub executed_qty: f64,
    pub cumulative_quote: f64,
    pub fills: Vec<Fill>,
}

impl OrderFill {
    /// Quote spent (or received) per unit filled
    pub fn average_price(&self) -> Option<f64> {
        if self.executed_qty > 0.0 {
            Some(self.cumulative_quote / self.executed_qty)
        } else {
            None
        }
    }
}

/// Venue trading rules for a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolRules {
    pub symbol: String,
    pub step_size: f64,
    pub min_notional: f64,
    pub min_qty: f64,
}

impl SymbolRules {
    /// Rules used when the venue does not publish filters for a symbol
    pub fn fallback(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            step_size: 0.00001,
            min_notional: 10.0,
            min_qty: 0.00001,
        }
    }
}
