pub mod sqlite;

pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{TradeRecord, TradeUpdate};
use crate::Result;

/// Filter for trade history queries (newest first)
#[derive(Debug, Clone, Default)]
pub struct TradeQuery {
    pub symbol: Option<String>,
    pub open_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// A local write owed after an exchange order already committed
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecoveryItem {
    pub id: i64,
    pub payload: serde_json::Value,
    pub reason: String,
    pub resolved: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Durable store shared by every component: trades, config overrides and
/// the recovery queue
#[async_trait]
pub trait Ledger: Send + Sync {
    // Trades
    async fn insert_trade(&self, trade: &TradeRecord) -> Result<()>;

    /// Apply a partial update to an OPEN trade
    ///
    /// Updating an already-closed trade is a no-op; an unknown id is
    /// `Error::NotFound`.
    async fn update_trade(&self, trade_id: &str, update: &TradeUpdate) -> Result<()>;

    async fn trade(&self, trade_id: &str) -> Result<Option<TradeRecord>>;
    async fn open_trade_for_symbol(&self, symbol: &str) -> Result<Option<TradeRecord>>;
    async fn open_trades(&self) -> Result<Vec<TradeRecord>>;
    async fn trades(&self, query: &TradeQuery) -> Result<Vec<TradeRecord>>;

    /// Closed trades, optionally closed after `since`, oldest first
    async fn closed_trades(
        &self,
        since: Option<DateTime<Utc>>,
        symbol: Option<&str>,
    ) -> Result<Vec<TradeRecord>>;

    // Config overrides
    async fn config_value(&self, key: &str) -> Result<Option<String>>;
    async fn set_config_value(&self, key: &str, value: &str) -> Result<()>;
    async fn delete_config_value(&self, key: &str) -> Result<bool>;
    async fn config_values(&self) -> Result<BTreeMap<String, String>>;

    // Recovery queue
    async fn push_recovery(&self, reason: &str, payload: &serde_json::Value) -> Result<i64>;

    /// Unresolved items, oldest first
    async fn pending_recovery(&self) -> Result<Vec<RecoveryItem>>;
    async fn resolve_recovery(&self, id: i64) -> Result<bool>;
    async fn note_recovery_failure(&self, id: i64, error: &str) -> Result<()>;
    async fn discard_recovery(&self, id: i64) -> Result<bool>;
}
