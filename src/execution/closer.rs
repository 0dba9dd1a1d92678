use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::fees::{order_fee_in_quote, ESTIMATED_FEE_RATE};
use super::lock::SymbolLock;
use super::quantize::executable_quantity;
use crate::api::MarketGateway;
use crate::db::Ledger;
use crate::error::{Outcome, Refusal};
use crate::models::{CloseUpdate, ExitReason, Side, SymbolRules, TradeRecord, TradeUpdate};
use crate::recovery::{self, PendingClose, RecoveryReason};
use crate::Result;

/// Realized (or previewed) result of closing a position
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CloseReport {
    pub trade_id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    /// Entry fee plus this close's fee
    pub fee_quote: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holding_period_ms: Option<i64>,
    pub reason: ExitReason,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_id: Option<i64>,
}

/// Gross P&L and P&L% of a long position, relative to entry notional
pub fn realized_pnl(entry_price: f64, exit_price: f64, quantity: f64) -> (f64, f64) {
    let pnl = (exit_price - entry_price) * quantity;
    let pnl_pct = if entry_price * quantity > 0.0 {
        (exit_price - entry_price) / entry_price * 100.0
    } else {
        0.0
    };
    (pnl, pnl_pct)
}

/// Capability to close a position live; handed to the exit evaluator
#[async_trait]
pub trait PositionExit: Send + Sync {
    async fn exit_position(
        &self,
        trade: &TradeRecord,
        reason: ExitReason,
    ) -> Result<Outcome<CloseReport>>;
}

/// Closes positions with one market sell, under a per-symbol lock
pub struct PositionCloser {
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<dyn Ledger>,
    lock_dir: PathBuf,
    lock_stale_after: Duration,
    quote_asset: String,
}

impl PositionCloser {
    pub fn new(
        gateway: Arc<dyn MarketGateway>,
        ledger: Arc<dyn Ledger>,
        lock_dir: PathBuf,
        lock_stale_after: Duration,
        quote_asset: &str,
    ) -> Self {
        Self {
            gateway,
            ledger,
            lock_dir,
            lock_stale_after,
            quote_asset: quote_asset.to_string(),
        }
    }

    /// Close the open position in `symbol`
    pub async fn sell(
        &self,
        symbol: &str,
        reason: Option<ExitReason>,
        dry_run: bool,
    ) -> Result<Outcome<CloseReport>> {
        match self.ledger.open_trade_for_symbol(symbol).await? {
            Some(trade) => self.close(&trade, reason, dry_run).await,
            None => Ok(Refusal::NoOpenPosition {
                target: symbol.to_string(),
            }
            .into()),
        }
    }

    /// Close a position by trade id
    pub async fn close_by_id(
        &self,
        trade_id: &str,
        reason: Option<ExitReason>,
        dry_run: bool,
    ) -> Result<Outcome<CloseReport>> {
        match self.ledger.trade(trade_id).await? {
            Some(trade) if trade.is_open => self.close(&trade, reason, dry_run).await,
            _ => Ok(Refusal::NoOpenPosition {
                target: trade_id.to_string(),
            }
            .into()),
        }
    }

    pub async fn close(
        &self,
        trade: &TradeRecord,
        reason: Option<ExitReason>,
        dry_run: bool,
    ) -> Result<Outcome<CloseReport>> {
        let symbol = trade.symbol.as_str();
        let reason = reason.unwrap_or(ExitReason::Manual);

        let quote = match self.gateway.price(symbol).await {
            Ok(quote) => quote,
            Err(e) => {
                return Ok(Refusal::PriceUnavailable {
                    symbol: symbol.to_string(),
                    detail: e.to_string(),
                }
                .into())
            }
        };

        if dry_run {
            let (pnl, pnl_pct) = realized_pnl(trade.entry_price, quote.price, trade.quantity);
            let estimated_fee = trade.value_at(quote.price) * ESTIMATED_FEE_RATE;

            return Ok(Outcome::Success(CloseReport {
                trade_id: trade.trade_id.clone(),
                symbol: symbol.to_string(),
                entry_price: trade.entry_price,
                exit_price: quote.price,
                quantity: trade.quantity,
                pnl,
                pnl_pct,
                fee_quote: trade.fee_quote + estimated_fee,
                holding_period_ms: None,
                reason,
                dry_run: true,
                recovery_id: None,
            }));
        }

        // Live close: one writer per symbol; released when `_lock` drops
        let Some(_lock) = SymbolLock::acquire(&self.lock_dir, symbol, self.lock_stale_after)? else {
            return Ok(Refusal::LockContended {
                symbol: symbol.to_string(),
            }
            .into());
        };

        // Another process may have closed it before we got the lock
        match self.ledger.trade(&trade.trade_id).await? {
            Some(current) if current.is_open => {}
            _ => {
                return Ok(Refusal::NoOpenPosition {
                    target: trade.trade_id.clone(),
                }
                .into())
            }
        }

        let rules = match self.gateway.symbol_rules(symbol).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!("No trading rules for {} ({}), using fallback", symbol, e);
                SymbolRules::fallback(symbol)
            }
        };
        let quantity = executable_quantity(&rules, trade.quantity)?;

        let fill = match self.gateway.market_order(symbol, Side::Sell, quantity).await {
            Ok(fill) => fill,
            Err(e) => {
                return Ok(Refusal::OrderFailed {
                    side: Side::Sell.to_string(),
                    detail: e.to_string(),
                }
                .into())
            }
        };

        let Some(exit_price) = fill.average_price() else {
            return Ok(Refusal::EmptyFill {
                side: Side::Sell.to_string(),
            }
            .into());
        };

        let exit_fee = order_fee_in_quote(self.gateway.as_ref(), &fill, &self.quote_asset).await;
        let fee_quote = trade.fee_quote + exit_fee;
        let (pnl, pnl_pct) = realized_pnl(trade.entry_price, exit_price, trade.quantity);

        let closed_at = Utc::now();
        let holding_period_ms = (closed_at - trade.opened_at).num_milliseconds();

        tracing::info!(
            "SELL {} {} @ ${:.4} ({}): P&L ${:.2} ({:+.2}%)",
            fill.executed_qty,
            symbol,
            exit_price,
            reason,
            pnl,
            pnl_pct
        );

        let update = TradeUpdate::Close(CloseUpdate {
            exit_price,
            closed_at,
            pnl,
            pnl_pct,
            fee_quote,
            exit_reason: reason.clone(),
            holding_period_ms,
        });

        // The sell is committed; a failed write is owed, not an error
        let recovery_id = match self.ledger.update_trade(&trade.trade_id, &update).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Trade {} sold but not recorded: {}", trade.trade_id, e);
                let pending = PendingClose {
                    trade_id: trade.trade_id.clone(),
                    update,
                };
                recovery::enqueue(
                    self.ledger.as_ref(),
                    RecoveryReason::PostSellPersistenceFailure,
                    &pending,
                )
                .await
            }
        };

        Ok(Outcome::Success(CloseReport {
            trade_id: trade.trade_id.clone(),
            symbol: symbol.to_string(),
            entry_price: trade.entry_price,
            exit_price,
            quantity: fill.executed_qty,
            pnl,
            pnl_pct,
            fee_quote,
            holding_period_ms: Some(holding_period_ms),
            reason,
            dry_run: false,
            recovery_id,
        }))
    }
}

#[async_trait]
impl PositionExit for PositionCloser {
    async fn exit_position(
        &self,
        trade: &TradeRecord,
        reason: ExitReason,
    ) -> Result<Outcome<CloseReport>> {
        self.close(trade, Some(reason), false).await
    }
}
