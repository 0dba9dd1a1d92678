use serde::Serialize;
use std::sync::Arc;

use crate::api::MarketGateway;
use crate::db::Ledger;
use crate::error::{Outcome, Refusal};
use crate::models::TradeRecord;
use crate::Result;

/// Open position marked to market
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub trade: TradeRecord,
    pub current_price: f64,
    /// Live price unavailable; valued at entry price
    pub price_is_fallback: bool,
    pub current_value: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub free_quote: f64,
    pub total_equity: f64,
    pub crypto_value: f64,
    pub exposure_pct: f64,
    pub open_count: usize,
    pub total_unrealized_pnl: f64,
    /// Balances came from the stale cache
    pub degraded: bool,
    pub positions: Vec<PositionView>,
}

impl PortfolioSnapshot {
    /// Crypto value / equity as a fraction (0 with no equity)
    pub fn exposure(&self) -> f64 {
        if self.total_equity > 0.0 {
            self.crypto_value / self.total_equity
        } else {
            0.0
        }
    }
}

/// Equity = free quote balance + open positions at current price
pub struct Portfolio {
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<dyn Ledger>,
    quote_asset: String,
}

impl Portfolio {
    pub fn new(gateway: Arc<dyn MarketGateway>, ledger: Arc<dyn Ledger>, quote_asset: &str) -> Self {
        Self {
            gateway,
            ledger,
            quote_asset: quote_asset.to_string(),
        }
    }

    pub async fn snapshot(&self) -> Result<Outcome<PortfolioSnapshot>> {
        let account = match self.gateway.account().await {
            Ok(account) => account,
            Err(e) => {
                return Ok(Refusal::AccountUnavailable {
                    detail: e.to_string(),
                }
                .into())
            }
        };
        let free_quote = account.free(&self.quote_asset);

        let positions = self.positions().await?;

        let crypto_value: f64 = positions.iter().map(|p| p.current_value).sum();
        let total_unrealized_pnl = positions.iter().map(|p| p.unrealized_pnl).sum();
        let total_equity = free_quote + crypto_value;
        let exposure_pct = if total_equity > 0.0 {
            crypto_value / total_equity * 100.0
        } else {
            0.0
        };

        Ok(Outcome::Success(PortfolioSnapshot {
            free_quote,
            total_equity,
            crypto_value,
            exposure_pct,
            open_count: positions.len(),
            total_unrealized_pnl,
            degraded: account.degraded,
            positions,
        }))
    }

    /// Open positions marked to market, entry price when unpriceable
    pub async fn positions(&self) -> Result<Vec<PositionView>> {
        let mut positions = Vec::new();
        for trade in self.ledger.open_trades().await? {
            positions.push(self.mark(trade).await);
        }
        Ok(positions)
    }

    async fn mark(&self, trade: TradeRecord) -> PositionView {
        let (current_price, price_is_fallback) = match self.gateway.price(&trade.symbol).await {
            Ok(quote) => (quote.price, false),
            Err(e) => {
                tracing::warn!(
                    "No price for {} ({}), valuing at entry {}",
                    trade.symbol,
                    e,
                    trade.entry_price
                );
                (trade.entry_price, true)
            }
        };

        let current_value = trade.value_at(current_price);
        let unrealized_pnl = trade.unrealized_pnl(current_price);
        let entry_notional = trade.entry_notional();
        let unrealized_pnl_pct = if entry_notional > 0.0 {
            unrealized_pnl / entry_notional * 100.0
        } else {
            0.0
        };

        PositionView {
            trade,
            current_price,
            price_is_fallback,
            current_value,
            unrealized_pnl,
            unrealized_pnl_pct,
        }
    }
}
