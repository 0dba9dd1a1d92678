use serde::Serialize;
use std::sync::Arc;

use super::HaltSwitch;
use crate::api::MarketGateway;
use crate::config::{ConfigKey, ConfigResolver, StopLossType};
use crate::db::Ledger;
use crate::portfolio::Portfolio;
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct PositionRisk {
    pub trade_id: String,
    pub symbol: String,
    pub current_price: f64,
    pub price_is_fallback: bool,
    pub value: f64,
    pub stop_loss: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub highest_price: f64,
    /// How far price can fall before the fixed stop, as % of price
    pub distance_to_stop_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub halted: bool,
    pub open_positions: usize,
    pub total_equity: f64,
    pub crypto_value: f64,
    pub free_quote: f64,
    /// Balances could not be fetched; equity counts positions only
    pub account_unavailable: bool,
    pub exposure_pct: f64,
    pub max_exposure_pct: f64,
    pub stop_loss_type: StopLossType,
    pub default_stop_loss_pct: f64,
    pub default_trailing_stop_pct: f64,
    pub enable_trailing_stops: bool,
    pub positions: Vec<PositionRisk>,
}

/// Risk dashboard: exposure, stop distances, halt state and effective limits
///
/// Read-only; a failed balance lookup degrades the report instead of
/// failing it.
pub async fn risk_status(
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<dyn Ledger>,
    resolver: &ConfigResolver,
    quote_asset: &str,
) -> Result<RiskStatus> {
    let halted = HaltSwitch::new(ledger.clone()).is_halted().await?;
    let portfolio = Portfolio::new(gateway.clone(), ledger, quote_asset);

    let positions: Vec<PositionRisk> = portfolio
        .positions()
        .await?
        .into_iter()
        .map(|p| PositionRisk {
            distance_to_stop_pct: p
                .trade
                .stop_loss
                .filter(|_| p.current_price > 0.0)
                .map(|stop| (p.current_price - stop) / p.current_price * 100.0),
            trade_id: p.trade.trade_id,
            symbol: p.trade.symbol,
            current_price: p.current_price,
            price_is_fallback: p.price_is_fallback,
            value: p.current_value,
            stop_loss: p.trade.stop_loss,
            trailing_stop_price: p.trade.trailing_stop_price,
            highest_price: p.trade.highest_price,
        })
        .collect();

    let (free_quote, account_unavailable) = match gateway.account().await {
        Ok(account) => (account.free(quote_asset), false),
        Err(e) => {
            tracing::warn!("Risk status without balances: {}", e);
            (0.0, true)
        }
    };

    let crypto_value: f64 = positions.iter().map(|p| p.value).sum();
    let total_equity = free_quote + crypto_value;
    let exposure_pct = if total_equity > 0.0 {
        crypto_value / total_equity * 100.0
    } else {
        0.0
    };

    Ok(RiskStatus {
        halted,
        open_positions: positions.len(),
        total_equity,
        crypto_value,
        free_quote,
        account_unavailable,
        exposure_pct,
        max_exposure_pct: resolver.number(ConfigKey::MaxPortfolioExposure, None).await? * 100.0,
        stop_loss_type: resolver.stop_loss_type().await?,
        default_stop_loss_pct: resolver.number(ConfigKey::DefaultStopLossPct, None).await? * 100.0,
        default_trailing_stop_pct: resolver
            .number(ConfigKey::DefaultTrailingStopPct, None)
            .await?
            * 100.0,
        enable_trailing_stops: resolver.flag(ConfigKey::EnableTrailingStops).await?,
        positions,
    })
}
