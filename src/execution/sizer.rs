use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use super::fees::{order_fee_in_quote, ESTIMATED_FEE_RATE};
use super::quantize::executable_quantity;
use crate::api::MarketGateway;
use crate::config::{ConfigKey, ConfigResolver, StopLossType, TradingDefaults};
use crate::db::Ledger;
use crate::error::{Outcome, Refusal};
use crate::indicators::calculate_atr;
use crate::models::{Direction, Side, SymbolRules, TradeRecord};
use crate::portfolio::Portfolio;
use crate::recovery::{self, RecoveryReason};
use crate::risk::HaltSwitch;
use crate::Result;

/// Request to open a long position
#[derive(Debug, Clone, Default)]
pub struct BuyRequest {
    pub symbol: String,
    pub allocation: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
    pub entry_tag: Option<String>,
    pub dry_run: bool,
}

impl BuyRequest {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ..Self::default()
        }
    }
}

/// Resolved sizing limits for one buy
#[derive(Debug, Clone, PartialEq)]
pub struct SizingParams {
    pub allocation: f64,     // Fraction of equity
    pub risk_per_trade: f64, // Multiplier on the target
    pub max_exposure: f64,
    pub max_capital: f64,    // Hard ceiling, quote currency
    pub cash_buffer: f64,
    pub minimum: f64,        // Smallest tradeable notional
}

/// Notional to spend, or why nothing should be bought
pub fn target_notional(
    params: &SizingParams,
    equity: f64,
    crypto_value: f64,
    free_quote: f64,
) -> std::result::Result<f64, Refusal> {
    if equity <= 0.0 {
        return Err(Refusal::NoEquity);
    }

    let exposure = crypto_value / equity;
    let headroom = (params.max_exposure - exposure).max(0.0);
    if headroom <= 0.0 {
        return Err(Refusal::ExposureLimit {
            exposure_pct: exposure * 100.0,
            max_pct: params.max_exposure * 100.0,
        });
    }

    let target = (params.allocation * equity).min(headroom * equity);
    let mut amount = (target * params.risk_per_trade).min(params.max_capital);

    if amount > free_quote {
        amount = free_quote * (1.0 - params.cash_buffer);
    }

    if amount < params.minimum {
        return Err(Refusal::BelowMinimum {
            amount,
            minimum: params.minimum,
        });
    }

    Ok(amount)
}

/// Stop placement relative to an entry price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopPolicy {
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    /// ATR x multiplier, when volatility stops are selected and ATR is known
    pub atr_distance: Option<f64>,
}

impl StopPolicy {
    pub fn stop_loss(&self, entry: f64) -> f64 {
        match self.atr_distance {
            Some(distance) => entry - distance,
            None => entry * (1.0 - self.stop_loss_pct),
        }
    }

    pub fn trailing_stop(&self, entry: f64) -> Option<f64> {
        (self.trailing_stop_pct > 0.0).then(|| entry * (1.0 - self.trailing_stop_pct))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SizingPlan {
    pub symbol: String,
    pub equity: f64,
    pub free_quote: f64,
    pub exposure_pct: f64,
    pub allocation: f64,
    pub notional: f64,
    pub price: f64,
    pub price_degraded: bool,
    pub quantity: f64,
    pub stop_loss_type: StopLossType,
    pub stop_loss: f64,
    pub trailing_stop_price: Option<f64>,
    pub trailing_stop_pct: f64,
    pub atr: Option<f64>,
    pub estimated_fee: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyReport {
    pub dry_run: bool,
    pub plan: SizingPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<TradeRecord>,
    /// Set when the fill could not be recorded and was queued for replay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_id: Option<i64>,
}

/// Sizes a buy against the risk budget and executes it as one market order
pub struct PositionSizer {
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<dyn Ledger>,
    resolver: ConfigResolver,
    halt: HaltSwitch,
    portfolio: Portfolio,
    quote_asset: String,
}

impl PositionSizer {
    pub fn new(
        gateway: Arc<dyn MarketGateway>,
        ledger: Arc<dyn Ledger>,
        defaults: TradingDefaults,
        quote_asset: &str,
    ) -> Self {
        Self {
            resolver: ConfigResolver::new(ledger.clone(), defaults),
            halt: HaltSwitch::new(ledger.clone()),
            portfolio: Portfolio::new(gateway.clone(), ledger.clone(), quote_asset),
            gateway,
            ledger,
            quote_asset: quote_asset.to_string(),
        }
    }

    pub async fn buy(&self, request: &BuyRequest) -> Result<Outcome<BuyReport>> {
        let symbol = request.symbol.as_str();

        // Check 1: Halted?
        if self.halt.is_halted().await? {
            return Ok(Refusal::Halted.into());
        }

        // Check 2: Already holding this symbol?
        if self.ledger.open_trade_for_symbol(symbol).await?.is_some() {
            return Ok(Refusal::PositionExists {
                symbol: symbol.to_string(),
            }
            .into());
        }

        // Resolve parameters: call override > persisted override > default
        let r = &self.resolver;
        let allocation = r.number(ConfigKey::DefaultAllocation, request.allocation).await?;
        let stop_loss_pct = r.number(ConfigKey::DefaultStopLossPct, request.stop_loss_pct).await?;
        let trailing_stop_pct = r
            .number(ConfigKey::DefaultTrailingStopPct, request.trailing_stop_pct)
            .await?;

        let rules = self.rules(symbol).await;
        let params = SizingParams {
            allocation,
            risk_per_trade: r.number(ConfigKey::RiskPerTrade, None).await?,
            max_exposure: r.number(ConfigKey::MaxPortfolioExposure, None).await?,
            max_capital: r.number(ConfigKey::MaxCapitalAtRisk, None).await?,
            cash_buffer: r.number(ConfigKey::CashBuffer, None).await?,
            minimum: r
                .number(ConfigKey::MinTradeUsdt, None)
                .await?
                .max(rules.min_notional),
        };

        // Equity and exposure
        let snapshot = match self.portfolio.snapshot().await? {
            Outcome::Success(snapshot) => snapshot,
            Outcome::Refused(refusal) => return Ok(refusal.into()),
        };

        let notional = match target_notional(
            &params,
            snapshot.total_equity,
            snapshot.crypto_value,
            snapshot.free_quote,
        ) {
            Ok(notional) => notional,
            Err(refusal) => return Ok(refusal.into()),
        };

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
        if quote.degraded {
            tracing::warn!("Sizing {} from a cached price ({})", symbol, quote.price);
        }

        let quantity = executable_quantity(&rules, notional / quote.price)?;

        // Stop levels
        let stop_loss_type = r.stop_loss_type().await?;
        let atr = match stop_loss_type {
            StopLossType::Atr => self.atr(symbol).await,
            StopLossType::Fixed => None,
        };
        let atr_distance = match atr {
            Some(atr) => Some(atr * r.number(ConfigKey::StopLossAtrMultiplier, None).await?),
            None => None,
        };
        let policy = StopPolicy {
            stop_loss_pct,
            trailing_stop_pct,
            atr_distance,
        };

        let plan = SizingPlan {
            symbol: symbol.to_string(),
            equity: snapshot.total_equity,
            free_quote: snapshot.free_quote,
            exposure_pct: snapshot.exposure_pct,
            allocation,
            notional,
            price: quote.price,
            price_degraded: quote.degraded,
            quantity,
            stop_loss_type,
            stop_loss: policy.stop_loss(quote.price),
            trailing_stop_price: policy.trailing_stop(quote.price),
            trailing_stop_pct,
            atr,
            estimated_fee: notional * ESTIMATED_FEE_RATE,
        };

        if request.dry_run {
            tracing::info!(
                "DRY RUN: would buy {} {} @ ${:.4} (${:.2})",
                quantity,
                symbol,
                quote.price,
                notional
            );
            return Ok(Outcome::Success(BuyReport {
                dry_run: true,
                plan,
                trade: None,
                recovery_id: None,
            }));
        }

        // Live order
        let fill = match self.gateway.market_order(symbol, Side::Buy, quantity).await {
            Ok(fill) => fill,
            Err(e) => {
                return Ok(Refusal::OrderFailed {
                    side: Side::Buy.to_string(),
                    detail: e.to_string(),
                }
                .into())
            }
        };

        let Some(entry_price) = fill.average_price() else {
            return Ok(Refusal::EmptyFill {
                side: Side::Buy.to_string(),
            }
            .into());
        };

        let fee = order_fee_in_quote(self.gateway.as_ref(), &fill, &self.quote_asset).await;
        let now = Utc::now();

        // Stops follow the actual fill, not the pre-order price
        let trade = TradeRecord {
            trade_id: fill
                .order_id
                .clone()
                .unwrap_or_else(|| format!("UNKNOWN_{}", now.timestamp_millis())),
            symbol: symbol.to_string(),
            side: Side::Buy,
            direction: Direction::Long,
            quantity: fill.executed_qty,
            entry_price,
            exit_price: None,
            total_value: fill.cumulative_quote,
            pnl: None,
            pnl_pct: None,
            fee_quote: fee,
            stop_loss: Some(policy.stop_loss(entry_price)),
            trailing_stop_price: policy.trailing_stop(entry_price),
            trailing_stop_pct: Some(trailing_stop_pct),
            highest_price: entry_price,
            entry_tag: request.entry_tag.clone(),
            exit_reason: None,
            atr,
            is_open: true,
            holding_period_ms: None,
            opened_at: now,
            closed_at: None,
            created_at: Some(now),
            updated_at: Some(now),
        };

        tracing::info!(
            "BUY {} {} @ ${:.4} (${:.2}, fee ${:.4}, stop ${:.4})",
            trade.quantity,
            symbol,
            entry_price,
            trade.total_value,
            fee,
            policy.stop_loss(entry_price)
        );

        // The order is committed; a failed write is owed, not an error
        let recovery_id = match self.ledger.insert_trade(&trade).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Trade {} filled but not recorded: {}", trade.trade_id, e);
                recovery::enqueue(
                    self.ledger.as_ref(),
                    RecoveryReason::PostBuyPersistenceFailure,
                    &trade,
                )
                .await
            }
        };

        Ok(Outcome::Success(BuyReport {
            dry_run: false,
            plan,
            trade: Some(trade),
            recovery_id,
        }))
    }

    async fn rules(&self, symbol: &str) -> SymbolRules {
        match self.gateway.symbol_rules(symbol).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!("No trading rules for {} ({}), using fallback", symbol, e);
                SymbolRules::fallback(symbol)
            }
        }
    }

    async fn atr(&self, symbol: &str) -> Option<f64> {
        let defaults = self.resolver.defaults();
        let period = defaults.atr_period;

        match self
            .gateway
            .candles(symbol, &defaults.atr_interval, period + 1)
            .await
        {
            Ok(candles) => {
                let atr = calculate_atr(&candles, period);
                if atr.is_none() {
                    tracing::warn!(
                        "Only {} candles for {}, falling back to percent stop",
                        candles.len(),
                        symbol
                    );
                }
                atr
            }
            Err(e) => {
                tracing::warn!("No candles for {} ({}), falling back to percent stop", symbol, e);
                None
            }
        }
    }
}
