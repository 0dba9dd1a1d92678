use serde::Serialize;
use std::sync::Arc;

use crate::api::MarketGateway;
use crate::config::{ConfigKey, ConfigResolver};
use crate::db::Ledger;
use crate::error::Outcome;
use crate::execution::{CloseReport, PositionExit};
use crate::models::{ExitReason, TradeRecord, TradeUpdate};
use crate::Result;

/// New high-water mark and trailing stop written during a check
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Ratchet {
    pub highest_price: f64,
    pub trailing_stop_price: f64,
}

/// Outcome of checking one open position
#[derive(Debug, Clone, Serialize)]
pub struct PositionCheck {
    pub trade_id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub current_price: Option<f64>,
    pub price_degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratchet: Option<Ratchet>,
    pub closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ExitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close: Option<CloseReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PositionCheck {
    fn new(trade: &TradeRecord) -> Self {
        Self {
            trade_id: trade.trade_id.clone(),
            symbol: trade.symbol.clone(),
            entry_price: trade.entry_price,
            current_price: None,
            price_degraded: false,
            ratchet: None,
            closed: false,
            reason: None,
            trigger_price: None,
            close: None,
            error: None,
        }
    }

    fn failed(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitCheckReport {
    pub checked: usize,
    pub closed: usize,
    pub errors: usize,
    pub details: Vec<PositionCheck>,
}

/// Which stop, if any, the current price has crossed
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub ratchet: Option<Ratchet>,
    pub trigger: Option<(ExitReason, f64)>,
}

/// Pure stop logic for one position at `price`
///
/// The fixed stop wins over the trailing stop. A new high ratchets the
/// trailing stop up before the trailing check, so the freshest level is
/// used; the stop never moves down.
pub fn evaluate(trade: &TradeRecord, price: f64, trailing_enabled: bool) -> ExitDecision {
    if let Some(stop_loss) = trade.stop_loss.filter(|s| *s > 0.0) {
        if price <= stop_loss {
            return ExitDecision {
                ratchet: None,
                trigger: Some((ExitReason::StopLoss, stop_loss)),
            };
        }
    }

    let Some(trailing_pct) = trade.active_trailing_pct().filter(|_| trailing_enabled) else {
        return ExitDecision {
            ratchet: None,
            trigger: None,
        };
    };

    let high_water = if trade.highest_price > 0.0 {
        trade.highest_price
    } else {
        trade.entry_price
    };

    let ratchet = (price > high_water).then(|| {
        let raised = price * (1.0 - trailing_pct);
        Ratchet {
            highest_price: price,
            trailing_stop_price: trade.trailing_stop_price.map_or(raised, |s| s.max(raised)),
        }
    });

    let trailing_stop = ratchet
        .map(|r| r.trailing_stop_price)
        .or(trade.trailing_stop_price)
        .filter(|s| *s > 0.0);

    let trigger = trailing_stop
        .filter(|stop| price <= *stop)
        .map(|stop| (ExitReason::TrailingStop, stop));

    ExitDecision { ratchet, trigger }
}

/// Polls open positions, ratchets trailing stops and triggers live closes
pub struct ExitEvaluator {
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<dyn Ledger>,
    resolver: ConfigResolver,
    exit: Arc<dyn PositionExit>,
}

impl ExitEvaluator {
    pub fn new(
        gateway: Arc<dyn MarketGateway>,
        ledger: Arc<dyn Ledger>,
        resolver: ConfigResolver,
        exit: Arc<dyn PositionExit>,
    ) -> Self {
        Self {
            gateway,
            ledger,
            resolver,
            exit,
        }
    }

    /// Check every open position (or only `symbol`)
    ///
    /// A failure on one position is recorded in its detail and never stops
    /// the others from being checked.
    pub async fn check(&self, symbol: Option<&str>) -> Result<ExitCheckReport> {
        let trades: Vec<TradeRecord> = self
            .ledger
            .open_trades()
            .await?
            .into_iter()
            .filter(|t| symbol.map_or(true, |s| t.symbol == s))
            .collect();

        let trailing_enabled = self.resolver.flag(ConfigKey::EnableTrailingStops).await?;

        let mut details = Vec::with_capacity(trades.len());
        for trade in &trades {
            details.push(self.check_position(trade, trailing_enabled).await);
        }

        let errors = details.iter().filter(|d| d.error.is_some()).count();
        let closed = details.iter().filter(|d| d.closed).count();

        if closed > 0 || errors > 0 {
            tracing::info!(
                "Exit check: {} positions, {} closed, {} errors",
                details.len(),
                closed,
                errors
            );
        }

        Ok(ExitCheckReport {
            checked: details.len() - errors,
            closed,
            errors,
            details,
        })
    }

    async fn check_position(&self, trade: &TradeRecord, trailing_enabled: bool) -> PositionCheck {
        let mut detail = PositionCheck::new(trade);

        let quote = match self.gateway.price(&trade.symbol).await {
            Ok(quote) => quote,
            Err(e) => {
                tracing::warn!("Exit check skipped {}: {}", trade.symbol, e);
                return detail.failed(format!("Cannot fetch price for {}: {}", trade.symbol, e));
            }
        };
        detail.current_price = Some(quote.price);
        detail.price_degraded = quote.degraded;

        let decision = evaluate(trade, quote.price, trailing_enabled);

        // Persist the ratchet before acting on it
        if let Some(ratchet) = decision.ratchet {
            let update = TradeUpdate::Ratchet {
                highest_price: ratchet.highest_price,
                trailing_stop_price: ratchet.trailing_stop_price,
            };
            if let Err(e) = self.ledger.update_trade(&trade.trade_id, &update).await {
                return detail.failed(format!("Cannot persist trailing stop: {}", e));
            }

            tracing::info!(
                "{} new high ${:.4}, trailing stop raised to ${:.4}",
                trade.symbol,
                ratchet.highest_price,
                ratchet.trailing_stop_price
            );
            detail.ratchet = Some(ratchet);
        }

        let Some((reason, trigger_price)) = decision.trigger else {
            return detail;
        };

        tracing::warn!(
            "{} hit {} at ${:.4} (stop ${:.4})",
            trade.symbol,
            reason,
            quote.price,
            trigger_price
        );
        detail.reason = Some(reason.clone());
        detail.trigger_price = Some(trigger_price);

        match self.exit.exit_position(trade, reason).await {
            Ok(Outcome::Success(report)) => {
                detail.closed = true;
                detail.close = Some(report);
                detail
            }
            Ok(Outcome::Refused(refusal)) => detail.failed(refusal.to_string()),
            Err(e) => detail.failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Side};
    use chrono::Utc;

    fn trade(stop_loss: f64, trailing_stop: f64, highest: f64) -> TradeRecord {
        TradeRecord {
            trade_id: "1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            direction: Direction::Long,
            quantity: 1.0,
            entry_price: 100.0,
            exit_price: None,
            total_value: 100.0,
            pnl: None,
            pnl_pct: None,
            fee_quote: 0.0,
            stop_loss: Some(stop_loss),
            trailing_stop_price: Some(trailing_stop),
            trailing_stop_pct: Some(0.03),
            highest_price: highest,
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

    #[test]
    fn test_fixed_stop_triggers_first() {
        let decision = evaluate(&trade(95.0, 97.0, 100.0), 94.0, true);
        assert_eq!(decision.trigger, Some((ExitReason::StopLoss, 95.0)));
        assert_eq!(decision.ratchet, None);
    }

    #[test]
    fn test_new_high_ratchets_without_trigger() {
        let decision = evaluate(&trade(95.0, 97.0, 100.0), 110.0, true);
        let ratchet = decision.ratchet.unwrap();
        assert_eq!(ratchet.highest_price, 110.0);
        assert!((ratchet.trailing_stop_price - 106.7).abs() < 1e-9);
        assert_eq!(decision.trigger, None);
    }

    #[test]
    fn test_trailing_stop_triggers_on_pullback() {
        let decision = evaluate(&trade(95.0, 106.7, 110.0), 106.0, true);
        assert_eq!(decision.ratchet, None);
        assert_eq!(decision.trigger, Some((ExitReason::TrailingStop, 106.7)));
    }

    #[test]
    fn test_trailing_disabled_only_checks_fixed_stop() {
        let decision = evaluate(&trade(95.0, 106.7, 110.0), 100.0, false);
        assert_eq!(
            decision,
            ExitDecision {
                ratchet: None,
                trigger: None
            }
        );
    }

    #[test]
    fn test_ratchet_never_loosens_existing_stop() {
        // Stored stop is above what the new high would imply
        let decision = evaluate(&trade(95.0, 108.0, 105.0), 106.0, true);
        let ratchet = decision.ratchet.unwrap();
        assert_eq!(ratchet.trailing_stop_price, 108.0);
        // 106 <= 108: the held stop still fires
        assert_eq!(decision.trigger, Some((ExitReason::TrailingStop, 108.0)));
    }

    #[test]
    fn test_trailing_stop_monotonic_over_passes() {
        let mut t = trade(95.0, 97.0, 100.0);
        let mut last_stop = 97.0;

        for price in [101.0, 104.0, 103.0, 108.0, 107.5, 112.0] {
            let decision = evaluate(&t, price, true);
            if let Some(r) = decision.ratchet {
                t.highest_price = r.highest_price;
                t.trailing_stop_price = Some(r.trailing_stop_price);
            }
            let stop = t.trailing_stop_price.unwrap();
            assert!(stop >= last_stop);
            last_stop = stop;
            assert!(decision.trigger.is_none());
        }
    }
}
