//! Closed-trade statistics: win rate, profit factor, Sharpe and breakdowns
//!
//! Records missing a P&L are counted as zero-P&L trades so a single bad
//! row never aborts a report.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::db::Ledger;
use crate::models::TradeRecord;
use crate::Result;

/// Look-back window for analytics queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum Period {
    Day,
    Week,
    Month,
    Quarter,
    All,
}

impl Period {
    /// Parse `1d|7d|30d|90d|all`; anything else falls back to 30 days
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1d" => Period::Day,
            "7d" => Period::Week,
            "30d" => Period::Month,
            "90d" => Period::Quarter,
            "all" => Period::All,
            other => {
                tracing::debug!("Unknown period {:?}, using 30d", other);
                Period::Month
            }
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Period::Day => Some(Duration::days(1)),
            Period::Week => Some(Duration::days(7)),
            Period::Month => Some(Duration::days(30)),
            Period::Quarter => Some(Duration::days(90)),
            Period::All => None,
        }
    }

    /// Start of the window ending at `now`
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration().map(|d| now - d)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Day => "1d",
            Period::Week => "7d",
            Period::Month => "30d",
            Period::Quarter => "90d",
            Period::All => "all",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TradeSummary {
    pub trade_id: String,
    pub symbol: String,
    pub pnl: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Performance {
    pub period: Period,
    pub total_trades: usize,
    pub winning: usize,
    pub losing: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// avg win / avg loss; infinite (serialized as null) with wins and no losses
    pub profit_factor: f64,
    pub total_fees: f64,
    pub net_pnl: f64,
    pub avg_holding_hours: f64,
    pub best_trade: Option<TradeSummary>,
    pub worst_trade: Option<TradeSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AssetStats {
    pub symbol: String,
    pub trades: usize,
    pub winning: usize,
    pub losing: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub total_fees: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExitReasonStats {
    pub reason: String,
    pub trades: usize,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub performance: Performance,
    pub sharpe_ratio: f64,
    pub asset_breakdown: Vec<AssetStats>,
    pub exit_reasons: Vec<ExitReasonStats>,
}

fn pnl(trade: &TradeRecord) -> f64 {
    trade.pnl.unwrap_or(0.0)
}

fn win_rate(wins: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        wins as f64 / total as f64 * 100.0
    }
}

fn summary(trade: &TradeRecord) -> TradeSummary {
    TradeSummary {
        trade_id: trade.trade_id.clone(),
        symbol: trade.symbol.clone(),
        pnl: pnl(trade),
        pnl_pct: trade.pnl_pct.unwrap_or(0.0),
    }
}

/// Core metrics over a set of closed trades
pub fn performance(period: Period, trades: &[TradeRecord]) -> Performance {
    let (wins, losses): (Vec<&TradeRecord>, Vec<&TradeRecord>) =
        trades.iter().partition(|t| pnl(t) > 0.0);

    let total_pnl: f64 = trades.iter().map(pnl).sum();
    let total_fees: f64 = trades.iter().map(|t| t.fee_quote).sum();

    let avg_win = if wins.is_empty() {
        0.0
    } else {
        wins.iter().map(|t| pnl(t)).sum::<f64>() / wins.len() as f64
    };
    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        losses.iter().map(|t| pnl(t).abs()).sum::<f64>() / losses.len() as f64
    };
    let profit_factor = if avg_loss > 0.0 {
        avg_win / avg_loss
    } else if avg_win > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let holding: Vec<i64> = trades
        .iter()
        .filter_map(|t| t.holding_period_ms)
        .filter(|ms| *ms > 0)
        .collect();
    let avg_holding_hours = if holding.is_empty() {
        0.0
    } else {
        holding.iter().sum::<i64>() as f64 / holding.len() as f64 / 3_600_000.0
    };

    let best_trade = trades
        .iter()
        .max_by(|a, b| pnl(a).total_cmp(&pnl(b)))
        .map(summary);
    let worst_trade = trades
        .iter()
        .min_by(|a, b| pnl(a).total_cmp(&pnl(b)))
        .map(summary);

    Performance {
        period,
        total_trades: trades.len(),
        winning: wins.len(),
        losing: losses.len(),
        win_rate: win_rate(wins.len(), trades.len()),
        total_pnl,
        avg_win,
        avg_loss,
        profit_factor,
        total_fees,
        net_pnl: total_pnl - total_fees,
        avg_holding_hours,
        best_trade,
        worst_trade,
    }
}

/// Per-trade return mean over sample stdev, scaled by sqrt(min(n, 365))
///
/// Zero risk-free rate. 0 with fewer than two trades or no dispersion.
pub fn sharpe_ratio(trades: &[TradeRecord]) -> f64 {
    let n = trades.len();
    if n < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct.unwrap_or(0.0)).collect();
    let mean = returns.iter().sum::<f64>() / n as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        return 0.0;
    }

    mean / std_dev * (n.min(365) as f64).sqrt()
}

/// Per-symbol stats, best total P&L first
pub fn asset_breakdown(trades: &[TradeRecord]) -> Vec<AssetStats> {
    let mut by_symbol: BTreeMap<&str, Vec<&TradeRecord>> = BTreeMap::new();
    for trade in trades {
        by_symbol.entry(trade.symbol.as_str()).or_default().push(trade);
    }

    let mut stats: Vec<AssetStats> = by_symbol
        .into_iter()
        .map(|(symbol, group)| {
            let winning = group.iter().filter(|t| pnl(t) > 0.0).count();
            let total_pnl: f64 = group.iter().map(|t| pnl(t)).sum();
            AssetStats {
                symbol: symbol.to_string(),
                trades: group.len(),
                winning,
                losing: group.len() - winning,
                win_rate: win_rate(winning, group.len()),
                total_pnl,
                avg_pnl: total_pnl / group.len() as f64,
                total_fees: group.iter().map(|t| t.fee_quote).sum(),
            }
        })
        .collect();

    stats.sort_by(|a, b| b.total_pnl.total_cmp(&a.total_pnl));
    stats
}

/// Per exit reason stats, keyed "unknown" when no reason was recorded
pub fn exit_reason_breakdown(trades: &[TradeRecord]) -> Vec<ExitReasonStats> {
    let mut by_reason: BTreeMap<String, Vec<&TradeRecord>> = BTreeMap::new();
    for trade in trades {
        let reason = trade
            .exit_reason
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |r| r.to_string());
        by_reason.entry(reason).or_default().push(trade);
    }

    by_reason
        .into_iter()
        .map(|(reason, group)| {
            let winning = group.iter().filter(|t| pnl(t) > 0.0).count();
            let total_pnl: f64 = group.iter().map(|t| pnl(t)).sum();
            ExitReasonStats {
                reason,
                trades: group.len(),
                total_pnl,
                avg_pnl: total_pnl / group.len() as f64,
                win_rate: win_rate(winning, group.len()),
            }
        })
        .collect()
}

/// Ledger-backed analytics queries
pub struct Analytics {
    ledger: Arc<dyn Ledger>,
}

impl Analytics {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    async fn closed(&self, period: Period, symbol: Option<&str>) -> Result<Vec<TradeRecord>> {
        self.ledger
            .closed_trades(period.since(Utc::now()), symbol)
            .await
    }

    pub async fn performance(&self, period: Period, symbol: Option<&str>) -> Result<Performance> {
        let trades = self.closed(period, symbol).await?;
        Ok(performance(period, &trades))
    }

    pub async fn sharpe_ratio(&self, period: Period) -> Result<f64> {
        let trades = self.closed(period, None).await?;
        Ok(sharpe_ratio(&trades))
    }

    pub async fn asset_breakdown(&self, period: Period) -> Result<Vec<AssetStats>> {
        let trades = self.closed(period, None).await?;
        Ok(asset_breakdown(&trades))
    }

    pub async fn exit_reason_breakdown(&self, period: Period) -> Result<Vec<ExitReasonStats>> {
        let trades = self.closed(period, None).await?;
        Ok(exit_reason_breakdown(&trades))
    }

    /// Everything at once, from a single ledger read
    pub async fn full(&self, period: Period) -> Result<AnalyticsReport> {
        let trades = self.closed(period, None).await?;
        Ok(AnalyticsReport {
            performance: performance(period, &trades),
            sharpe_ratio: sharpe_ratio(&trades),
            asset_breakdown: asset_breakdown(&trades),
            exit_reasons: exit_reason_breakdown(&trades),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, ExitReason, Side};

    fn closed(symbol: &str, pnl: Option<f64>, pnl_pct: f64, reason: Option<ExitReason>) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            trade_id: format!("{symbol}-{pnl_pct}"),
            symbol: symbol.to_string(),
            side: Side::Buy,
            direction: Direction::Long,
            quantity: 1.0,
            entry_price: 100.0,
            exit_price: Some(100.0 + pnl.unwrap_or(0.0)),
            total_value: 100.0,
            pnl,
            pnl_pct: Some(pnl_pct),
            fee_quote: 0.2,
            stop_loss: None,
            trailing_stop_price: None,
            trailing_stop_pct: None,
            highest_price: 100.0,
            entry_tag: None,
            exit_reason: reason,
            atr: None,
            is_open: false,
            holding_period_ms: Some(7_200_000),
            opened_at: now - Duration::hours(2),
            closed_at: Some(now),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_parse_period_defaults_to_month() {
        assert_eq!(Period::parse("7d"), Period::Week);
        assert_eq!(Period::parse("ALL"), Period::All);
        assert_eq!(Period::parse("2w"), Period::Month);
        assert_eq!(Period::All.duration(), None);
        assert_eq!(Period::Quarter.duration(), Some(Duration::days(90)));
    }

    #[test]
    fn test_performance_metrics() {
        let trades = vec![
            closed("BTCUSDT", Some(30.0), 30.0, Some(ExitReason::TrailingStop)),
            closed("BTCUSDT", Some(10.0), 10.0, Some(ExitReason::Manual)),
            closed("ETHUSDT", Some(-20.0), -20.0, Some(ExitReason::StopLoss)),
        ];
        let perf = performance(Period::Month, &trades);

        assert_eq!(perf.total_trades, 3);
        assert_eq!(perf.winning, 2);
        assert_eq!(perf.losing, 1);
        assert!((perf.win_rate - 66.666_666).abs() < 1e-3);
        assert_eq!(perf.total_pnl, 20.0);
        assert_eq!(perf.avg_win, 20.0);
        assert_eq!(perf.avg_loss, 20.0);
        assert_eq!(perf.profit_factor, 1.0);
        assert!((perf.total_fees - 0.6).abs() < 1e-9);
        assert!((perf.net_pnl - 19.4).abs() < 1e-9);
        assert_eq!(perf.avg_holding_hours, 2.0);
        assert_eq!(perf.best_trade.unwrap().pnl, 30.0);
        assert_eq!(perf.worst_trade.unwrap().symbol, "ETHUSDT");
    }

    #[test]
    fn test_profit_factor_edges() {
        let wins_only = vec![closed("BTCUSDT", Some(5.0), 5.0, None)];
        assert!(performance(Period::All, &wins_only).profit_factor.is_infinite());

        let empty = performance(Period::All, &[]);
        assert_eq!(empty.profit_factor, 0.0);
        assert_eq!(empty.best_trade, None);
    }

    #[test]
    fn test_missing_pnl_counts_as_zero_loss() {
        let trades = vec![closed("BTCUSDT", None, 0.0, None)];
        let perf = performance(Period::All, &trades);
        assert_eq!(perf.losing, 1);
        assert_eq!(perf.total_pnl, 0.0);
    }

    #[test]
    fn test_sharpe_ratio() {
        assert_eq!(sharpe_ratio(&[closed("BTCUSDT", Some(1.0), 1.0, None)]), 0.0);

        let flat = vec![
            closed("BTCUSDT", Some(1.0), 1.0, None),
            closed("ETHUSDT", Some(1.0), 1.0, None),
        ];
        assert_eq!(sharpe_ratio(&flat), 0.0);

        // mean 2, sample stdev 1, n = 3
        let trades = vec![
            closed("A", Some(1.0), 1.0, None),
            closed("B", Some(2.0), 2.0, None),
            closed("C", Some(3.0), 3.0, None),
        ];
        assert!((sharpe_ratio(&trades) - 2.0 * 3f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_breakdowns() {
        let trades = vec![
            closed("ETHUSDT", Some(-5.0), -5.0, Some(ExitReason::StopLoss)),
            closed("BTCUSDT", Some(12.0), 12.0, Some(ExitReason::TrailingStop)),
            closed("BTCUSDT", Some(-2.0), -2.0, None),
        ];

        let assets = asset_breakdown(&trades);
        assert_eq!(assets[0].symbol, "BTCUSDT");
        assert_eq!(assets[0].trades, 2);
        assert_eq!(assets[0].avg_pnl, 5.0);
        assert_eq!(assets[1].symbol, "ETHUSDT");

        let reasons = exit_reason_breakdown(&trades);
        let names: Vec<&str> = reasons.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(names, vec!["STOP_LOSS", "TRAILING_STOP", "unknown"]);
        assert_eq!(reasons[1].win_rate, 100.0);
    }
}
