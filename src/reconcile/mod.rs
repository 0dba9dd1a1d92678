use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::api::MarketGateway;
use crate::db::Ledger;
use crate::error::{Outcome, Refusal};
use crate::models::TradeRecord;
use crate::Result;

/// Exchange balance below this fraction of the recorded quantity is a zombie
const ZOMBIE_FRACTION: f64 = 0.01;
/// Quantities further apart than this (percent of recorded) are a mismatch
const MISMATCH_TOLERANCE_PCT: f64 = 1.0;

/// Ledger believes a position is open; the exchange holds (almost) none
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Zombie {
    pub trade_id: String,
    pub symbol: String,
    pub ledger_quantity: f64,
    pub exchange_balance: f64,
}

/// Exchange balance with no open position behind it
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Orphan {
    pub asset: String,
    pub symbol: String,
    pub exchange_balance: f64,
    /// None when the asset could not be priced
    pub estimated_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Mismatch {
    pub trade_id: String,
    pub symbol: String,
    pub ledger_quantity: f64,
    pub exchange_balance: f64,
    pub difference: f64,
    pub difference_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub zombies: Vec<Zombie>,
    pub orphans: Vec<Orphan>,
    pub mismatches: Vec<Mismatch>,
    pub total_issues: usize,
    pub open_trades_checked: usize,
    pub exchange_assets_checked: usize,
    /// Balances came from the stale cache
    pub degraded: bool,
}

/// Base asset of a pair quoted in `quote` (BTCUSDT -> BTC)
pub fn base_asset<'a>(symbol: &'a str, quote: &str) -> &'a str {
    symbol
        .strip_suffix(quote)
        .filter(|base| !base.is_empty())
        .unwrap_or(symbol)
}

pub fn detect_zombies(
    open_trades: &[TradeRecord],
    balances: &HashMap<String, f64>,
    quote: &str,
) -> Vec<Zombie> {
    open_trades
        .iter()
        .filter_map(|trade| {
            let asset = base_asset(&trade.symbol, quote);
            let exchange_balance = balances.get(asset).copied().unwrap_or(0.0);
            (exchange_balance < trade.quantity * ZOMBIE_FRACTION).then(|| Zombie {
                trade_id: trade.trade_id.clone(),
                symbol: trade.symbol.clone(),
                ledger_quantity: trade.quantity,
                exchange_balance,
            })
        })
        .collect()
}

/// Untracked balances worth at least `min_value`
///
/// `excluded` assets (quote and fee assets) are never orphans. A balance
/// that could not be priced is reported without a value rather than
/// dropped as dust.
pub fn detect_orphans(
    open_trades: &[TradeRecord],
    balances: &HashMap<String, f64>,
    prices: &HashMap<String, f64>,
    quote: &str,
    excluded: &[&str],
    min_value: f64,
) -> Vec<Orphan> {
    let tracked: BTreeSet<&str> = open_trades
        .iter()
        .map(|t| base_asset(&t.symbol, quote))
        .collect();

    let mut orphans: Vec<Orphan> = balances
        .iter()
        .filter(|(asset, balance)| {
            **balance > 0.0
                && !excluded.contains(&asset.as_str())
                && !tracked.contains(asset.as_str())
        })
        .filter_map(|(asset, balance)| {
            let symbol = format!("{asset}{quote}");
            let estimated_value = prices
                .get(&symbol)
                .filter(|p| **p > 0.0)
                .map(|price| balance * price);

            if estimated_value.is_some_and(|value| value < min_value) {
                return None;
            }

            Some(Orphan {
                asset: asset.clone(),
                symbol,
                exchange_balance: *balance,
                estimated_value,
            })
        })
        .collect();

    orphans.sort_by(|a, b| a.asset.cmp(&b.asset));
    orphans
}

/// Both sides positive but more than 1% apart; zombies are excluded
pub fn detect_mismatches(
    open_trades: &[TradeRecord],
    balances: &HashMap<String, f64>,
    quote: &str,
    zombies: &[Zombie],
) -> Vec<Mismatch> {
    open_trades
        .iter()
        .filter(|t| !zombies.iter().any(|z| z.trade_id == t.trade_id))
        .filter_map(|trade| {
            let asset = base_asset(&trade.symbol, quote);
            let exchange_balance = balances.get(asset).copied().unwrap_or(0.0);
            if exchange_balance <= 0.0 || trade.quantity <= 0.0 {
                return None;
            }

            let difference = exchange_balance - trade.quantity;
            let difference_pct = difference.abs() / trade.quantity * 100.0;

            (difference_pct > MISMATCH_TOLERANCE_PCT).then(|| Mismatch {
                trade_id: trade.trade_id.clone(),
                symbol: trade.symbol.clone(),
                ledger_quantity: trade.quantity,
                exchange_balance,
                difference,
                difference_pct,
            })
        })
        .collect()
}

/// Read-only comparison of the ledger against exchange balances
///
/// Never mutates anything: the cause of drift (withdrawal, manual trade,
/// missed write) is left to the operator.
pub struct Reconciler {
    gateway: Arc<dyn MarketGateway>,
    ledger: Arc<dyn Ledger>,
    quote_asset: String,
    fee_asset: String,
    orphan_min_value: f64,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<dyn MarketGateway>,
        ledger: Arc<dyn Ledger>,
        quote_asset: &str,
        fee_asset: &str,
        orphan_min_value: f64,
    ) -> Self {
        Self {
            gateway,
            ledger,
            quote_asset: quote_asset.to_string(),
            fee_asset: fee_asset.to_string(),
            orphan_min_value,
        }
    }

    pub async fn reconcile(&self) -> Result<Outcome<ReconcileReport>> {
        let account = match self.gateway.account().await {
            Ok(account) => account,
            Err(e) => {
                return Ok(Refusal::AccountUnavailable {
                    detail: e.to_string(),
                }
                .into())
            }
        };
        let balances = account.totals();
        let open_trades = self.ledger.open_trades().await?;

        let excluded = [self.quote_asset.as_str(), self.fee_asset.as_str()];
        let priced_assets: Vec<&String> = balances
            .iter()
            .filter(|(asset, balance)| **balance > 0.0 && !excluded.contains(&asset.as_str()))
            .map(|(asset, _)| asset)
            .collect();

        let mut prices = HashMap::new();
        for asset in &priced_assets {
            let symbol = format!("{}{}", asset, self.quote_asset);
            match self.gateway.price(&symbol).await {
                Ok(quote) => {
                    prices.insert(symbol, quote.price);
                }
                Err(e) => tracing::debug!("No price for {} during reconcile: {}", symbol, e),
            }
        }

        let zombies = detect_zombies(&open_trades, &balances, &self.quote_asset);
        let orphans = detect_orphans(
            &open_trades,
            &balances,
            &prices,
            &self.quote_asset,
            &excluded,
            self.orphan_min_value,
        );
        let mismatches = detect_mismatches(&open_trades, &balances, &self.quote_asset, &zombies);

        let total_issues = zombies.len() + orphans.len() + mismatches.len();
        if total_issues > 0 {
            tracing::warn!(
                "Reconcile found {} zombies, {} orphans, {} mismatches",
                zombies.len(),
                orphans.len(),
                mismatches.len()
            );
        }

        Ok(Outcome::Success(ReconcileReport {
            total_issues,
            open_trades_checked: open_trades.len(),
            exchange_assets_checked: priced_assets.len(),
            degraded: account.degraded,
            zombies,
            orphans,
            mismatches,
        }))
    }
}
