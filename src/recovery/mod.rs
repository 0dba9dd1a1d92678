use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::db::{Ledger, RecoveryItem};
use crate::models::{TradeRecord, TradeUpdate};
use crate::Result;

/// Why a local write is owed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// Buy filled, trade insert failed; payload is the full `TradeRecord`
    PostBuyPersistenceFailure,
    /// Sell filled, close update failed; payload is a `PendingClose`
    PostSellPersistenceFailure,
}

impl RecoveryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryReason::PostBuyPersistenceFailure => "post_buy_persistence_failure",
            RecoveryReason::PostSellPersistenceFailure => "post_sell_persistence_failure",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "post_buy_persistence_failure" => Some(RecoveryReason::PostBuyPersistenceFailure),
            "post_sell_persistence_failure" => Some(RecoveryReason::PostSellPersistenceFailure),
            _ => None,
        }
    }
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Close update owed to a trade after a filled sell
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingClose {
    pub trade_id: String,
    pub update: TradeUpdate,
}

/// Record a write owed after a committed order
///
/// Never fails: if even the queue write fails, the payload is logged at
/// error level so it can be replayed by hand.
pub async fn enqueue<T: Serialize>(
    ledger: &dyn Ledger,
    reason: RecoveryReason,
    payload: &T,
) -> Option<i64> {
    let payload = match serde_json::to_value(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Cannot serialize {} payload: {}", reason, e);
            return None;
        }
    };

    match ledger.push_recovery(reason.as_str(), &payload).await {
        Ok(id) => {
            tracing::warn!("Queued recovery item {} ({})", id, reason);
            Some(id)
        }
        Err(e) => {
            tracing::error!(
                reason = %reason,
                payload = %payload,
                "Recovery enqueue failed, ledger write lost: {}",
                e
            );
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryDetail {
    pub id: i64,
    pub reason: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<RetryDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscardReport {
    pub id: i64,
    pub discarded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingItems {
    pub count: usize,
    pub items: Vec<RecoveryItem>,
}

/// Replays owed ledger writes. Never touches the exchange.
pub struct RecoveryQueue {
    ledger: Arc<dyn Ledger>,
}

impl RecoveryQueue {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn list(&self) -> Result<PendingItems> {
        let items = self.ledger.pending_recovery().await?;
        Ok(PendingItems {
            count: items.len(),
            items,
        })
    }

    /// Replay every unresolved item, oldest first
    pub async fn retry_all(&self) -> Result<RetryReport> {
        let pending = self.ledger.pending_recovery().await?;
        let mut items = Vec::with_capacity(pending.len());

        for item in &pending {
            let detail = match self.replay(item).await {
                Ok(()) => match self.ledger.resolve_recovery(item.id).await {
                    Ok(_) => {
                        tracing::info!("Recovered item {} ({})", item.id, item.reason);
                        RetryDetail {
                            id: item.id,
                            reason: item.reason.clone(),
                            success: true,
                            error: None,
                        }
                    }
                    Err(e) => self.failed(item, format!("replayed but not marked resolved: {e}")).await,
                },
                Err(reason) => self.failed(item, reason).await,
            };
            items.push(detail);
        }

        let succeeded = items.iter().filter(|d| d.success).count();
        Ok(RetryReport {
            total: items.len(),
            succeeded,
            failed: items.len() - succeeded,
            items,
        })
    }

    pub async fn discard(&self, id: i64) -> Result<DiscardReport> {
        let discarded = self.ledger.discard_recovery(id).await?;
        if discarded {
            tracing::warn!("Discarded recovery item {} as unrecoverable", id);
        }
        Ok(DiscardReport { id, discarded })
    }

    /// Apply the owed write; the error is a human-readable reason
    async fn replay(&self, item: &RecoveryItem) -> std::result::Result<(), String> {
        let reason = RecoveryReason::parse(&item.reason)
            .ok_or_else(|| format!("unknown recovery reason {}", item.reason))?;

        match reason {
            RecoveryReason::PostBuyPersistenceFailure => {
                let trade: TradeRecord = serde_json::from_value(item.payload.clone())
                    .map_err(|e| format!("malformed trade payload: {e}"))?;

                // A previous replay may have inserted it before the resolve failed
                let existing = self.ledger.trade(&trade.trade_id).await.map_err(|e| e.to_string())?;
                if existing.is_some() {
                    return Ok(());
                }

                // Another buy may have opened the symbol since this one was queued
                let open = self
                    .ledger
                    .open_trade_for_symbol(&trade.symbol)
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(open) = open {
                    return Err(format!(
                        "{} already has open trade {}; merge or discard manually",
                        trade.symbol, open.trade_id
                    ));
                }

                self.ledger
                    .insert_trade(&trade)
                    .await
                    .map_err(|e| e.to_string())
            }
            RecoveryReason::PostSellPersistenceFailure => {
                let pending: PendingClose = serde_json::from_value(item.payload.clone())
                    .map_err(|e| format!("malformed close payload: {e}"))?;

                self.ledger
                    .update_trade(&pending.trade_id, &pending.update)
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }

    async fn failed(&self, item: &RecoveryItem, error: String) -> RetryDetail {
        tracing::warn!("Recovery item {} still pending: {}", item.id, error);
        if let Err(e) = self.ledger.note_recovery_failure(item.id, &error).await {
            tracing::warn!("Cannot record failure on item {}: {}", item.id, e);
        }

        RetryDetail {
            id: item.id,
            reason: item.reason.clone(),
            success: false,
            error: Some(error),
        }
    }
}
