use serde::Serialize;
use std::sync::Arc;

use crate::config::{ConfigKey, Flag};
use crate::db::Ledger;
use crate::Result;

/// Global kill switch for new entries
///
/// Only the sizer consults it; closes and exit checks always run, so risk
/// can still be reduced while halted.
#[derive(Clone)]
pub struct HaltSwitch {
    ledger: Arc<dyn Ledger>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HaltState {
    pub halted: bool,
    /// False when the switch was already in the requested state
    pub changed: bool,
}

impl HaltSwitch {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn is_halted(&self) -> Result<bool> {
        let key = ConfigKey::TradingHalted;
        match self.ledger.config_value(key.as_str()).await? {
            None => Ok(false),
            Some(raw) => match raw.parse::<Flag>() {
                Ok(flag) => Ok(flag.0),
                Err(e) => {
                    tracing::warn!("Ignoring malformed {} value: {}", key, e);
                    Ok(false)
                }
            },
        }
    }

    pub async fn halt(&self) -> Result<HaltState> {
        self.set(true).await
    }

    pub async fn resume(&self) -> Result<HaltState> {
        self.set(false).await
    }

    async fn set(&self, halted: bool) -> Result<HaltState> {
        let was_halted = self.is_halted().await?;
        let value = if halted { "1" } else { "0" };
        self.ledger
            .set_config_value(ConfigKey::TradingHalted.as_str(), value)
            .await?;

        let changed = was_halted != halted;
        if changed {
            if halted {
                tracing::warn!("Trading HALTED: new entries blocked");
            } else {
                tracing::info!("Trading resumed");
            }
        }

        Ok(HaltState { halted, changed })
    }
}
