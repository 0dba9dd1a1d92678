use serde::Serialize;

use crate::api::GatewayError;

/// Conditions that abort a command run.
///
/// Ordinary business refusals never show up here; they travel as
/// [`Outcome::Refused`] so the caller can report them and carry on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid order side: {0}")]
    InvalidSide(String),

    #[error("quantity {requested} for {symbol} floors to zero at step size {step}")]
    NonPositiveQuantity {
        symbol: String,
        requested: f64,
        step: f64,
    },
}

/// Expected, non-fatal reasons an operation declined to act.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Refusal {
    #[error("Trading is halted")]
    Halted,

    #[error("Already have an open position in {symbol}")]
    PositionExists { symbol: String },

    #[error("No open position found for {target}")]
    NoOpenPosition { target: String },

    #[error("Trade amount ${amount:.2} below minimum ${minimum:.2}")]
    BelowMinimum { amount: f64, minimum: f64 },

    #[error("Portfolio exposure at {exposure_pct:.0}%, max is {max_pct:.0}%")]
    ExposureLimit { exposure_pct: f64, max_pct: f64 },

    #[error("No equity available")]
    NoEquity,

    #[error("Cannot fetch price for {symbol}: {detail}")]
    PriceUnavailable { symbol: String, detail: String },

    #[error("Cannot fetch account: {detail}")]
    AccountUnavailable { detail: String },

    #[error("Cannot acquire lock for {symbol}, another close may be in progress")]
    LockContended { symbol: String },

    #[error("{side} order failed: {detail}")]
    OrderFailed { side: String, detail: String },

    #[error("{side} order filled 0 quantity")]
    EmptyFill { side: String },
}

/// Tagged result of a core operation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<T> {
    Success(T),
    Refused(Refusal),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Refused(_) => None,
        }
    }

    pub fn refusal(&self) -> Option<&Refusal> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Refused(refusal) => Some(refusal),
        }
    }
}

impl<T> From<Refusal> for Outcome<T> {
    fn from(refusal: Refusal) -> Self {
        Outcome::Refused(refusal)
    }
}
