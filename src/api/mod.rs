pub mod binance;
pub mod gateway;

pub use binance::BinanceClient;
pub use gateway::CachedGateway;

use async_trait::async_trait;

use crate::models::{AccountSnapshot, Candle, OrderFill, PriceQuote, Side, SymbolRules};

/// Normalized failure of any call to the exchange
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// The venue understood the request and refused it
    #[error("exchange rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("malformed response: {0}")]
    Decode(String),

    /// No live data and no usable cached value
    #[error("{0} unavailable")]
    Unavailable(String),
}

impl GatewayError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, GatewayError::Rejected { .. })
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout(e.to_string())
        } else if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Market data and order execution against one spot venue
///
/// Every call is awaited in sequence by the caller; implementations apply
/// their own rate limiting.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// Last traded price for a symbol
    async fn price(&self, symbol: &str) -> Result<PriceQuote, GatewayError>;

    /// OHLCV candles, oldest first, most recent last
    async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn account(&self) -> Result<AccountSnapshot, GatewayError>;

    /// Submit one market order for an already-quantized quantity
    async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderFill, GatewayError>;

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, GatewayError>;
}
