use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{GatewayError, MarketGateway};
use crate::config::ExchangeSettings;
use crate::models::{
    AccountSnapshot, Balance, Candle, Fill, OrderFill, PriceQuote, Side, SymbolRules,
};

const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 250;

type HmacSha256 = Hmac<Sha256>;

// Type alias for the rate limiter to simplify signatures
type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Binance-compatible spot REST client
///
/// Cloneable; all clones share one rate limiter, so the aggregate call rate
/// across the process stays under the configured quota.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    recv_window_ms: u64,
    rate_limiter: Arc<BinanceRateLimiter>,
}

/// Venue error body, e.g. `{"code":-1121,"msg":"Invalid symbol."}`
#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: Option<i64>,
    symbol: String,
    executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty")]
    cumulative_quote_qty: String,
    #[serde(default)]
    fills: Vec<RawFill>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFill {
    price: String,
    qty: String,
    commission: String,
    commission_asset: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

impl BinanceClient {
    pub fn new(settings: &ExchangeSettings) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;

        let rate_limiter = Arc::new(RateLimiter::direct(quota(
            settings.rate_limit_calls,
            settings.rate_limit_period_secs,
        )));

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            recv_window_ms: settings.recv_window_ms,
            rate_limiter,
        })
    }

    /// Rate-limited public GET with retry on 429/5xx
    async fn get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = GatewayError::Unavailable(path.to_string());

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.get(&url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        let backoff = RETRY_BACKOFF_MS * 2u64.pow(attempt - 1);
                        tracing::warn!(
                            "HTTP {} from {}, retrying in {}ms (attempt {}/{})",
                            status,
                            path,
                            backoff,
                            attempt,
                            MAX_RETRIES
                        );
                        last_error = GatewayError::Transport(format!("HTTP {status} from {path}"));
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        continue;
                    }
                    return decode(response).await;
                }
                Err(e) if attempt < MAX_RETRIES && !e.is_timeout() => {
                    tracing::warn!(
                        "Network error on {}: {}, retrying (attempt {}/{})",
                        path,
                        e,
                        attempt,
                        MAX_RETRIES
                    );
                    last_error = e.into();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error)
    }

    /// Signed request; never retried (orders are not idempotent)
    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let (Some(api_key), Some(_)) = (&self.api_key, &self.api_secret) else {
            return Err(GatewayError::Unavailable("exchange credentials".to_string()));
        };

        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        query.push(format!("recvWindow={}", self.recv_window_ms));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");
        let signature = self.sign(&query)?;

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        self.rate_limiter.until_ready().await;
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await?;

        decode(response).await
    }

    fn sign(&self, query: &str) -> Result<String, GatewayError> {
        let secret = self
            .api_secret
            .as_deref()
            .ok_or_else(|| GatewayError::Unavailable("exchange credentials".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Transport(format!("invalid signing key: {e}")))?;
        mac.update(query.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl MarketGateway for BinanceClient {
    async fn price(&self, symbol: &str) -> Result<PriceQuote, GatewayError> {
        let ticker: TickerPrice = self
            .get_public("/api/v3/ticker/price", &[("symbol", symbol.to_string())])
            .await?;

        Ok(PriceQuote {
            symbol: ticker.symbol,
            price: parse_num("price", &ticker.price)?,
            degraded: false,
        })
    }

    async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .get_public(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn account(&self) -> Result<AccountSnapshot, GatewayError> {
        let account: AccountResponse = self
            .send_signed(Method::GET, "/api/v3/account", &[])
            .await?;

        let mut balances = Vec::new();
        for raw in account.balances {
            let free = parse_num("free", &raw.free)?;
            let locked = parse_num("locked", &raw.locked)?;
            let total = free + locked;
            if total > 0.0 {
                balances.push(Balance {
                    asset: raw.asset,
                    free,
                    locked,
                    total,
                });
            }
        }

        Ok(AccountSnapshot {
            balances,
            degraded: false,
        })
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderFill, GatewayError> {
        let order: OrderResponse = self
            .send_signed(
                Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", side.as_str().to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", quantity.to_string()),
                    ("newOrderRespType", "FULL".to_string()),
                ],
            )
            .await?;

        let fills = order
            .fills
            .iter()
            .map(|f| {
                Ok(Fill {
                    price: parse_num("fill price", &f.price)?,
                    quantity: parse_num("fill qty", &f.qty)?,
                    commission: parse_num("commission", &f.commission)?,
                    commission_asset: f.commission_asset.clone(),
                })
            })
            .collect::<Result<Vec<_>, GatewayError>>()?;

        tracing::info!(
            "{} {} {} filled {} (order {:?})",
            side,
            quantity,
            symbol,
            order.executed_qty,
            order.order_id
        );

        Ok(OrderFill {
            order_id: order.order_id.map(|id| id.to_string()),
            symbol: order.symbol,
            side,
            executed_qty: parse_num("executedQty", &order.executed_qty)?,
            cumulative_quote: parse_num("cummulativeQuoteQty", &order.cumulative_quote_qty)?,
            fills,
        })
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, GatewayError> {
        let info: ExchangeInfo = self
            .get_public("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;

        let Some(entry) = info.symbols.into_iter().find(|s| s.symbol == symbol) else {
            tracing::warn!("No exchange filters for {}, using fallback rules", symbol);
            return Ok(SymbolRules::fallback(symbol));
        };

        Ok(parse_rules(&entry))
    }
}

/// `calls` per `period_secs`, bursting up to `calls`
fn quota(calls: u32, period_secs: u64) -> Quota {
    let burst = NonZeroU32::new(calls).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_secs(period_secs.max(1)) / burst.get();

    Quota::with_period(period)
        .map(|q| q.allow_burst(burst))
        .unwrap_or_else(|| Quota::per_second(burst))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()));
    }

    match serde_json::from_str::<ApiError>(&body) {
        Ok(api) if status.is_client_error() => Err(GatewayError::Rejected {
            code: api.code,
            message: api.msg,
        }),
        _ => Err(GatewayError::Transport(format!("HTTP {status}: {body}"))),
    }
}

fn parse_num(field: &str, raw: &str) -> Result<f64, GatewayError> {
    raw.parse::<f64>()
        .map_err(|_| GatewayError::Decode(format!("{field} is not a number: {raw}")))
}

fn value_num(field: &str, value: Option<&serde_json::Value>) -> Result<f64, GatewayError> {
    match value {
        Some(serde_json::Value::String(s)) => parse_num(field, s),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| GatewayError::Decode(format!("{field} out of range"))),
        _ => Err(GatewayError::Decode(format!("missing {field}"))),
    }
}

fn value_time(field: &str, value: Option<&serde_json::Value>) -> Result<DateTime<Utc>, GatewayError> {
    value
        .and_then(|v| v.as_i64())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| GatewayError::Decode(format!("missing {field}")))
}

/// `[open_time, open, high, low, close, volume, close_time, ...]`
fn parse_kline(row: &[serde_json::Value]) -> Result<Candle, GatewayError> {
    Ok(Candle {
        open_time: value_time("open_time", row.first())?,
        open: value_num("open", row.get(1))?,
        high: value_num("high", row.get(2))?,
        low: value_num("low", row.get(3))?,
        close: value_num("close", row.get(4))?,
        volume: value_num("volume", row.get(5))?,
        close_time: value_time("close_time", row.get(6))?,
    })
}

fn parse_rules(info: &SymbolInfo) -> SymbolRules {
    let mut rules = SymbolRules::fallback(&info.symbol);

    for filter in &info.filters {
        let field = |name: &str| {
            filter
                .get(name)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
        };

        match filter.get("filterType").and_then(|v| v.as_str()) {
            Some("LOT_SIZE") => {
                if let Some(step) = field("stepSize") {
                    rules.step_size = step;
                }
                if let Some(min_qty) = field("minQty") {
                    rules.min_qty = min_qty;
                }
            }
            Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                if let Some(min_notional) = field("minNotional") {
                    rules.min_notional = min_notional;
                }
            }
            _ => {}
        }
    }

    rules
}
