use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::db::Ledger;
use crate::Result;

/// Static configuration loaded from `spotguard.toml` and `SPOTGUARD_*` env vars
///
/// Every field has a default, so an empty environment yields a usable
/// (read-only) setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Defaults to `sqlite://{data_dir}/trading.db`
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub quote_asset: String,
    /// Asset used for fee rebates, never reported as an orphan
    pub fee_asset: String,
    pub lock_stale_secs: u64,
    pub exchange: ExchangeSettings,
    pub cache: CacheSettings,
    pub trading: TradingDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            data_dir: PathBuf::from(home).join(".spotguard").join("data"),
            database_url: None,
            redis_url: None,
            quote_asset: "USDT".to_string(),
            fee_asset: "BNB".to_string(),
            lock_stale_secs: 300,
            exchange: ExchangeSettings::default(),
            cache: CacheSettings::default(),
            trading: TradingDefaults::default(),
        }
    }
}

impl Settings {
    /// Load settings: defaults, then optional `spotguard.toml`, then env
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("spotguard").required(false))
            .add_source(
                config::Environment::with_prefix("SPOTGUARD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!("sqlite://{}", self.data_dir.join("trading.db").display())
        })
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub recv_window_ms: u64,
    pub rate_limit_calls: u32,
    pub rate_limit_period_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            api_key: None,
            api_secret: None,
            recv_window_ms: 5000,
            rate_limit_calls: 10, // 10 req/sec, well under venue weight limits
            rate_limit_period_secs: 1,
            timeout_secs: 10,
        }
    }
}

/// Cache freshness windows (seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub price_ttl_secs: u64,
    pub candles_ttl_secs: u64,
    pub account_ttl_secs: u64,
    pub symbol_rules_ttl_secs: u64,
    /// Oldest cached value still served as a degraded fallback
    pub stale_max_age_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            price_ttl_secs: 15,
            candles_ttl_secs: 60,
            account_ttl_secs: 10,
            symbol_rules_ttl_secs: 3600,
            stale_max_age_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopLossType {
    Fixed,
    Atr,
}

impl FromStr for StopLossType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FIXED" => Ok(StopLossType::Fixed),
            "ATR" => Ok(StopLossType::Atr),
            other => Err(format!("unknown stop loss type {other}")),
        }
    }
}

impl fmt::Display for StopLossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopLossType::Fixed => f.write_str("FIXED"),
            StopLossType::Atr => f.write_str("ATR"),
        }
    }
}

/// Static trading defaults, each shadowable by a persisted override
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingDefaults {
    pub default_allocation: f64,        // Fraction of equity per trade
    pub default_stop_loss_pct: f64,
    pub default_trailing_stop_pct: f64,
    pub max_portfolio_exposure: f64,
    pub max_capital_at_risk: f64,       // Hard ceiling per trade, quote currency
    pub risk_per_trade: f64,
    pub min_trade_usdt: f64,
    pub cash_buffer: f64,
    pub stop_loss_type: StopLossType,
    pub stop_loss_atr_multiplier: f64,
    pub atr_period: usize,
    pub atr_interval: String,
    pub enable_trailing_stops: bool,
    pub orphan_min_value: f64,
}

impl Default for TradingDefaults {
    fn default() -> Self {
        Self {
            default_allocation: 0.15,
            default_stop_loss_pct: 0.05,
            default_trailing_stop_pct: 0.03,
            max_portfolio_exposure: 0.95,
            max_capital_at_risk: 999_999.0,
            risk_per_trade: 0.98,
            min_trade_usdt: 10.0,
            cash_buffer: 0.01,
            stop_loss_type: StopLossType::Fixed,
            stop_loss_atr_multiplier: 1.5,
            atr_period: 14,
            atr_interval: "1d".to_string(),
            enable_trailing_stops: true,
            orphan_min_value: 1.0,
        }
    }
}

impl TradingDefaults {
    /// Static default for a key, in its persisted string form
    pub fn value(&self, key: ConfigKey) -> String {
        match key {
            ConfigKey::DefaultAllocation => self.default_allocation.to_string(),
            ConfigKey::DefaultStopLossPct => self.default_stop_loss_pct.to_string(),
            ConfigKey::DefaultTrailingStopPct => self.default_trailing_stop_pct.to_string(),
            ConfigKey::MaxPortfolioExposure => self.max_portfolio_exposure.to_string(),
            ConfigKey::MaxCapitalAtRisk => self.max_capital_at_risk.to_string(),
            ConfigKey::RiskPerTrade => self.risk_per_trade.to_string(),
            ConfigKey::MinTradeUsdt => self.min_trade_usdt.to_string(),
            ConfigKey::CashBuffer => self.cash_buffer.to_string(),
            ConfigKey::StopLossType => self.stop_loss_type.to_string(),
            ConfigKey::StopLossAtrMultiplier => self.stop_loss_atr_multiplier.to_string(),
            ConfigKey::EnableTrailingStops => self.enable_trailing_stops.to_string(),
            ConfigKey::OrphanMinValue => self.orphan_min_value.to_string(),
            ConfigKey::TradingHalted => "false".to_string(),
        }
    }
}

/// Keys that may be overridden in the persisted config table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    DefaultAllocation,
    DefaultStopLossPct,
    DefaultTrailingStopPct,
    MaxPortfolioExposure,
    MaxCapitalAtRisk,
    RiskPerTrade,
    MinTradeUsdt,
    CashBuffer,
    StopLossType,
    StopLossAtrMultiplier,
    EnableTrailingStops,
    OrphanMinValue,
    TradingHalted,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 13] = [
        ConfigKey::DefaultAllocation,
        ConfigKey::DefaultStopLossPct,
        ConfigKey::DefaultTrailingStopPct,
        ConfigKey::MaxPortfolioExposure,
        ConfigKey::MaxCapitalAtRisk,
        ConfigKey::RiskPerTrade,
        ConfigKey::MinTradeUsdt,
        ConfigKey::CashBuffer,
        ConfigKey::StopLossType,
        ConfigKey::StopLossAtrMultiplier,
        ConfigKey::EnableTrailingStops,
        ConfigKey::OrphanMinValue,
        ConfigKey::TradingHalted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::DefaultAllocation => "default_allocation",
            ConfigKey::DefaultStopLossPct => "default_stop_loss_pct",
            ConfigKey::DefaultTrailingStopPct => "default_trailing_stop_pct",
            ConfigKey::MaxPortfolioExposure => "max_portfolio_exposure",
            ConfigKey::MaxCapitalAtRisk => "max_capital_at_risk",
            ConfigKey::RiskPerTrade => "risk_per_trade",
            ConfigKey::MinTradeUsdt => "min_trade_usdt",
            ConfigKey::CashBuffer => "cash_buffer",
            ConfigKey::StopLossType => "stop_loss_type",
            ConfigKey::StopLossAtrMultiplier => "stop_loss_atr_multiplier",
            ConfigKey::EnableTrailingStops => "enable_trailing_stops",
            ConfigKey::OrphanMinValue => "orphan_min_value",
            ConfigKey::TradingHalted => "trading_halted",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean switch as stored in the config table ("1"/"0", "true"/"false", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag(pub bool);

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Flag(true)),
            "0" | "false" | "no" | "off" => Ok(Flag(false)),
            other => Err(format!("not a boolean: {other}")),
        }
    }
}

/// First layer that holds a value
pub fn first_present<T>(layers: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    layers.into_iter().flatten().next()
}

/// Layered parameter lookup: call override > persisted override > static default
#[derive(Clone)]
pub struct ConfigResolver {
    ledger: Arc<dyn Ledger>,
    defaults: TradingDefaults,
}

impl ConfigResolver {
    pub fn new(ledger: Arc<dyn Ledger>, defaults: TradingDefaults) -> Self {
        Self { ledger, defaults }
    }

    pub fn defaults(&self) -> &TradingDefaults {
        &self.defaults
    }

    /// Resolve `key`, preferring `call_override` when given
    pub async fn resolve<T>(&self, key: ConfigKey, call_override: Option<T>) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let persisted = self.persisted(key).await?;
        let default = self.static_default(key)?;

        Ok(first_present([call_override, persisted]).unwrap_or(default))
    }

    pub async fn number(&self, key: ConfigKey, call_override: Option<f64>) -> Result<f64> {
        self.resolve(key, call_override).await
    }

    pub async fn flag(&self, key: ConfigKey) -> Result<bool> {
        self.resolve::<Flag>(key, None).await.map(|f| f.0)
    }

    pub async fn stop_loss_type(&self) -> Result<StopLossType> {
        self.resolve(ConfigKey::StopLossType, None).await
    }

    /// Persisted override, if present and well-formed
    async fn persisted<T>(&self, key: ConfigKey) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = self.ledger.config_value(key.as_str()).await? else {
            return Ok(None);
        };

        match raw.parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    value = %raw,
                    "Ignoring malformed config override ({}), using default",
                    e
                );
                Ok(None)
            }
        }
    }

    fn static_default<T>(&self, key: ConfigKey) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.defaults.value(key);
        raw.parse::<T>().map_err(|e| {
            config::ConfigError::Message(format!("invalid default for {key}: {e}")).into()
        })
    }
}
