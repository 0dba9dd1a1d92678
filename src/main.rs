use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use spotguard::analytics::{Analytics, Period};
use spotguard::api::{BinanceClient, CachedGateway};
use spotguard::config::{ConfigKey, ConfigResolver, Settings};
use spotguard::db::{Ledger, SqliteLedger, TradeQuery};
use spotguard::execution::{BuyRequest, PositionCloser, PositionExit, PositionSizer};
use spotguard::persistence::{MemoryCache, RedisCache, SnapshotCache};
use spotguard::portfolio::Portfolio;
use spotguard::reconcile::Reconciler;
use spotguard::recovery::RecoveryQueue;
use spotguard::risk::{risk_status, ExitEvaluator, HaltSwitch};
use spotguard::{ExitReason, MarketGateway, Outcome};

// ============================================================================
// Command Line
// ============================================================================

#[derive(Parser)]
#[command(name = "spotguard", version, about = "Spot long-only position manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a long position sized from equity
    Buy {
        symbol: String,
        /// Fraction of equity (0.15 = 15%)
        #[arg(long)]
        allocation: Option<f64>,
        #[arg(long)]
        stop_loss_pct: Option<f64>,
        #[arg(long)]
        trailing_stop_pct: Option<f64>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Close the open position in a symbol
    Sell {
        symbol: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Close a position by trade id
    Close {
        trade_id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Evaluate stop-loss and trailing stops, closing what triggered
    CheckExits {
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Block new entries
    Halt,
    /// Allow new entries again
    Resume,
    Portfolio,
    /// Exposure, stop distances and effective limits
    Risk,
    /// Compare open positions against exchange balances (read-only)
    Reconcile,
    #[command(subcommand)]
    Recovery(RecoveryCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Trade history, newest first
    Trades {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        open: bool,
        #[arg(long, default_value = "all")]
        period: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Performance {
        #[arg(long, default_value = "30d")]
        period: String,
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Performance, Sharpe ratio and per-asset / per-exit-reason breakdowns
    Analytics {
        #[arg(long, default_value = "30d")]
        period: String,
    },
}

#[derive(Subcommand)]
enum RecoveryCommand {
    /// Unresolved items, oldest first
    List,
    /// Replay every unresolved item against the ledger
    Retry,
    /// Drop an item as unrecoverable
    Discard { id: i64 },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Effective value of every key
    List,
    Get { key: String },
    Set { key: String, value: String },
    /// Remove an override, restoring the default
    Unset { key: String },
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            print_json(&serde_json::json!({ "status": "error", "error": format!("{e:#}") }));
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("spotguard=info"));

    // stdout carries the JSON result; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct App {
    settings: Settings,
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn MarketGateway>,
}

impl App {
    async fn init() -> anyhow::Result<Self> {
        let settings = Settings::load().context("loading settings")?;
        std::fs::create_dir_all(&settings.data_dir)
            .with_context(|| format!("creating {}", settings.data_dir.display()))?;

        let ledger: Arc<dyn Ledger> = Arc::new(
            SqliteLedger::connect(&settings.database_url())
                .await
                .context("opening ledger")?,
        );

        let client = BinanceClient::new(&settings.exchange).context("building exchange client")?;
        let cache = connect_cache(&settings).await;
        let gateway: Arc<dyn MarketGateway> = Arc::new(CachedGateway::new(
            Arc::new(client),
            cache,
            settings.cache.clone(),
        ));

        Ok(Self {
            settings,
            ledger,
            gateway,
        })
    }

    fn resolver(&self) -> ConfigResolver {
        ConfigResolver::new(self.ledger.clone(), self.settings.trading.clone())
    }

    fn closer(&self) -> PositionCloser {
        PositionCloser::new(
            self.gateway.clone(),
            self.ledger.clone(),
            self.settings.lock_dir(),
            Duration::from_secs(self.settings.lock_stale_secs),
            &self.settings.quote_asset,
        )
    }
}

async fn connect_cache(settings: &Settings) -> Arc<dyn SnapshotCache> {
    let Some(redis_url) = settings.redis_url.as_deref() else {
        return Arc::new(MemoryCache::new());
    };

    match RedisCache::new(redis_url, settings.cache.stale_max_age_secs).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Redis ({}), continuing with in-process cache",
                e
            );
            Arc::new(MemoryCache::new())
        }
    }
}

// ============================================================================
// Command Dispatch
// ============================================================================

async fn run(command: Command) -> anyhow::Result<ExitCode> {
    let app = App::init().await?;

    match command {
        Command::Buy {
            symbol,
            allocation,
            stop_loss_pct,
            trailing_stop_pct,
            tag,
            dry_run,
        } => {
            let sizer = PositionSizer::new(
                app.gateway.clone(),
                app.ledger.clone(),
                app.settings.trading.clone(),
                &app.settings.quote_asset,
            );
            let request = BuyRequest {
                symbol: symbol.to_uppercase(),
                allocation,
                stop_loss_pct,
                trailing_stop_pct,
                entry_tag: tag,
                dry_run,
            };
            Ok(report(sizer.buy(&request).await?))
        }

        Command::Sell {
            symbol,
            reason,
            dry_run,
        } => {
            let outcome = app
                .closer()
                .sell(&symbol.to_uppercase(), reason.map(ExitReason::from), dry_run)
                .await?;
            Ok(report(outcome))
        }

        Command::Close {
            trade_id,
            reason,
            dry_run,
        } => {
            let outcome = app
                .closer()
                .close_by_id(&trade_id, reason.map(ExitReason::from), dry_run)
                .await?;
            Ok(report(outcome))
        }

        Command::CheckExits { symbol } => {
            let exit: Arc<dyn PositionExit> = Arc::new(app.closer());
            let evaluator =
                ExitEvaluator::new(app.gateway.clone(), app.ledger.clone(), app.resolver(), exit);
            let symbol = symbol.map(|s| s.to_uppercase());
            Ok(success(&evaluator.check(symbol.as_deref()).await?))
        }

        Command::Halt => Ok(success(&HaltSwitch::new(app.ledger.clone()).halt().await?)),
        Command::Resume => Ok(success(&HaltSwitch::new(app.ledger.clone()).resume().await?)),

        Command::Portfolio => {
            let portfolio = Portfolio::new(
                app.gateway.clone(),
                app.ledger.clone(),
                &app.settings.quote_asset,
            );
            Ok(report(portfolio.snapshot().await?))
        }

        Command::Risk => {
            let status = risk_status(
                app.gateway.clone(),
                app.ledger.clone(),
                &app.resolver(),
                &app.settings.quote_asset,
            )
            .await?;
            Ok(success(&status))
        }

        Command::Reconcile => {
            let orphan_min_value = app
                .resolver()
                .number(ConfigKey::OrphanMinValue, None)
                .await?;
            let reconciler = Reconciler::new(
                app.gateway.clone(),
                app.ledger.clone(),
                &app.settings.quote_asset,
                &app.settings.fee_asset,
                orphan_min_value,
            );
            Ok(report(reconciler.reconcile().await?))
        }

        Command::Recovery(sub) => {
            let queue = RecoveryQueue::new(app.ledger.clone());
            match sub {
                RecoveryCommand::List => Ok(success(&queue.list().await?)),
                RecoveryCommand::Retry => {
                    let retry = queue.retry_all().await?;
                    let failed = retry.failed > 0;
                    print_json(&retry);
                    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
                }
                RecoveryCommand::Discard { id } => Ok(success(&queue.discard(id).await?)),
            }
        }

        Command::Config(sub) => config_command(&app, sub).await,

        Command::Trades {
            symbol,
            open,
            period,
            limit,
        } => {
            let query = TradeQuery {
                symbol: symbol.map(|s| s.to_uppercase()),
                open_only: open,
                since: Period::parse(&period).since(chrono::Utc::now()),
                limit: Some(limit),
            };
            let trades = app.ledger.trades(&query).await?;
            Ok(success(&serde_json::json!({ "count": trades.len(), "trades": trades })))
        }

        Command::Performance { period, symbol } => {
            let analytics = Analytics::new(app.ledger.clone());
            let symbol = symbol.map(|s| s.to_uppercase());
            Ok(success(
                &analytics
                    .performance(Period::parse(&period), symbol.as_deref())
                    .await?,
            ))
        }

        Command::Analytics { period } => {
            let analytics = Analytics::new(app.ledger.clone());
            Ok(success(&analytics.full(Period::parse(&period)).await?))
        }
    }
}

async fn config_command(app: &App, command: ConfigCommand) -> anyhow::Result<ExitCode> {
    let resolver = app.resolver();

    match command {
        ConfigCommand::List => {
            let overrides = app.ledger.config_values().await?;
            let entries: Vec<_> = ConfigKey::ALL
                .into_iter()
                .map(|key| {
                    let default = resolver.defaults().value(key);
                    let value = overrides.get(key.as_str()).cloned();
                    serde_json::json!({
                        "key": key.as_str(),
                        "effective": value.clone().unwrap_or_else(|| default.clone()),
                        "default": default,
                        "overridden": value.is_some(),
                    })
                })
                .collect();
            Ok(success(&serde_json::json!({ "config": entries })))
        }
        ConfigCommand::Get { key } => {
            let key = parse_key(&key)?;
            let stored = app.ledger.config_value(key.as_str()).await?;
            let default = resolver.defaults().value(key);
            Ok(success(&serde_json::json!({
                "key": key.as_str(),
                "effective": stored.clone().unwrap_or_else(|| default.clone()),
                "default": default,
                "overridden": stored.is_some(),
            })))
        }
        ConfigCommand::Set { key, value } => {
            let key = parse_key(&key)?;
            app.ledger.set_config_value(key.as_str(), &value).await?;
            tracing::info!("Config override {} = {}", key, value);
            Ok(success(&serde_json::json!({ "key": key.as_str(), "value": value })))
        }
        ConfigCommand::Unset { key } => {
            let key = parse_key(&key)?;
            let removed = app.ledger.delete_config_value(key.as_str()).await?;
            Ok(success(&serde_json::json!({ "key": key.as_str(), "removed": removed })))
        }
    }
}

fn parse_key(raw: &str) -> anyhow::Result<ConfigKey> {
    match ConfigKey::parse(raw) {
        Some(key) => Ok(key),
        None => {
            let known: Vec<&str> = ConfigKey::ALL.iter().map(|k| k.as_str()).collect();
            bail!("unknown config key {raw}; expected one of {}", known.join(", "))
        }
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("Cannot render result: {}", e),
    }
}

/// Print a core outcome; refusals exit 1
fn report<T: Serialize>(outcome: Outcome<T>) -> ExitCode {
    print_json(&outcome);
    match outcome.refusal() {
        None => ExitCode::SUCCESS,
        Some(refusal) => {
            tracing::warn!("Refused: {}", refusal);
            ExitCode::FAILURE
        }
    }
}

fn success<T: Serialize>(value: &T) -> ExitCode {
    print_json(value);
    ExitCode::SUCCESS
}
