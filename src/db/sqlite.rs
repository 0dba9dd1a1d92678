use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use super::{Ledger, RecoveryItem, TradeQuery};
use crate::error::Error;
use crate::models::{Direction, ExitReason, Side, TradeRecord, TradeUpdate};
use crate::Result;

const TRADE_COLUMNS: &str = r#"
    trade_id, symbol, side, direction, quantity, entry_price, exit_price,
    total_value, pnl, pnl_percent, fee_quote_value, stop_loss,
    trailing_stop_price, trailing_stop_pct, highest_price, entry_tag,
    exit_reason, atr, is_open, holding_period_ms, opened_at, closed_at,
    created_at, updated_at
"#;

/// SQLite-backed ledger
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (creating if missing) a SQLite database and run migrations
    ///
    /// # Arguments
    /// * `database_url` - e.g. "sqlite:///home/me/.spotguard/data/trading.db"
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Opened ledger at {}", database_url);

        Ok(Self { pool })
    }

    /// Private in-memory database (one connection, kept for the pool's life)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// A zero-row update on an OPEN-only statement: closed rows are a no-op
    async fn ensure_exists(&self, trade_id: &str) -> Result<()> {
        match self.trade(trade_id).await? {
            Some(trade) if !trade.is_open => {
                tracing::debug!("Trade {} already closed, update skipped", trade_id);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("trade {}", trade_id))),
        }
    }
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRecord> {
    let side: String = row.get("side");
    let is_open: i64 = row.get("is_open");
    let exit_reason: Option<String> = row.get("exit_reason");

    Ok(TradeRecord {
        trade_id: row.get("trade_id"),
        symbol: row.get("symbol"),
        side: Side::from_str(&side)?,
        direction: Direction::Long,
        quantity: row.get("quantity"),
        entry_price: row.get("entry_price"),
        exit_price: row.get("exit_price"),
        total_value: row.get("total_value"),
        pnl: row.get("pnl"),
        pnl_pct: row.get("pnl_percent"),
        fee_quote: row.get("fee_quote_value"),
        stop_loss: row.get("stop_loss"),
        trailing_stop_price: row.get("trailing_stop_price"),
        trailing_stop_pct: row.get("trailing_stop_pct"),
        highest_price: row.get("highest_price"),
        entry_tag: row.get("entry_tag"),
        exit_reason: exit_reason.map(ExitReason::from),
        atr: row.get("atr"),
        is_open: is_open != 0,
        holding_period_ms: row.get("holding_period_ms"),
        opened_at: row.get("opened_at"),
        closed_at: row.get("closed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn recovery_from_row(row: &SqliteRow) -> Result<RecoveryItem> {
    let payload: String = row.get("payload");
    let resolved: i64 = row.get("resolved");

    Ok(RecoveryItem {
        id: row.get("id"),
        payload: serde_json::from_str(&payload)?,
        reason: row.get("reason"),
        resolved: resolved != 0,
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        resolved_at: row.get("resolved_at"),
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO trades (
                trade_id, symbol, side, direction, quantity, entry_price, exit_price,
                total_value, pnl, pnl_percent, fee_quote_value, stop_loss,
                trailing_stop_price, trailing_stop_pct, highest_price, entry_tag,
                exit_reason, atr, is_open, holding_period_ms, opened_at, closed_at,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.trade_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.direction.as_str())
        .bind(trade.quantity)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.total_value)
        .bind(trade.pnl)
        .bind(trade.pnl_pct)
        .bind(trade.fee_quote)
        .bind(trade.stop_loss)
        .bind(trade.trailing_stop_price)
        .bind(trade.trailing_stop_pct)
        .bind(trade.highest_price)
        .bind(&trade.entry_tag)
        .bind(trade.exit_reason.as_ref().map(|r| r.as_str().to_string()))
        .bind(trade.atr)
        .bind(trade.is_open as i64)
        .bind(trade.holding_period_ms)
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .bind(trade.created_at.unwrap_or(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Inserted trade {} for {}", trade.trade_id, trade.symbol);

        Ok(())
    }

    async fn update_trade(&self, trade_id: &str, update: &TradeUpdate) -> Result<()> {
        let now = Utc::now();

        let result = match update {
            // MAX() keeps both levels monotonic even if a stale ratchet is replayed
            TradeUpdate::Ratchet {
                highest_price,
                trailing_stop_price,
            } => {
                sqlx::query(
                    r#"
                    UPDATE trades
                    SET highest_price = MAX(highest_price, ?),
                        trailing_stop_price = MAX(COALESCE(trailing_stop_price, ?), ?),
                        updated_at = ?
                    WHERE trade_id = ? AND is_open = 1
                    "#,
                )
                .bind(highest_price)
                .bind(trailing_stop_price)
                .bind(trailing_stop_price)
                .bind(now)
                .bind(trade_id)
                .execute(&self.pool)
                .await?
            }
            TradeUpdate::Close(close) => {
                sqlx::query(
                    r#"
                    UPDATE trades
                    SET is_open = 0,
                        exit_price = ?,
                        closed_at = ?,
                        pnl = ?,
                        pnl_percent = ?,
                        fee_quote_value = ?,
                        exit_reason = ?,
                        holding_period_ms = ?,
                        updated_at = ?
                    WHERE trade_id = ? AND is_open = 1
                    "#,
                )
                .bind(close.exit_price)
                .bind(close.closed_at)
                .bind(close.pnl)
                .bind(close.pnl_pct)
                .bind(close.fee_quote)
                .bind(close.exit_reason.as_str())
                .bind(close.holding_period_ms)
                .bind(now)
                .bind(trade_id)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return self.ensure_exists(trade_id).await;
        }

        Ok(())
    }

    async fn trade(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        let sql = format!("SELECT {} FROM trades WHERE trade_id = ?", TRADE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(trade_from_row).transpose()
    }

    async fn open_trade_for_symbol(&self, symbol: &str) -> Result<Option<TradeRecord>> {
        let sql = format!(
            "SELECT {} FROM trades WHERE symbol = ? AND is_open = 1 ORDER BY id DESC LIMIT 1",
            TRADE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(trade_from_row).transpose()
    }

    async fn open_trades(&self) -> Result<Vec<TradeRecord>> {
        let sql = format!(
            "SELECT {} FROM trades WHERE is_open = 1 ORDER BY id ASC",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn trades(&self, query: &TradeQuery) -> Result<Vec<TradeRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM trades WHERE 1 = 1", TRADE_COLUMNS));

        if let Some(symbol) = &query.symbol {
            builder.push(" AND symbol = ").push_bind(symbol.clone());
        }
        if query.open_only {
            builder.push(" AND is_open = 1");
        }
        if let Some(since) = query.since {
            builder.push(" AND opened_at >= ").push_bind(since);
        }
        builder.push(" ORDER BY opened_at DESC, id DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn closed_trades(
        &self,
        since: Option<DateTime<Utc>>,
        symbol: Option<&str>,
    ) -> Result<Vec<TradeRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM trades WHERE is_open = 0", TRADE_COLUMNS));

        if let Some(since) = since {
            builder.push(" AND closed_at >= ").push_bind(since);
        }
        if let Some(symbol) = symbol {
            builder.push(" AND symbol = ").push_bind(symbol.to_string());
        }
        builder.push(" ORDER BY closed_at ASC, id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn config_value(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("value")))
    }

    async fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_config_value(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM config WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn config_values(&self) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect())
    }

    async fn push_recovery(&self, reason: &str, payload: &serde_json::Value) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO recovery_queue (payload, reason, resolved, created_at)
            VALUES (?, ?, 0, ?)
            "#,
        )
        .bind(serde_json::to_string(payload)?)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn pending_recovery(&self) -> Result<Vec<RecoveryItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, reason, resolved, last_error, created_at, resolved_at
            FROM recovery_queue
            WHERE resolved = 0
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(recovery_from_row).collect()
    }

    async fn resolve_recovery(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recovery_queue
            SET resolved = 1, resolved_at = ?, last_error = NULL
            WHERE id = ? AND resolved = 0
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn note_recovery_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE recovery_queue SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn discard_recovery(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM recovery_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
