//! SQLite storage adapter.
//!
//! Durable record of every trade plus the append-only event log. A single
//! database file with WAL journaling so the dashboard can read while the
//! engine writes.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::domain::{Event, ExitType, Trade, TradeStatus};
use crate::error::{CortoError, Result};

/// Aggregate PnL over closed trades, served by `GET /api/status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PnlSummary {
    pub closed_trades: i64,
    pub wins: i64,
    pub pnl_total_usdt: Decimal,
    pub pnl_today_usdt: Decimal,
    pub trades_today: i64,
    pub error_trades: i64,
}

/// SQLite storage adapter
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file and connection pool.
    pub async fn new(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(CortoError::Database)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(path, "Connected to SQLite");
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(CortoError::Database)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== Trades ====================

    /// Full-row upsert. Applying the same trade twice leaves the row
    /// byte-identical.
    pub async fn save_trade(&self, t: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                trade_id, pair, signal_ts, signal_data,
                entry_order_id, entry_price, entry_quantity, entry_fill_ts, entry_commission,
                tp_order_id, sl_order_id, tp_trigger_price, sl_trigger_price,
                exit_price, exit_fill_ts, exit_type, exit_commission,
                pnl_usdt, pnl_pct, fees_usdt,
                status, error_message, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                    ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
            ON CONFLICT (trade_id) DO UPDATE SET
                pair             = excluded.pair,
                signal_ts        = excluded.signal_ts,
                signal_data      = excluded.signal_data,
                entry_order_id   = excluded.entry_order_id,
                entry_price      = excluded.entry_price,
                entry_quantity   = excluded.entry_quantity,
                entry_fill_ts    = excluded.entry_fill_ts,
                entry_commission = excluded.entry_commission,
                tp_order_id      = excluded.tp_order_id,
                sl_order_id      = excluded.sl_order_id,
                tp_trigger_price = excluded.tp_trigger_price,
                sl_trigger_price = excluded.sl_trigger_price,
                exit_price       = excluded.exit_price,
                exit_fill_ts     = excluded.exit_fill_ts,
                exit_type        = excluded.exit_type,
                exit_commission  = excluded.exit_commission,
                pnl_usdt         = excluded.pnl_usdt,
                pnl_pct          = excluded.pnl_pct,
                fees_usdt        = excluded.fees_usdt,
                status           = excluded.status,
                error_message    = excluded.error_message,
                created_at       = excluded.created_at,
                updated_at       = excluded.updated_at
            "#,
        )
        .bind(&t.trade_id)
        .bind(&t.pair)
        .bind(&t.signal_ts)
        .bind(t.signal_data.to_string())
        .bind(t.entry_order_id)
        .bind(t.entry_price.map(|d| d.to_string()))
        .bind(t.entry_quantity.map(|d| d.to_string()))
        .bind(t.entry_fill_ts.map(|ts| ts.to_rfc3339()))
        .bind(t.entry_commission.map(|d| d.to_string()))
        .bind(t.tp_order_id)
        .bind(t.sl_order_id)
        .bind(t.tp_trigger_price.map(|d| d.to_string()))
        .bind(t.sl_trigger_price.map(|d| d.to_string()))
        .bind(t.exit_price.map(|d| d.to_string()))
        .bind(t.exit_fill_ts.map(|ts| ts.to_rfc3339()))
        .bind(t.exit_type.map(|e| e.as_str().to_string()))
        .bind(t.exit_commission.map(|d| d.to_string()))
        .bind(t.pnl_usdt.map(|d| d.to_string()))
        .bind(t.pnl_pct.map(|d| d.to_string()))
        .bind(t.fees_usdt.map(|d| d.to_string()))
        .bind(t.status.as_str())
        .bind(&t.error_message)
        .bind(t.created_at.to_rfc3339())
        .bind(t.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(trade_id = %t.short_id(), status = %t.status, "Trade saved");
        Ok(())
    }

    /// Every trade whose status is not terminal, for startup reconciliation.
    pub async fn load_active_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM trades
            WHERE status NOT IN ('closed', 'not_executed', 'error')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trade).collect()
    }

    pub async fn get_trade(&self, trade_id: &str) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE trade_id = ?1")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_trade).transpose()
    }

    pub async fn list_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trade).collect()
    }

    /// PnL aggregates over closed trades plus the ERROR-trade count.
    pub async fn pnl_summary(&self) -> Result<PnlSummary> {
        let rows = sqlx::query(
            "SELECT pnl_usdt, exit_fill_ts FROM trades WHERE status = 'closed'",
        )
        .fetch_all(&self.pool)
        .await?;

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut summary = PnlSummary::default();

        for row in &rows {
            summary.closed_trades += 1;
            let pnl = parse_decimal(row.get::<Option<String>, _>("pnl_usdt"))?
                .unwrap_or(Decimal::ZERO);
            summary.pnl_total_usdt += pnl;
            if pnl > Decimal::ZERO {
                summary.wins += 1;
            }
            let exit_ts: Option<String> = row.get("exit_fill_ts");
            if exit_ts.map(|ts| ts.starts_with(&today)).unwrap_or(false) {
                summary.pnl_today_usdt += pnl;
                summary.trades_today += 1;
            }
        }

        let error_row =
            sqlx::query("SELECT COUNT(*) AS n FROM trades WHERE status = 'error'")
                .fetch_one(&self.pool)
                .await?;
        summary.error_trades = error_row.get("n");

        Ok(summary)
    }

    // ==================== Events ====================

    /// Append an event to the log. Ids are monotonic; nothing is ever
    /// updated or deleted.
    pub async fn append_event(&self, ev: &Event) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO events (trade_id, event_type, details, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING event_id
            "#,
        )
        .bind(&ev.trade_id)
        .bind(&ev.event_type)
        .bind(ev.details.to_string())
        .bind(ev.timestamp.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("event_id"))
    }

    pub async fn trade_events(&self, trade_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE trade_id = ?1 ORDER BY event_id ASC",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    pub async fn recent_events(&self, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT * FROM events ORDER BY event_id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    pub async fn last_error_event(&self) -> Result<Option<Event>> {
        let row = sqlx::query(
            "SELECT * FROM events WHERE event_type = 'error' ORDER BY event_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_event).transpose()
    }
}

fn parse_decimal(value: Option<String>) -> Result<Option<Decimal>> {
    match value {
        None => Ok(None),
        Some(s) => Decimal::from_str(&s)
            .map(Some)
            .map_err(|e| CortoError::Internal(format!("bad decimal in store: {} ({})", s, e))),
    }
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| CortoError::Internal(format!("bad timestamp in store: {} ({})", s, e))),
    }
}

fn row_to_trade(row: &SqliteRow) -> Result<Trade> {
    let status: String = row.get("status");
    let status = status
        .parse::<TradeStatus>()
        .map_err(CortoError::Internal)?;
    let exit_type: Option<String> = row.get("exit_type");
    let exit_type = exit_type
        .map(|s| s.parse::<ExitType>())
        .transpose()
        .map_err(CortoError::Internal)?;
    let signal_data: String = row.get("signal_data");

    Ok(Trade {
        trade_id: row.get("trade_id"),
        pair: row.get("pair"),
        signal_ts: row.get("signal_ts"),
        signal_data: serde_json::from_str(&signal_data)?,
        entry_order_id: row.get("entry_order_id"),
        entry_price: parse_decimal(row.get("entry_price"))?,
        entry_quantity: parse_decimal(row.get("entry_quantity"))?,
        entry_fill_ts: parse_ts(row.get("entry_fill_ts"))?,
        entry_commission: parse_decimal(row.get("entry_commission"))?,
        tp_order_id: row.get("tp_order_id"),
        sl_order_id: row.get("sl_order_id"),
        tp_trigger_price: parse_decimal(row.get("tp_trigger_price"))?,
        sl_trigger_price: parse_decimal(row.get("sl_trigger_price"))?,
        exit_price: parse_decimal(row.get("exit_price"))?,
        exit_fill_ts: parse_ts(row.get("exit_fill_ts"))?,
        exit_type,
        exit_commission: parse_decimal(row.get("exit_commission"))?,
        pnl_usdt: parse_decimal(row.get("pnl_usdt"))?,
        pnl_pct: parse_decimal(row.get("pnl_pct"))?,
        fees_usdt: parse_decimal(row.get("fees_usdt"))?,
        status,
        error_message: row.get("error_message"),
        created_at: parse_ts(row.get("created_at"))?
            .ok_or_else(|| CortoError::Internal("trade row missing created_at".into()))?,
        updated_at: parse_ts(row.get("updated_at"))?
            .ok_or_else(|| CortoError::Internal("trade row missing updated_at".into()))?,
    })
}

fn row_to_event(row: &SqliteRow) -> Result<Event> {
    let details: String = row.get("details");
    Ok(Event {
        event_id: Some(row.get("event_id")),
        trade_id: row.get("trade_id"),
        event_type: row.get("event_type"),
        details: serde_json::from_str(&details)?,
        timestamp: parse_ts(row.get("timestamp"))?
            .ok_or_else(|| CortoError::Internal("event row missing timestamp".into()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, Signal};
    use rust_decimal_macros::dec;

    fn sample_trade() -> Trade {
        let signal = Signal {
            fecha_hora: "2025/06/01 12:00:00".to_string(),
            pair: "AAAUSDT".to_string(),
            rank: 1,
            close: dec!(0.5),
            mom_1h_pct: 12.5,
            mom_pct: 8.0,
            vol_ratio: 3.0,
            trades_ratio: 2.0,
            quintil: 2,
            signal_dt: Utc::now(),
        };
        Trade::from_signal(&signal)
    }

    async fn store() -> SqliteStore {
        let store = SqliteStore::new_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_trade_roundtrip() {
        let store = store().await;
        let mut trade = sample_trade();
        trade.entry_price = Some(dec!(100.00));
        trade.entry_quantity = Some(dec!(0.1));
        store.save_trade(&trade).await.unwrap();

        let loaded = store.get_trade(&trade.trade_id).await.unwrap().unwrap();
        assert_eq!(loaded.pair, trade.pair);
        assert_eq!(loaded.entry_price, Some(dec!(100.00)));
        assert_eq!(loaded.status, TradeStatus::SignalReceived);
        assert_eq!(loaded.signal_data, trade.signal_data);
    }

    #[tokio::test]
    async fn test_save_trade_idempotent() {
        let store = store().await;
        let trade = sample_trade();
        store.save_trade(&trade).await.unwrap();
        store.save_trade(&trade).await.unwrap();

        let loaded = store.list_trades(10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].updated_at, trade.updated_at);
    }

    #[tokio::test]
    async fn test_active_trades_excludes_terminal() {
        let store = store().await;
        let mut open = sample_trade();
        open.status = TradeStatus::Open;
        store.save_trade(&open).await.unwrap();

        let mut closed = sample_trade();
        closed.status = TradeStatus::Closed;
        store.save_trade(&closed).await.unwrap();

        let mut failed = sample_trade();
        failed.status = TradeStatus::NotExecuted;
        store.save_trade(&failed).await.unwrap();

        let active = store.load_active_trades().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].trade_id, open.trade_id);
    }

    #[tokio::test]
    async fn test_event_ids_monotonic() {
        let store = store().await;
        let first = store
            .append_event(&Event::new(None, EventType::Startup, serde_json::json!({})))
            .await
            .unwrap();
        let second = store
            .append_event(&Event::new(
                Some("t1"),
                EventType::Signal,
                serde_json::json!({"pair": "AAAUSDT"}),
            ))
            .await
            .unwrap();
        assert!(second > first);

        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "signal");
    }

    #[tokio::test]
    async fn test_pnl_summary() {
        let store = store().await;

        let mut winner = sample_trade();
        winner.status = TradeStatus::Closed;
        winner.pnl_usdt = Some(dec!(1.4926));
        winner.exit_fill_ts = Some(Utc::now());
        store.save_trade(&winner).await.unwrap();

        let mut loser = sample_trade();
        loser.status = TradeStatus::Closed;
        loser.pnl_usdt = Some(dec!(-6.0104));
        loser.exit_fill_ts = Some(Utc::now());
        store.save_trade(&loser).await.unwrap();

        let summary = store.pnl_summary().await.unwrap();
        assert_eq!(summary.closed_trades, 2);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.pnl_total_usdt, dec!(-4.5178));
        assert_eq!(summary.trades_today, 2);
    }
}
