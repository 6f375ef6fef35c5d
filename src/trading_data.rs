// =============================================================================
// Trading Data Store (C3) — SQLite-backed trade/order ledger.
// =============================================================================
//
// Every public method swallows storage errors internally (logs, returns a
// benign default) because the trading loop must never fault on a store
// error. In-memory drawdown trackers hold the running max_unrealized
// profit/loss and a capped snapshot ring per open trade; these are flushed
// to the `trades` row whenever an extremum moves and are evicted on close.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, instrument, warn};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id              TEXT UNIQUE NOT NULL,
    strategy_id           TEXT NOT NULL,
    instrument_id         TEXT NOT NULL,
    trade_type            TEXT,
    entry_time            TEXT NOT NULL,
    entry_price           REAL NOT NULL,
    quantity              REAL NOT NULL,
    direction             TEXT,
    exit_time             TEXT,
    exit_price            REAL,
    exit_reason           TEXT,
    gross_pnl             REAL,
    commission            REAL DEFAULT 0,
    net_pnl               REAL,
    result                TEXT,
    duration_seconds      INTEGER,
    max_unrealized_profit REAL DEFAULT 0,
    max_unrealized_loss   REAL DEFAULT 0,
    max_loss_timestamp    TEXT,
    snapshots             TEXT,
    strikes               TEXT,
    status                TEXT NOT NULL DEFAULT 'OPEN',
    raw_data              TEXT
);

CREATE TABLE IF NOT EXISTS orders (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id       TEXT NOT NULL,
    trade_id          TEXT,
    instrument_id     TEXT NOT NULL,
    trade_type        TEXT,
    trade_direction   TEXT,
    order_side        TEXT,
    order_type        TEXT,
    quantity          REAL,
    status            TEXT,
    price_limit       REAL,
    submitted_time    TEXT,
    client_order_id   TEXT,
    exchange_order_id TEXT,
    filled_time       TEXT,
    filled_quantity   REAL,
    filled_price      REAL,
    commission        REAL DEFAULT 0,
    raw_data          TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_exchange_order_id ON orders(exchange_order_id);
CREATE INDEX IF NOT EXISTS idx_orders_strategy     ON orders(strategy_id);
CREATE INDEX IF NOT EXISTS idx_orders_trade_id     ON orders(trade_id);
CREATE INDEX IF NOT EXISTS idx_orders_filled_time  ON orders(filled_time);
CREATE INDEX IF NOT EXISTS idx_trades_strategy     ON trades(strategy_id);
CREATE INDEX IF NOT EXISTS idx_trades_entry_time   ON trades(entry_time);
CREATE INDEX IF NOT EXISTS idx_trades_status       ON trades(status);
"#;

const SNAPSHOT_CAP: usize = 1000;

#[derive(Debug, Clone, Default)]
struct DrawdownTracker {
    max_unrealized_profit: f64,
    max_unrealized_loss: f64,
    max_loss_timestamp: Option<String>,
    snapshots: Vec<(String, f64)>,
    entry_price: f64,
    quantity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    pub trade_id: String,
    pub strategy_id: String,
    pub instrument_id: String,
    pub trade_type: Option<String>,
    pub entry_time: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub direction: Option<String>,
    pub exit_time: Option<String>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub gross_pnl: Option<f64>,
    pub commission: f64,
    pub net_pnl: Option<f64>,
    pub result: Option<String>,
    pub duration_seconds: Option<i64>,
    pub max_unrealized_profit: f64,
    pub max_unrealized_loss: f64,
    pub status: String,
}

pub struct TradingDataStore {
    conn: Arc<Mutex<Connection>>,
    trackers: Mutex<HashMap<String, DrawdownTracker>>,
}

impl TradingDataStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            trackers: Mutex::new(HashMap::new()),
        })
    }

    #[instrument(skip(self))]
    pub fn start_trade(
        &self,
        trade_id: &str,
        strategy_id: &str,
        instrument_id: &str,
        trade_type: Option<&str>,
        entry_price: f64,
        quantity: f64,
        direction: Option<&str>,
        entry_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), TradingDataError> {
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM trades WHERE trade_id = ?1",
                params![trade_id],
                |row| row.get(0),
            )
            .ok();
        if existing.is_some() {
            return Err(TradingDataError::AlreadyExists);
        }
        let result = conn.execute(
            "INSERT INTO trades (trade_id, strategy_id, instrument_id, trade_type, entry_time, \
             entry_price, quantity, direction, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'OPEN')",
            params![
                trade_id,
                strategy_id,
                instrument_id,
                trade_type,
                entry_time.to_rfc3339(),
                entry_price,
                quantity,
                direction,
            ],
        );
        if let Err(e) = result {
            error!(trade_id, error = %e, "failed to insert trade");
            return Err(TradingDataError::Storage);
        }
        drop(conn);
        self.trackers.lock().insert(
            trade_id.to_string(),
            DrawdownTracker {
                entry_price,
                quantity,
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Monotonically updates the running profit/loss extrema for an open
    /// trade and appends to its capped snapshot ring.
    #[instrument(skip(self))]
    pub fn update_trade_metrics(&self, trade_id: &str, current_pnl: f64, ts: Option<chrono::DateTime<chrono::Utc>>) {
        let ts = ts.unwrap_or_else(chrono::Utc::now);
        let mut trackers = self.trackers.lock();
        let tracker = match trackers.get_mut(trade_id) {
            Some(t) => t,
            None => {
                if self.load_trade(trade_id).is_none() {
                    warn!(trade_id, "update_trade_metrics: trade not found");
                    return;
                }
                trackers.insert(trade_id.to_string(), DrawdownTracker::default());
                trackers.get_mut(trade_id).unwrap()
            }
        };

        let mut changed = false;
        if current_pnl > tracker.max_unrealized_profit {
            tracker.max_unrealized_profit = current_pnl;
            changed = true;
        }
        if current_pnl < tracker.max_unrealized_loss {
            tracker.max_unrealized_loss = current_pnl;
            tracker.max_loss_timestamp = Some(ts.to_rfc3339());
            changed = true;
        }
        tracker.snapshots.push((ts.to_rfc3339(), current_pnl));
        if tracker.snapshots.len() > SNAPSHOT_CAP {
            let excess = tracker.snapshots.len() - SNAPSHOT_CAP;
            tracker.snapshots.drain(0..excess);
        }

        if changed {
            let profit = tracker.max_unrealized_profit;
            let loss = tracker.max_unrealized_loss;
            let loss_ts = tracker.max_loss_timestamp.clone();
            let snapshots = serde_json::to_string(&tracker.snapshots).unwrap_or_default();
            drop(trackers);
            let conn = self.conn.lock();
            if let Err(e) = conn.execute(
                "UPDATE trades SET max_unrealized_profit = ?1, max_unrealized_loss = ?2, \
                 max_loss_timestamp = ?3, snapshots = ?4 WHERE trade_id = ?5",
                params![profit, loss, loss_ts, snapshots, trade_id],
            ) {
                error!(trade_id, error = %e, "failed to persist drawdown metrics");
            }
        }
    }

    /// `gross = (exit − entry) × 100 × qty`; this single formula holds for
    /// both single-leg and spread trades under the signed-credit/debit
    /// convention used at entry and exit.
    #[instrument(skip(self))]
    pub fn close_trade(
        &self,
        trade_id: &str,
        exit_price: f64,
        exit_reason: &str,
        exit_time: chrono::DateTime<chrono::Utc>,
        commission: f64,
    ) -> Result<(), TradingDataError> {
        let row = self.load_trade(trade_id).ok_or(TradingDataError::NotFound)?;
        let gross = (exit_price - row.entry_price) * 100.0 * row.quantity;
        let net = gross - commission;
        let result = if net > 0.0 {
            "WIN"
        } else if net < 0.0 {
            "LOSS"
        } else {
            "BREAKEVEN"
        };
        let entry_time = chrono::DateTime::parse_from_rfc3339(&row.entry_time)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or(exit_time);
        let duration = (exit_time - entry_time).num_seconds();

        let tracker = self.trackers.lock().remove(trade_id).unwrap_or_default();
        let snapshots = serde_json::to_string(&tracker.snapshots).unwrap_or_default();

        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE trades SET exit_time = ?1, exit_price = ?2, exit_reason = ?3, gross_pnl = ?4, \
             commission = ?5, net_pnl = ?6, result = ?7, duration_seconds = ?8, \
             max_unrealized_profit = ?9, max_unrealized_loss = ?10, snapshots = ?11, status = 'CLOSED' \
             WHERE trade_id = ?12",
            params![
                exit_time.to_rfc3339(),
                exit_price,
                exit_reason,
                gross,
                commission,
                net,
                result,
                duration,
                tracker.max_unrealized_profit,
                tracker.max_unrealized_loss,
                snapshots,
                trade_id,
            ],
        );
        match updated {
            Ok(0) => Err(TradingDataError::NotFound),
            Ok(_) => Ok(()),
            Err(e) => {
                error!(trade_id, error = %e, "failed to close trade");
                Err(TradingDataError::Storage)
            }
        }
    }

    /// Inserts an order row. If `exchange_order_id` collides with an
    /// existing row (the unique index fires), returns that row's id
    /// without raising.
    #[instrument(skip(self, raw))]
    pub fn record_order(
        &self,
        strategy_id: &str,
        instrument_id: &str,
        direction: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        status: &str,
        submitted_time: chrono::DateTime<chrono::Utc>,
        exchange_order_id: Option<&str>,
        client_order_id: Option<&str>,
        trade_id: Option<&str>,
        raw: Option<&Value>,
    ) -> Option<i64> {
        let conn = self.conn.lock();
        let raw_json = raw.map(|v| v.to_string());
        let result = conn.execute(
            "INSERT INTO orders (strategy_id, trade_id, instrument_id, trade_direction, order_side, \
             order_type, quantity, status, submitted_time, client_order_id, exchange_order_id, raw_data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                strategy_id,
                trade_id,
                instrument_id,
                direction,
                side,
                order_type,
                quantity,
                status,
                submitted_time.to_rfc3339(),
                client_order_id,
                exchange_order_id,
                raw_json,
            ],
        );
        match result {
            Ok(_) => Some(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                exchange_order_id.and_then(|xid| {
                    conn.query_row(
                        "SELECT id FROM orders WHERE exchange_order_id = ?1",
                        params![xid],
                        |row| row.get(0),
                    )
                    .ok()
                })
            }
            Err(e) => {
                error!(strategy_id, error = %e, "failed to record order");
                None
            }
        }
    }

    #[instrument(skip(self))]
    pub fn update_order(
        &self,
        exchange_order_id: &str,
        status: Option<&str>,
        filled_time: Option<chrono::DateTime<chrono::Utc>>,
        filled_quantity: Option<f64>,
        filled_price: Option<f64>,
        commission: Option<f64>,
    ) -> bool {
        let conn = self.conn.lock();
        let mut sets = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = status {
            sets.push("status = ?");
            values.push(Box::new(status.to_string()));
        }
        if let Some(filled_time) = filled_time {
            sets.push("filled_time = ?");
            values.push(Box::new(filled_time.to_rfc3339()));
        }
        if let Some(filled_quantity) = filled_quantity {
            sets.push("filled_quantity = ?");
            values.push(Box::new(filled_quantity));
        }
        if let Some(filled_price) = filled_price {
            sets.push("filled_price = ?");
            values.push(Box::new(filled_price));
        }
        if let Some(commission) = commission {
            sets.push("commission = ?");
            values.push(Box::new(commission));
        }
        if sets.is_empty() {
            return false;
        }
        let sql = format!(
            "UPDATE orders SET {} WHERE exchange_order_id = ?",
            sets.join(", ")
        );
        values.push(Box::new(exchange_order_id.to_string()));
        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        match conn.execute(&sql, params.as_slice()) {
            Ok(n) => n > 0,
            Err(e) => {
                error!(exchange_order_id, error = %e, "failed to update order");
                false
            }
        }
    }

    pub fn get_open_trades(&self, strategy_id: Option<&str>) -> Vec<TradeRow> {
        let conn = self.conn.lock();
        let sql = match strategy_id {
            Some(_) => "SELECT * FROM trades WHERE status = 'OPEN' AND strategy_id = ?1",
            None => "SELECT * FROM trades WHERE status = 'OPEN'",
        };
        let result = if let Some(sid) = strategy_id {
            conn.prepare(sql).and_then(|mut stmt| {
                let rows = stmt.query_map(params![sid], row_to_trade)?.flatten().collect::<Vec<_>>();
                Ok(rows)
            })
        } else {
            conn.prepare(sql)
                .and_then(|mut stmt| Ok(stmt.query_map([], row_to_trade)?.flatten().collect::<Vec<_>>()))
        };
        result.unwrap_or_else(|e: rusqlite::Error| {
            error!(error = %e, "failed to list open trades");
            Vec::new()
        })
    }

    pub fn get_trade(&self, trade_id: &str) -> Option<TradeRow> {
        self.load_trade(trade_id)
    }

    /// Most recent `limit` trades (open or closed), optionally scoped to one
    /// strategy, newest first.
    pub fn list_trades(&self, strategy_id: Option<&str>, limit: u32) -> Vec<TradeRow> {
        let conn = self.conn.lock();
        let result = match strategy_id {
            Some(sid) => conn
                .prepare("SELECT * FROM trades WHERE strategy_id = ?1 ORDER BY entry_time DESC LIMIT ?2")
                .and_then(|mut stmt| {
                    Ok(stmt.query_map(params![sid, limit], row_to_trade)?.flatten().collect::<Vec<_>>())
                }),
            None => conn
                .prepare("SELECT * FROM trades ORDER BY entry_time DESC LIMIT ?1")
                .and_then(|mut stmt| Ok(stmt.query_map(params![limit], row_to_trade)?.flatten().collect::<Vec<_>>())),
        };
        result.unwrap_or_else(|e: rusqlite::Error| {
            error!(error = %e, "failed to list trades");
            Vec::new()
        })
    }

    /// Aggregate stats across every strategy that has at least one closed
    /// trade.
    pub fn get_all_strategy_stats(&self) -> Value {
        let strategy_ids: Vec<String> = {
            let conn = self.conn.lock();
            conn.prepare("SELECT DISTINCT strategy_id FROM trades")
                .and_then(|mut stmt| Ok(stmt.query_map([], |row| row.get::<_, String>(0))?.flatten().collect()))
                .unwrap_or_else(|e: rusqlite::Error| {
                    error!(error = %e, "failed to list strategy ids");
                    Vec::new()
                })
        };
        let per_strategy: Vec<Value> = strategy_ids.iter().map(|id| self.get_strategy_stats(id)).collect();
        serde_json::json!({"strategies": per_strategy})
    }

    pub fn get_trade_orders(&self, trade_id: &str) -> Vec<Value> {
        let conn = self.conn.lock();
        let result = conn.prepare("SELECT * FROM orders WHERE trade_id = ?1").and_then(|mut stmt| {
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt
                .query_map(params![trade_id], move |row| row_to_json(row, &names))?
                .flatten()
                .collect::<Vec<_>>();
            Ok(rows)
        });
        result.unwrap_or_else(|e: rusqlite::Error| {
            error!(trade_id, error = %e, "failed to list trade orders");
            Vec::new()
        })
    }

    pub fn get_strategy_stats(&self, strategy_id: &str) -> Value {
        let conn = self.conn.lock();
        let stats = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(net_pnl), 0), COALESCE(AVG(net_pnl), 0), \
             SUM(CASE WHEN net_pnl > 0 THEN 1 ELSE 0 END) \
             FROM trades WHERE strategy_id = ?1 AND status = 'CLOSED'",
            params![strategy_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        );
        match stats {
            Ok((total, net_pnl, avg_pnl, wins)) => {
                let win_rate = if total > 0 { wins as f64 / total as f64 } else { 0.0 };
                serde_json::json!({
                    "strategy_id": strategy_id,
                    "total_trades": total,
                    "total_net_pnl": net_pnl,
                    "average_pnl": avg_pnl,
                    "win_rate": win_rate,
                    "wins": wins,
                })
            }
            Err(e) => {
                error!(strategy_id, error = %e, "failed to compute strategy stats");
                serde_json::json!({"strategy_id": strategy_id, "total_trades": 0})
            }
        }
    }

    pub fn get_drawdown_analysis(&self, strategy_id: &str) -> Value {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT COALESCE(MIN(max_unrealized_loss), 0), COALESCE(MAX(max_unrealized_profit), 0) \
             FROM trades WHERE strategy_id = ?1",
            params![strategy_id],
            |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
        );
        match result {
            Ok((worst_drawdown, best_runup)) => serde_json::json!({
                "strategy_id": strategy_id,
                "worst_drawdown": worst_drawdown,
                "best_runup": best_runup,
            }),
            Err(e) => {
                error!(strategy_id, error = %e, "failed to compute drawdown analysis");
                serde_json::json!({"strategy_id": strategy_id})
            }
        }
    }

    pub fn cancel_trade(&self, trade_id: &str) {
        self.trackers.lock().remove(trade_id);
    }

    pub fn delete_trade(&self, trade_id: &str) {
        self.trackers.lock().remove(trade_id);
        let conn = self.conn.lock();
        if let Err(e) = conn.execute("DELETE FROM orders WHERE trade_id = ?1", params![trade_id]) {
            error!(trade_id, error = %e, "failed to delete trade orders");
        }
        if let Err(e) = conn.execute(
            "DELETE FROM trades WHERE trade_id = ?1 AND status = 'OPEN'",
            params![trade_id],
        ) {
            error!(trade_id, error = %e, "failed to delete trade");
        }
    }

    /// Proportionally rescales the drawdown extrema for a partial fill and
    /// patches the matching ENTRY order's filled quantity.
    #[instrument(skip(self))]
    pub fn update_trade_quantity(&self, trade_id: &str, actual_qty: f64) -> Result<(), TradingDataError> {
        let row = self.load_trade(trade_id).ok_or(TradingDataError::NotFound)?;
        if row.quantity <= 0.0 {
            return Err(TradingDataError::Storage);
        }
        let ratio = actual_qty / row.quantity;
        let new_max_profit = row.max_unrealized_profit * ratio;
        let new_max_loss = row.max_unrealized_loss * ratio;

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET quantity = ?1, max_unrealized_profit = ?2, max_unrealized_loss = ?3 \
             WHERE trade_id = ?4",
            params![actual_qty, new_max_profit, new_max_loss, trade_id],
        )
        .map_err(|e| {
            error!(trade_id, error = %e, "failed to rescale trade quantity");
            TradingDataError::Storage
        })?;
        conn.execute(
            "UPDATE orders SET filled_quantity = ?1 WHERE trade_id = ?2 AND trade_direction = 'ENTRY'",
            params![actual_qty, trade_id],
        )
        .map_err(|e| {
            error!(trade_id, error = %e, "failed to patch entry order quantity");
            TradingDataError::Storage
        })?;
        Ok(())
    }

    fn load_trade(&self, trade_id: &str) -> Option<TradeRow> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM trades WHERE trade_id = ?1", params![trade_id], row_to_trade)
            .ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingDataError {
    AlreadyExists,
    NotFound,
    Storage,
}

impl std::fmt::Display for TradingDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "trade already exists"),
            Self::NotFound => write!(f, "trade not found"),
            Self::Storage => write!(f, "storage error"),
        }
    }
}

impl std::error::Error for TradingDataError {}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<TradeRow> {
    Ok(TradeRow {
        trade_id: row.get("trade_id")?,
        strategy_id: row.get("strategy_id")?,
        instrument_id: row.get("instrument_id")?,
        trade_type: row.get("trade_type")?,
        entry_time: row.get("entry_time")?,
        entry_price: row.get("entry_price")?,
        quantity: row.get("quantity")?,
        direction: row.get("direction")?,
        exit_time: row.get("exit_time")?,
        exit_price: row.get("exit_price")?,
        exit_reason: row.get("exit_reason")?,
        gross_pnl: row.get("gross_pnl")?,
        commission: row.get("commission")?,
        net_pnl: row.get("net_pnl")?,
        result: row.get("result")?,
        duration_seconds: row.get("duration_seconds")?,
        max_unrealized_profit: row.get("max_unrealized_profit")?,
        max_unrealized_loss: row.get("max_unrealized_loss")?,
        status: row.get("status")?,
    })
}

fn row_to_json(row: &rusqlite::Row, names: &[String]) -> rusqlite::Result<Value> {
    let mut map = serde_json::Map::new();
    for (i, name) in names.iter().enumerate() {
        let value: Value = match row.get_ref(i)? {
            rusqlite::types::ValueRef::Null => Value::Null,
            rusqlite::types::ValueRef::Integer(n) => Value::from(n),
            rusqlite::types::ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            rusqlite::types::ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
            rusqlite::types::ValueRef::Blob(_) => Value::Null,
        };
        map.insert(name.clone(), value);
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TradingDataStore {
        TradingDataStore::open(":memory:").unwrap()
    }

    #[test]
    fn start_trade_rejects_duplicate_id() {
        let store = store();
        store
            .start_trade("t1", "orb-1", "SPX.CBOE", None, -2.5, 1.0, Some("CREDIT"), chrono::Utc::now())
            .unwrap();
        let err = store
            .start_trade("t1", "orb-1", "SPX.CBOE", None, -2.5, 1.0, Some("CREDIT"), chrono::Utc::now())
            .unwrap_err();
        assert!(matches!(err, TradingDataError::AlreadyExists));
    }

    #[test]
    fn update_trade_metrics_is_monotonic() {
        let store = store();
        store
            .start_trade("t1", "orb-1", "SPX.CBOE", None, -2.5, 1.0, Some("CREDIT"), chrono::Utc::now())
            .unwrap();
        store.update_trade_metrics("t1", 10.0, None);
        store.update_trade_metrics("t1", 5.0, None);
        store.update_trade_metrics("t1", -8.0, None);
        store.update_trade_metrics("t1", -3.0, None);
        let row = store.get_trade("t1").unwrap();
        assert_eq!(row.max_unrealized_profit, 10.0);
        assert_eq!(row.max_unrealized_loss, -8.0);
    }

    #[test]
    fn close_trade_computes_gross_and_net_pnl() {
        let store = store();
        store
            .start_trade("t1", "orb-1", "SPX.CBOE", None, -2.5, 1.0, Some("CREDIT"), chrono::Utc::now())
            .unwrap();
        store.close_trade("t1", -0.5, "TAKE_PROFIT", chrono::Utc::now(), 1.3).unwrap();
        let row = store.get_trade("t1").unwrap();
        assert_eq!(row.status, "CLOSED");
        assert_eq!(row.gross_pnl, Some(200.0));
        assert_eq!(row.net_pnl, Some(198.7));
        assert_eq!(row.result.as_deref(), Some("WIN"));
    }

    #[test]
    fn record_order_is_idempotent_on_exchange_id() {
        let store = store();
        let first = store.record_order(
            "orb-1",
            "SPX.CBOE",
            "ENTRY",
            "SELL",
            "LIMIT",
            1.0,
            "SUBMITTED",
            chrono::Utc::now(),
            Some("X-1"),
            Some("C-1"),
            None,
            None,
        );
        let second = store.record_order(
            "orb-1",
            "SPX.CBOE",
            "ENTRY",
            "SELL",
            "LIMIT",
            1.0,
            "SUBMITTED",
            chrono::Utc::now(),
            Some("X-1"),
            Some("C-2"),
            None,
            None,
        );
        assert_eq!(first, second);
    }

    #[test]
    fn update_trade_quantity_rescales_extrema_and_entry_order() {
        let store = store();
        store
            .start_trade("t1", "orb-1", "SPX.CBOE", None, -2.5, 4.0, Some("CREDIT"), chrono::Utc::now())
            .unwrap();
        store.update_trade_metrics("t1", 40.0, None);
        store.record_order(
            "orb-1",
            "SPX.CBOE",
            "ENTRY",
            "SELL",
            "LIMIT",
            4.0,
            "FILLED",
            chrono::Utc::now(),
            Some("X-1"),
            None,
            Some("t1"),
            None,
        );
        store.update_trade_quantity("t1", 2.0).unwrap();
        let row = store.get_trade("t1").unwrap();
        assert_eq!(row.quantity, 2.0);
        assert_eq!(row.max_unrealized_profit, 20.0);
    }

    #[test]
    fn delete_trade_removes_open_row_and_orders() {
        let store = store();
        store
            .start_trade("t1", "orb-1", "SPX.CBOE", None, -2.5, 1.0, Some("CREDIT"), chrono::Utc::now())
            .unwrap();
        store.delete_trade("t1");
        assert!(store.get_trade("t1").is_none());
    }
}
