// =============================================================================
// Persistence — SQLite store for trades, orders, state and history
// =============================================================================
//
// Every repository operation is one short transaction; a crash mid-write
// leaves the database at the last committed state. Decimals are stored as
// TEXT (SQLite has no decimal affinity) and parsed back on read so money
// values keep arbitrary precision. Timestamps are RFC 3339 TEXT except the
// OHLCV key, which uses epoch milliseconds for the uniqueness constraint.
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::types::{
    BalanceSnapshot, Candle, EquityPoint, Order, OrderSide, OrderStatus, OrderType, TradeCycle,
};

/// An order row together with its optional owning trade cycle.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order: Order,
    pub trade_id: Option<i64>,
}

/// Async store with per-call transactional sessions.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    // -------------------------------------------------------------------------
    // Connection & schema
    // -------------------------------------------------------------------------

    /// Open (creating if needed) the database at `url` and initialise the
    /// schema.
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // A shared in-memory database must stay on a single connection.
        let max_connections = if url.contains(":memory:") { 1 } else { pool_size };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(url, pool_size = max_connections, "persistence initialised");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                is_open INTEGER NOT NULL,
                side TEXT NOT NULL,
                open_rate TEXT NOT NULL,
                amount TEXT NOT NULL,
                open_date TEXT NOT NULL,
                close_rate TEXT,
                close_date TEXT,
                stop_loss TEXT,
                take_profit TEXT,
                profit TEXT,
                profit_pct TEXT,
                fee TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_trades_strategy_open ON trades (strategy, is_open)",
            "CREATE INDEX IF NOT EXISTS idx_trades_symbol_open ON trades (symbol, is_open)",
            "CREATE INDEX IF NOT EXISTS idx_trades_close_date ON trades (close_date)",
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL UNIQUE,
                trade_id INTEGER,
                client_order_id TEXT,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                status TEXT NOT NULL,
                price TEXT,
                amount TEXT NOT NULL,
                filled TEXT NOT NULL,
                remaining TEXT,
                cost TEXT,
                fee TEXT,
                fee_currency TEXT,
                timestamp TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_orders_status_symbol ON orders (status, symbol)",
            "CREATE INDEX IF NOT EXISTS idx_orders_trade ON orders (trade_id)",
            "CREATE TABLE IF NOT EXISTS strategy_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                state_json TEXT NOT NULL,
                version INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS balance_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                exchange TEXT NOT NULL,
                currency TEXT NOT NULL,
                total TEXT NOT NULL,
                free TEXT NOT NULL,
                used TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_balance_snapshots_key
                ON balance_snapshots (exchange, currency, timestamp)",
            "CREATE TABLE IF NOT EXISTS ohlcv_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                o TEXT NOT NULL,
                h TEXT NOT NULL,
                l TEXT NOT NULL,
                c TEXT NOT NULL,
                v TEXT NOT NULL,
                UNIQUE (exchange, symbol, timeframe, timestamp)
            )",
            "CREATE TABLE IF NOT EXISTS alert_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_type TEXT NOT NULL,
                channel TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata_json TEXT,
                delivered INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Insert or update an order keyed by its exchange id.
    pub async fn upsert_order(
        &self,
        order: &Order,
        exchange: &str,
        trade_id: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO orders (order_id, trade_id, client_order_id, exchange, symbol, side,
                                 order_type, status, price, amount, filled, remaining, cost, fee,
                                 fee_currency, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL, ?15)
             ON CONFLICT(order_id) DO UPDATE SET
                 trade_id = COALESCE(excluded.trade_id, orders.trade_id),
                 status = excluded.status,
                 filled = excluded.filled,
                 remaining = excluded.remaining,
                 cost = excluded.cost,
                 fee = COALESCE(excluded.fee, orders.fee)",
        )
        .bind(&order.id)
        .bind(trade_id)
        .bind(&order.client_order_id)
        .bind(exchange)
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.order_type.to_string())
        .bind(order.status.to_string())
        .bind(order.price.map(|d| d.to_string()))
        .bind(order.amount.to_string())
        .bind(order.filled.to_string())
        .bind(order.remaining.to_string())
        .bind(order.cost.to_string())
        .bind(order.fee.map(|d| d.to_string()))
        .bind(order.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        debug!(order_id = %order.id, status = %order.status, "order upserted");
        Ok(())
    }

    /// Update only the status/fill columns of an order.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        filled: Decimal,
        remaining: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE orders SET status = ?1, filled = ?2, remaining = ?3 WHERE order_id = ?4",
        )
        .bind(status.to_string())
        .bind(filled.to_string())
        .bind(remaining.to_string())
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT order_id, trade_id, client_order_id, symbol, side, order_type, status,
                    price, amount, filled, remaining, cost, fee, timestamp
             FROM orders WHERE order_id = ?1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(order_from_row).transpose()
    }

    /// All orders persisted as open, optionally per symbol.
    pub async fn open_order_records(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderRecord>, sqlx::Error> {
        let rows = match symbol {
            Some(sym) => {
                sqlx::query(
                    "SELECT order_id, trade_id, client_order_id, symbol, side, order_type, status,
                            price, amount, filled, remaining, cost, fee, timestamp
                     FROM orders WHERE status = 'open' AND symbol = ?1 ORDER BY timestamp",
                )
                .bind(sym)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT order_id, trade_id, client_order_id, symbol, side, order_type, status,
                            price, amount, filled, remaining, cost, fee, timestamp
                     FROM orders WHERE status = 'open' ORDER BY timestamp",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(order_from_row).collect()
    }

    // -------------------------------------------------------------------------
    // Trade cycles
    // -------------------------------------------------------------------------

    /// Insert a new (open) trade cycle and return its id.
    pub async fn create_trade_cycle(&self, cycle: &TradeCycle) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO trades (exchange, symbol, strategy, is_open, side, open_rate, amount,
                                 open_date, stop_loss, take_profit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&cycle.exchange)
        .bind(&cycle.symbol)
        .bind(&cycle.strategy)
        .bind(cycle.is_open)
        .bind(cycle.side.to_string())
        .bind(cycle.open_rate.to_string())
        .bind(cycle.amount.to_string())
        .bind(cycle.open_date.to_rfc3339())
        .bind(cycle.stop_loss.map(|d| d.to_string()))
        .bind(cycle.take_profit.map(|d| d.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Close a trade cycle, recording the exit and realised P&L.
    pub async fn close_trade_cycle(
        &self,
        trade_id: i64,
        close_rate: Decimal,
        close_date: DateTime<Utc>,
        profit: Decimal,
        profit_pct: Decimal,
        fee: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE trades SET is_open = 0, close_rate = ?1, close_date = ?2,
                               profit = ?3, profit_pct = ?4, fee = ?5
             WHERE id = ?6",
        )
        .bind(close_rate.to_string())
        .bind(close_date.to_rfc3339())
        .bind(profit.to_string())
        .bind(profit_pct.to_string())
        .bind(fee.to_string())
        .bind(trade_id)
        .execute(&self.pool)
        .await?;
        debug!(trade_id, profit = %profit, "trade cycle closed");
        Ok(())
    }

    /// Open cycles filtered by strategy and/or symbol, oldest first.
    pub async fn open_cycles(
        &self,
        strategy: Option<&str>,
        symbol: Option<&str>,
    ) -> Result<Vec<TradeCycle>, sqlx::Error> {
        let mut sql = String::from(
            "SELECT id, exchange, symbol, strategy, is_open, side, open_rate, amount, open_date,
                    close_rate, close_date, stop_loss, take_profit, profit, profit_pct, fee
             FROM trades WHERE is_open = 1",
        );
        if strategy.is_some() {
            sql.push_str(" AND strategy = ?1");
        }
        if symbol.is_some() {
            sql.push_str(if strategy.is_some() { " AND symbol = ?2" } else { " AND symbol = ?1" });
        }
        sql.push_str(" ORDER BY open_date");

        let mut query = sqlx::query(&sql);
        if let Some(s) = strategy {
            query = query.bind(s);
        }
        if let Some(s) = symbol {
            query = query.bind(s);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(cycle_from_row).collect()
    }

    /// Closed-and-open trade history, newest first, optional filters.
    pub async fn trade_history(
        &self,
        symbol: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<TradeCycle>, sqlx::Error> {
        let mut sql = String::from(
            "SELECT id, exchange, symbol, strategy, is_open, side, open_rate, amount, open_date,
                    close_rate, close_date, stop_loss, take_profit, profit, profit_pct, fee
             FROM trades WHERE 1 = 1",
        );
        let mut bind_idx = 0;
        if symbol.is_some() {
            bind_idx += 1;
            sql.push_str(&format!(" AND symbol = ?{bind_idx}"));
        }
        if since.is_some() {
            bind_idx += 1;
            sql.push_str(&format!(" AND open_date >= ?{bind_idx}"));
        }
        bind_idx += 1;
        sql.push_str(&format!(" ORDER BY open_date DESC LIMIT ?{bind_idx}"));

        let mut query = sqlx::query(&sql);
        if let Some(s) = symbol {
            query = query.bind(s);
        }
        if let Some(ts) = since {
            query = query.bind(ts.to_rfc3339());
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(cycle_from_row).collect()
    }

    // -------------------------------------------------------------------------
    // Strategy state
    // -------------------------------------------------------------------------

    /// Write (replacing) the snapshot for a strategy name.
    pub async fn save_strategy_state(
        &self,
        name: &str,
        version: i64,
        state_json: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO strategy_states (name, state_json, version) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET state_json = excluded.state_json,
                                             version = excluded.version",
        )
        .bind(name)
        .bind(state_json)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read a snapshot; returns `(version, state_json)`.
    pub async fn load_strategy_state(
        &self,
        name: &str,
    ) -> Result<Option<(i64, String)>, sqlx::Error> {
        let row = sqlx::query("SELECT version, state_json FROM strategy_states WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get::<i64, _>(0), r.get::<String, _>(1))))
    }

    // -------------------------------------------------------------------------
    // Balance snapshots & equity
    // -------------------------------------------------------------------------

    pub async fn append_balance_snapshot(
        &self,
        snapshot: &BalanceSnapshot,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO balance_snapshots (timestamp, exchange, currency, total, free, used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(snapshot.timestamp.to_rfc3339())
        .bind(&snapshot.exchange)
        .bind(&snapshot.currency)
        .bind(snapshot.total.to_string())
        .bind(snapshot.free.to_string())
        .bind(snapshot.used.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Equity series for one currency, oldest first.
    pub async fn equity_series(
        &self,
        exchange: &str,
        currency: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EquityPoint>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT timestamp, total FROM balance_snapshots
             WHERE exchange = ?1 AND currency = ?2 AND timestamp >= ?3
             ORDER BY timestamp",
        )
        .bind(exchange)
        .bind(currency)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(EquityPoint {
                    timestamp: datetime_col(&r, 0)?,
                    equity: dec_col(&r, 1)?,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // OHLCV cache tier
    // -------------------------------------------------------------------------

    /// Insert candles, ignoring rows already cached.
    pub async fn upsert_candles(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: &str,
        candles: &[Candle],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for candle in candles {
            sqlx::query(
                "INSERT OR IGNORE INTO ohlcv_cache
                     (exchange, symbol, timeframe, timestamp, o, h, l, c, v)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(exchange)
            .bind(symbol)
            .bind(timeframe)
            .bind(candle.timestamp.timestamp_millis())
            .bind(candle.open.to_string())
            .bind(candle.high.to_string())
            .bind(candle.low.to_string())
            .bind(candle.close.to_string())
            .bind(candle.volume.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Cached candles inside `[start, end]`, oldest first.
    pub async fn load_candles(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT timestamp, o, h, l, c, v FROM ohlcv_cache
             WHERE exchange = ?1 AND symbol = ?2 AND timeframe = ?3
               AND timestamp >= ?4 AND timestamp <= ?5
             ORDER BY timestamp",
        )
        .bind(exchange)
        .bind(symbol)
        .bind(timeframe)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let ms: i64 = r.get(0);
                Ok(Candle {
                    timestamp: DateTime::<Utc>::from_timestamp_millis(ms)
                        .ok_or_else(|| decode_err("invalid candle timestamp"))?,
                    open: dec_col(&r, 1)?,
                    high: dec_col(&r, 2)?,
                    low: dec_col(&r, 3)?,
                    close: dec_col(&r, 4)?,
                    volume: dec_col(&r, 5)?,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Alert log
    // -------------------------------------------------------------------------

    pub async fn log_alert(
        &self,
        alert_type: &str,
        channel: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
        delivered: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO alert_logs (alert_type, channel, message, metadata_json, delivered, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(alert_type)
        .bind(channel)
        .bind(message)
        .bind(metadata.map(|m| m.to_string()))
        .bind(delivered)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn decode_err(msg: &str) -> sqlx::Error {
    sqlx::Error::Decode(msg.to_string().into())
}

fn dec_col(row: &sqlx::sqlite::SqliteRow, idx: usize) -> Result<Decimal, sqlx::Error> {
    let raw: String = row.try_get(idx)?;
    raw.parse()
        .map_err(|_| decode_err(&format!("column {idx} is not a decimal: '{raw}'")))
}

fn dec_col_opt(row: &sqlx::sqlite::SqliteRow, idx: usize) -> Result<Option<Decimal>, sqlx::Error> {
    let raw: Option<String> = row.try_get(idx)?;
    raw.map(|s| {
        s.parse()
            .map_err(|_| decode_err(&format!("column {idx} is not a decimal: '{s}'")))
    })
    .transpose()
}

fn datetime_col(row: &sqlx::sqlite::SqliteRow, idx: usize) -> Result<DateTime<Utc>, sqlx::Error> {
    let raw: String = row.try_get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| decode_err(&format!("column {idx} is not an RFC 3339 timestamp: '{raw}'")))
}

fn datetime_col_opt(
    row: &sqlx::sqlite::SqliteRow,
    idx: usize,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let raw: Option<String> = row.try_get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| decode_err(&format!("column {idx} is not an RFC 3339 timestamp: '{s}'")))
    })
    .transpose()
}

fn order_from_row(row: sqlx::sqlite::SqliteRow) -> Result<OrderRecord, sqlx::Error> {
    let side: String = row.try_get(4)?;
    let order_type: String = row.try_get(5)?;
    let status: String = row.try_get(6)?;
    let amount = dec_col(&row, 8)?;
    let filled = dec_col(&row, 9)?;
    let remaining = dec_col_opt(&row, 10)?.unwrap_or(amount - filled);

    Ok(OrderRecord {
        trade_id: row.try_get(1)?,
        order: Order {
            id: row.try_get(0)?,
            client_order_id: row.try_get(2)?,
            symbol: row.try_get(3)?,
            side: side.parse::<OrderSide>().map_err(|e| decode_err(&e))?,
            order_type: order_type.parse::<OrderType>().map_err(|e| decode_err(&e))?,
            status: status.parse::<OrderStatus>().map_err(|e| decode_err(&e))?,
            price: dec_col_opt(&row, 7)?,
            amount,
            filled,
            remaining,
            cost: dec_col_opt(&row, 11)?.unwrap_or(Decimal::ZERO),
            fee: dec_col_opt(&row, 12)?,
            timestamp: datetime_col(&row, 13)?,
        },
    })
}

fn cycle_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TradeCycle, sqlx::Error> {
    let side: String = row.try_get(5)?;
    Ok(TradeCycle {
        id: Some(row.try_get(0)?),
        exchange: row.try_get(1)?,
        symbol: row.try_get(2)?,
        strategy: row.try_get(3)?,
        is_open: row.try_get(4)?,
        side: side.parse::<OrderSide>().map_err(|e| decode_err(&e))?,
        open_rate: dec_col(&row, 6)?,
        amount: dec_col(&row, 7)?,
        open_date: datetime_col(&row, 8)?,
        close_rate: dec_col_opt(&row, 9)?,
        close_date: datetime_col_opt(&row, 10)?,
        stop_loss: dec_col_opt(&row, 11)?,
        take_profit: dec_col_opt(&row, 12)?,
        profit: dec_col_opt(&row, 13)?,
        profit_pct: dec_col_opt(&row, 14)?,
        fee: dec_col_opt(&row, 15)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
