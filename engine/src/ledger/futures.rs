//! Futures ledger: collateral accounts, orders, positions, trades, funding
//! history and the insurance fund.

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::ledger::{parse_decimal, parse_enum};
use crate::lock;
use crate::types::{
    Candle, FundingRate, FuturesAccount, Order, OrderStatus, OrderType, Position, Side, Trade,
};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

pub struct FuturesLedger {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

pub struct NewOrder<'a> {
    pub pubkey: &'a str,
    pub market: &'a str,
    pub side: Side,
    pub order_type: OrderType,
    pub size_sats: i64,
    pub price_usd: Option<Decimal>,
    pub leverage: u32,
    pub reserved_msats: i64,
    pub nostr_event_id: Option<&'a str>,
}

pub struct NewPosition<'a> {
    pub pubkey: &'a str,
    pub market: &'a str,
    pub side: Side,
    pub size_sats: i64,
    pub entry_price_usd: Decimal,
    pub collateral_msats: i64,
    pub leverage: u32,
    pub liquidation_price_usd: Decimal,
}

pub struct NewTrade<'a> {
    pub market: &'a str,
    pub buyer_pubkey: &'a str,
    pub seller_pubkey: &'a str,
    pub size_sats: i64,
    pub price_usd: Decimal,
    pub buy_order_id: &'a str,
    pub sell_order_id: &'a str,
}

impl FuturesLedger {
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Internal(format!("create db dir: {e}")))?;
        }
        let ledger = Self {
            conn: Mutex::new(Connection::open(path.as_ref())?),
            clock,
        };
        ledger.init_schema()?;
        info!(target = "bank", path = %path.as_ref().display(), "futures ledger opened");
        Ok(ledger)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let ledger = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            clock,
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "futures_db");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS futures_accounts (
                pubkey TEXT PRIMARY KEY,
                collateral_msats INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                size_sats INTEGER NOT NULL,
                price_usd TEXT,
                leverage INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'open',
                filled_size_sats INTEGER NOT NULL DEFAULT 0,
                reserved_msats INTEGER NOT NULL DEFAULT 0,
                nostr_event_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_pubkey ON orders(pubkey);
            CREATE INDEX IF NOT EXISTS idx_orders_market_status ON orders(market, status);

            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                size_sats INTEGER NOT NULL,
                entry_price_usd TEXT NOT NULL,
                collateral_msats INTEGER NOT NULL,
                leverage INTEGER NOT NULL,
                liquidation_price_usd TEXT NOT NULL,
                funding_cost_msats INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pos_pubkey ON positions(pubkey);
            CREATE INDEX IF NOT EXISTS idx_pos_market ON positions(market);

            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                market TEXT NOT NULL,
                buyer_pubkey TEXT NOT NULL,
                seller_pubkey TEXT NOT NULL,
                size_sats INTEGER NOT NULL,
                price_usd TEXT NOT NULL,
                buy_order_id TEXT NOT NULL,
                sell_order_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_market ON trades(market);
            CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(timestamp);

            CREATE TABLE IF NOT EXISTS funding_rates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                market TEXT NOT NULL,
                rate TEXT NOT NULL,
                mark_price_usd TEXT NOT NULL,
                index_price_usd TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                UNIQUE (market, epoch)
            );
            CREATE INDEX IF NOT EXISTS idx_fr_market ON funding_rates(market);

            CREATE TABLE IF NOT EXISTS funding_payments (
                position_id TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                amount_msats INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (position_id, epoch)
            );

            CREATE TABLE IF NOT EXISTS insurance_fund (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance_msats INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO insurance_fund (id, balance_msats, updated_at) VALUES (1, 0, ?1)",
            params![now],
        )?;
        Ok(())
    }

    // -- accounts ---------------------------------------------------------

    fn map_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<FuturesAccount> {
        Ok(FuturesAccount {
            pubkey: row.get(0)?,
            collateral_msats: row.get(1)?,
            created_at: row.get::<_, i64>(2)? as u64,
            updated_at: row.get::<_, i64>(3)? as u64,
        })
    }

    pub fn collateral_msats(&self, pubkey: &str) -> Result<i64> {
        let conn = lock(&self.conn, "futures_db");
        let collateral = conn
            .query_row(
                "SELECT collateral_msats FROM futures_accounts WHERE pubkey = ?1",
                params![pubkey],
                |row| row.get(0),
            )
            .optional()?;
        Ok(collateral.unwrap_or(0))
    }

    /// Sum of all free collateral; conservation checks.
    pub fn total_collateral_msats(&self) -> Result<i64> {
        let conn = lock(&self.conn, "futures_db");
        let total = conn.query_row(
            "SELECT COALESCE(SUM(collateral_msats), 0) FROM futures_accounts",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Sum of collateral locked inside open positions; conservation checks.
    pub fn total_position_collateral_msats(&self) -> Result<i64> {
        let conn = lock(&self.conn, "futures_db");
        let total = conn.query_row(
            "SELECT COALESCE(SUM(collateral_msats), 0) FROM positions",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn credit_collateral(&self, pubkey: &str, amount_msats: i64) -> Result<FuturesAccount> {
        if amount_msats < 0 {
            return Err(EngineError::Validation("amount_msats must be non-negative".into()));
        }
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "futures_db");
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO futures_accounts (pubkey, collateral_msats, created_at, updated_at)
             VALUES (?1, 0, ?2, ?2)",
            params![pubkey, now],
        )?;
        tx.execute(
            "UPDATE futures_accounts SET collateral_msats = collateral_msats + ?1, updated_at = ?2
             WHERE pubkey = ?3",
            params![amount_msats, now, pubkey],
        )?;
        let account = tx.query_row(
            "SELECT pubkey, collateral_msats, created_at, updated_at
             FROM futures_accounts WHERE pubkey = ?1",
            params![pubkey],
            Self::map_account,
        )?;
        tx.commit()?;
        Ok(account)
    }

    pub fn debit_collateral(&self, pubkey: &str, amount_msats: i64) -> Result<FuturesAccount> {
        if amount_msats < 0 {
            return Err(EngineError::Validation("amount_msats must be non-negative".into()));
        }
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "futures_db");
        let tx = conn.unchecked_transaction()?;
        let have: Option<i64> = tx
            .query_row(
                "SELECT collateral_msats FROM futures_accounts WHERE pubkey = ?1",
                params![pubkey],
                |row| row.get(0),
            )
            .optional()?;
        let have = have.unwrap_or(0);
        if have < amount_msats {
            return Err(EngineError::InsufficientCollateral {
                needed: amount_msats,
                have,
            });
        }
        tx.execute(
            "UPDATE futures_accounts SET collateral_msats = collateral_msats - ?1, updated_at = ?2
             WHERE pubkey = ?3",
            params![amount_msats, now, pubkey],
        )?;
        let account = tx.query_row(
            "SELECT pubkey, collateral_msats, created_at, updated_at
             FROM futures_accounts WHERE pubkey = ?1",
            params![pubkey],
            Self::map_account,
        )?;
        tx.commit()?;
        Ok(account)
    }

    // -- orders -----------------------------------------------------------

    fn map_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
        Ok(Order {
            id: row.get(0)?,
            pubkey: row.get(1)?,
            market: row.get(2)?,
            side: parse_enum(3, row.get::<_, String>(3)?)?,
            order_type: parse_enum(4, row.get::<_, String>(4)?)?,
            size_sats: row.get(5)?,
            price_usd: row
                .get::<_, Option<String>>(6)?
                .map(|s| parse_decimal(6, s))
                .transpose()?,
            leverage: row.get(7)?,
            status: parse_enum(8, row.get::<_, String>(8)?)?,
            filled_size_sats: row.get(9)?,
            reserved_msats: row.get(10)?,
            nostr_event_id: row.get(11)?,
            created_at: row.get::<_, i64>(12)? as u64,
            updated_at: row.get::<_, i64>(13)? as u64,
        })
    }

    const ORDER_COLUMNS: &'static str = "id, pubkey, market, side, order_type, size_sats, price_usd, \
         leverage, status, filled_size_sats, reserved_msats, nostr_event_id, created_at, updated_at";

    pub fn create_order(&self, new: NewOrder<'_>) -> Result<Order> {
        let now = self.clock.now() as i64;
        let id = Uuid::new_v4().to_string();
        let conn = lock(&self.conn, "futures_db");
        conn.execute(
            "INSERT INTO orders
               (id, pubkey, market, side, order_type, size_sats, price_usd, leverage, status,
                filled_size_sats, reserved_msats, nostr_event_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', 0, ?9, ?10, ?11, ?11)",
            params![
                id,
                new.pubkey,
                new.market,
                new.side.as_str(),
                new.order_type.as_str(),
                new.size_sats,
                new.price_usd.map(|p| p.to_string()),
                new.leverage,
                new.reserved_msats,
                new.nostr_event_id,
                now,
            ],
        )?;
        let order = conn.query_row(
            &format!("SELECT {} FROM orders WHERE id = ?1", Self::ORDER_COLUMNS),
            params![id],
            Self::map_order,
        )?;
        Ok(order)
    }

    pub fn order(&self, order_id: &str) -> Result<Option<Order>> {
        let conn = lock(&self.conn, "futures_db");
        let order = conn
            .query_row(
                &format!("SELECT {} FROM orders WHERE id = ?1", Self::ORDER_COLUMNS),
                params![order_id],
                Self::map_order,
            )
            .optional()?;
        Ok(order)
    }

    /// Working (non-terminal) orders for a market, sorted by
    /// (price ascending, time ascending). Orders without a price sort last.
    pub fn open_orders_for_market(&self, market: &str, side: Option<Side>) -> Result<Vec<Order>> {
        let conn = lock(&self.conn, "futures_db");
        let mut orders = match side {
            Some(side) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM orders
                     WHERE market = ?1 AND side = ?2 AND status IN ('open', 'partially_filled')",
                    Self::ORDER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![market, side.as_str()], Self::map_order)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM orders
                     WHERE market = ?1 AND status IN ('open', 'partially_filled')",
                    Self::ORDER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![market], Self::map_order)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        orders.sort_by(|a, b| {
            match (a.price_usd, b.price_usd) {
                (Some(pa), Some(pb)) => pa.cmp(&pb),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then(a.created_at.cmp(&b.created_at))
        });
        Ok(orders)
    }

    pub fn orders_for_pubkey(
        &self,
        pubkey: &str,
        status: Option<OrderStatus>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let conn = lock(&self.conn, "futures_db");
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM orders WHERE pubkey = ?1 AND status = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT ?3",
                    Self::ORDER_COLUMNS
                ))?;
                let x = stmt.query_map(params![pubkey, status.as_str(), limit as i64], Self::map_order)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                x
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM orders WHERE pubkey = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                    Self::ORDER_COLUMNS
                ))?;
                let x = stmt.query_map(params![pubkey, limit as i64], Self::map_order)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                x
            }
        };
        Ok(rows)
    }

    pub fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        filled_size_sats: Option<i64>,
    ) -> Result<Order> {
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "futures_db");
        let changed = match filled_size_sats {
            Some(filled) => conn.execute(
                "UPDATE orders SET status = ?1, filled_size_sats = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), filled, now, order_id],
            )?,
            None => conn.execute(
                "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, order_id],
            )?,
        };
        if changed == 0 {
            return Err(EngineError::NotFound("order"));
        }
        let order = conn.query_row(
            &format!("SELECT {} FROM orders WHERE id = ?1", Self::ORDER_COLUMNS),
            params![order_id],
            Self::map_order,
        )?;
        Ok(order)
    }

    // -- positions --------------------------------------------------------

    fn map_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
        Ok(Position {
            id: row.get(0)?,
            pubkey: row.get(1)?,
            market: row.get(2)?,
            side: parse_enum(3, row.get::<_, String>(3)?)?,
            size_sats: row.get(4)?,
            entry_price_usd: parse_decimal(5, row.get::<_, String>(5)?)?,
            collateral_msats: row.get(6)?,
            leverage: row.get(7)?,
            liquidation_price_usd: parse_decimal(8, row.get::<_, String>(8)?)?,
            funding_cost_msats: row.get(9)?,
            created_at: row.get::<_, i64>(10)? as u64,
            updated_at: row.get::<_, i64>(11)? as u64,
        })
    }

    const POSITION_COLUMNS: &'static str = "id, pubkey, market, side, size_sats, entry_price_usd, \
         collateral_msats, leverage, liquidation_price_usd, funding_cost_msats, created_at, updated_at";

    pub fn create_position(&self, new: NewPosition<'_>) -> Result<Position> {
        let now = self.clock.now() as i64;
        let id = Uuid::new_v4().to_string();
        let conn = lock(&self.conn, "futures_db");
        conn.execute(
            "INSERT INTO positions
               (id, pubkey, market, side, size_sats, entry_price_usd, collateral_msats,
                leverage, liquidation_price_usd, funding_cost_msats, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)",
            params![
                id,
                new.pubkey,
                new.market,
                new.side.as_str(),
                new.size_sats,
                new.entry_price_usd.to_string(),
                new.collateral_msats,
                new.leverage,
                new.liquidation_price_usd.to_string(),
                now,
            ],
        )?;
        let position = conn.query_row(
            &format!("SELECT {} FROM positions WHERE id = ?1", Self::POSITION_COLUMNS),
            params![id],
            Self::map_position,
        )?;
        Ok(position)
    }

    pub fn position(&self, position_id: &str) -> Result<Option<Position>> {
        let conn = lock(&self.conn, "futures_db");
        let position = conn
            .query_row(
                &format!("SELECT {} FROM positions WHERE id = ?1", Self::POSITION_COLUMNS),
                params![position_id],
                Self::map_position,
            )
            .optional()?;
        Ok(position)
    }

    pub fn positions_for_pubkey(&self, pubkey: &str) -> Result<Vec<Position>> {
        let conn = lock(&self.conn, "futures_db");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM positions WHERE pubkey = ?1 ORDER BY created_at DESC, rowid DESC",
            Self::POSITION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![pubkey], Self::map_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn open_positions(&self, market: Option<&str>) -> Result<Vec<Position>> {
        let conn = lock(&self.conn, "futures_db");
        let rows = match market {
            Some(market) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM positions WHERE market = ?1 ORDER BY rowid ASC",
                    Self::POSITION_COLUMNS
                ))?;
                let x = stmt.query_map(params![market], Self::map_position)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                x
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM positions ORDER BY rowid ASC",
                    Self::POSITION_COLUMNS
                ))?;
                let x = stmt.query_map([], Self::map_position)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                x
            }
        };
        Ok(rows)
    }

    /// Delete a position row. Returns false when it was already gone, which
    /// makes the delete the linearization point between racing closers.
    pub fn close_position(&self, position_id: &str) -> Result<bool> {
        let conn = lock(&self.conn, "futures_db");
        let deleted = conn.execute("DELETE FROM positions WHERE id = ?1", params![position_id])?;
        Ok(deleted > 0)
    }

    pub fn total_open_interest_sats(&self, market: &str) -> Result<i64> {
        let conn = lock(&self.conn, "futures_db");
        let oi = conn.query_row(
            "SELECT COALESCE(SUM(size_sats), 0) FROM positions WHERE market = ?1",
            params![market],
            |row| row.get(0),
        )?;
        Ok(oi)
    }

    /// Apply one funding payment to a position, guarded by the
    /// (position_id, epoch) uniqueness so a re-run of a crashed funding pass
    /// cannot settle the same position twice. Returns false when the epoch
    /// was already settled for this position.
    pub fn apply_funding_payment(
        &self,
        position_id: &str,
        epoch: u64,
        funding_cost_delta_msats: i64,
        new_collateral_msats: i64,
    ) -> Result<bool> {
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "futures_db");
        let tx = conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO funding_payments (position_id, epoch, amount_msats, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![position_id, epoch as i64, funding_cost_delta_msats, now],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE positions
             SET funding_cost_msats = funding_cost_msats + ?1, collateral_msats = ?2, updated_at = ?3
             WHERE id = ?4",
            params![funding_cost_delta_msats, new_collateral_msats, now, position_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // -- trades -----------------------------------------------------------

    fn map_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
        Ok(Trade {
            id: row.get(0)?,
            market: row.get(1)?,
            buyer_pubkey: row.get(2)?,
            seller_pubkey: row.get(3)?,
            size_sats: row.get(4)?,
            price_usd: parse_decimal(5, row.get::<_, String>(5)?)?,
            buy_order_id: row.get(6)?,
            sell_order_id: row.get(7)?,
            timestamp: row.get::<_, i64>(8)? as u64,
        })
    }

    const TRADE_COLUMNS: &'static str =
        "id, market, buyer_pubkey, seller_pubkey, size_sats, price_usd, buy_order_id, sell_order_id, timestamp";

    pub fn record_trade(&self, new: NewTrade<'_>) -> Result<Trade> {
        let now = self.clock.now();
        let id = Uuid::new_v4().to_string();
        let conn = lock(&self.conn, "futures_db");
        conn.execute(
            "INSERT INTO trades
               (id, market, buyer_pubkey, seller_pubkey, size_sats, price_usd, buy_order_id, sell_order_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                new.market,
                new.buyer_pubkey,
                new.seller_pubkey,
                new.size_sats,
                new.price_usd.to_string(),
                new.buy_order_id,
                new.sell_order_id,
                now as i64,
            ],
        )?;
        Ok(Trade {
            id,
            market: new.market.to_string(),
            buyer_pubkey: new.buyer_pubkey.to_string(),
            seller_pubkey: new.seller_pubkey.to_string(),
            size_sats: new.size_sats,
            price_usd: new.price_usd,
            buy_order_id: new.buy_order_id.to_string(),
            sell_order_id: new.sell_order_id.to_string(),
            timestamp: now,
        })
    }

    pub fn recent_trades(&self, market: &str, limit: usize) -> Result<Vec<Trade>> {
        let conn = lock(&self.conn, "futures_db");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM trades WHERE market = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
            Self::TRADE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![market, limit as i64], Self::map_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn trades_for_pubkey(&self, pubkey: &str, limit: usize) -> Result<Vec<Trade>> {
        let conn = lock(&self.conn, "futures_db");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM trades WHERE buyer_pubkey = ?1 OR seller_pubkey = ?1
             ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
            Self::TRADE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![pubkey, limit as i64], Self::map_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Aggregate trades into OHLCV candles bucketed by
    /// `floor(ts / bucket) * bucket`. Aggregation runs over the fetched rows
    /// because prices are stored as decimal text.
    pub fn ohlcv(&self, market: &str, since: u64, bucket_seconds: u64) -> Result<Vec<Candle>> {
        if bucket_seconds == 0 {
            return Err(EngineError::Validation("bucket_seconds must be positive".into()));
        }
        let conn = lock(&self.conn, "futures_db");
        let mut stmt = conn.prepare(
            "SELECT timestamp, price_usd, size_sats FROM trades
             WHERE market = ?1 AND timestamp >= ?2 ORDER BY timestamp ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![market, since as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    parse_decimal(1, row.get::<_, String>(1)?)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut candles: Vec<Candle> = Vec::new();
        for (ts, price, size) in rows {
            let bucket = ts / bucket_seconds * bucket_seconds;
            match candles.last_mut() {
                Some(c) if c.bucket == bucket => {
                    c.high = c.high.max(price);
                    c.low = c.low.min(price);
                    c.close = price;
                    c.volume_sats += size;
                }
                _ => candles.push(Candle {
                    bucket,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume_sats: size,
                }),
            }
        }
        Ok(candles)
    }

    // -- funding rates ----------------------------------------------------

    fn map_funding_rate(row: &rusqlite::Row<'_>) -> rusqlite::Result<FundingRate> {
        Ok(FundingRate {
            id: row.get(0)?,
            market: row.get(1)?,
            rate: parse_decimal(2, row.get::<_, String>(2)?)?,
            mark_price_usd: parse_decimal(3, row.get::<_, String>(3)?)?,
            index_price_usd: parse_decimal(4, row.get::<_, String>(4)?)?,
            epoch: row.get::<_, i64>(5)? as u64,
            timestamp: row.get::<_, i64>(6)? as u64,
        })
    }

    const FUNDING_COLUMNS: &'static str =
        "id, market, rate, mark_price_usd, index_price_usd, epoch, timestamp";

    /// Append the funding rate for an epoch. Returns None when the
    /// (market, epoch) row already exists, which marks the epoch as settled
    /// (or mid-settlement) by an earlier pass.
    pub fn record_funding_rate(
        &self,
        market: &str,
        rate: Decimal,
        mark_price_usd: Decimal,
        index_price_usd: Decimal,
        epoch: u64,
    ) -> Result<Option<FundingRate>> {
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "futures_db");
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO funding_rates (market, rate, mark_price_usd, index_price_usd, epoch, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                market,
                rate.to_string(),
                mark_price_usd.to_string(),
                index_price_usd.to_string(),
                epoch as i64,
                now,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let fr = conn.query_row(
            &format!(
                "SELECT {} FROM funding_rates WHERE market = ?1 AND epoch = ?2",
                Self::FUNDING_COLUMNS
            ),
            params![market, epoch as i64],
            Self::map_funding_rate,
        )?;
        Ok(Some(fr))
    }

    /// The recorded rate for one epoch; a restarted funding pass settles
    /// with this rather than recomputing from live prices.
    pub fn funding_rate_for_epoch(&self, market: &str, epoch: u64) -> Result<Option<FundingRate>> {
        let conn = lock(&self.conn, "futures_db");
        let fr = conn
            .query_row(
                &format!(
                    "SELECT {} FROM funding_rates WHERE market = ?1 AND epoch = ?2",
                    Self::FUNDING_COLUMNS
                ),
                params![market, epoch as i64],
                Self::map_funding_rate,
            )
            .optional()?;
        Ok(fr)
    }

    pub fn latest_funding_rate(&self, market: &str) -> Result<Option<FundingRate>> {
        let conn = lock(&self.conn, "futures_db");
        let fr = conn
            .query_row(
                &format!(
                    "SELECT {} FROM funding_rates WHERE market = ?1 ORDER BY epoch DESC LIMIT 1",
                    Self::FUNDING_COLUMNS
                ),
                params![market],
                Self::map_funding_rate,
            )
            .optional()?;
        Ok(fr)
    }

    pub fn funding_rate_history(&self, market: &str, limit: usize) -> Result<Vec<FundingRate>> {
        let conn = lock(&self.conn, "futures_db");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM funding_rates WHERE market = ?1 ORDER BY epoch DESC LIMIT ?2",
            Self::FUNDING_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![market, limit as i64], Self::map_funding_rate)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- insurance fund ---------------------------------------------------

    pub fn insurance_fund_msats(&self) -> Result<i64> {
        let conn = lock(&self.conn, "futures_db");
        let balance = conn.query_row(
            "SELECT balance_msats FROM insurance_fund WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    pub fn credit_insurance_fund(&self, amount_msats: i64) -> Result<i64> {
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "futures_db");
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE insurance_fund SET balance_msats = balance_msats + ?1, updated_at = ?2 WHERE id = 1",
            params![amount_msats, now],
        )?;
        let balance: i64 = tx.query_row(
            "SELECT balance_msats FROM insurance_fund WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(balance)
    }

    /// Saturating debit: a deficit beyond the fund balance is absorbed
    /// (logged) rather than pushing the fund negative.
    pub fn debit_insurance_fund(&self, amount_msats: i64) -> Result<i64> {
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "futures_db");
        let tx = conn.unchecked_transaction()?;
        let balance: i64 = tx.query_row(
            "SELECT balance_msats FROM insurance_fund WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        let new_balance = (balance - amount_msats).max(0);
        if balance < amount_msats {
            warn!(
                target = "bank",
                requested_msats = amount_msats,
                available_msats = balance,
                "insurance fund deficit absorbed"
            );
        }
        tx.execute(
            "UPDATE insurance_fund SET balance_msats = ?1, updated_at = ?2 WHERE id = 1",
            params![new_balance, now],
        )?;
        tx.commit()?;
        Ok(new_balance)
    }
}
