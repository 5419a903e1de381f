use anyhow::Result;
use rusqlite::{params, Connection};

use crate::ledger::ClosedTrade;

/// Append-only trade and pool-event history. Recovery truth lives in the
/// JSON state files; this store exists for inspection and reporting.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS trades (
                ts INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                reason TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pool_events (
                ts INTEGER NOT NULL,
                event TEXT NOT NULL,
                symbol TEXT NOT NULL,
                funding_rate REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn record_trade(&mut self, trade: &ClosedTrade) -> Result<()> {
        self.conn.execute(
            "INSERT INTO trades (ts, symbol, side, quantity, entry_price, exit_price, realized_pnl, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                trade.exit_time,
                trade.symbol,
                trade.side.as_str(),
                trade.quantity,
                trade.entry_price,
                trade.exit_price,
                trade.realized_pnl,
                trade.reason
            ],
        )?;
        Ok(())
    }

    pub fn record_pool_event(
        &mut self,
        ts: i64,
        event: &str,
        symbol: &str,
        funding_rate: f64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pool_events (ts, event, symbol, funding_rate)
             VALUES (?1, ?2, ?3, ?4)",
            params![ts, event, symbol, funding_rate],
        )?;
        Ok(())
    }

    pub fn trade_count(&self) -> Result<u64> {
        let n: u64 = self.conn.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))?;
        Ok(n)
    }
}
