//! Position ledger: open positions, capital accounting, realized PnL.
//!
//! Every mutation is committed to the state file before it is acknowledged;
//! a failed write rolls the in-memory change back so memory and disk never
//! disagree. The persisted file also carries the current pool so one snapshot
//! reconstructs both after a restart.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging::{json_log, obj, v_num, v_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Positive funding rate -> long (collect the funding stream from
    /// shorts), negative -> short. A fixed rule of the strategy's economic
    /// model, not a per-call choice.
    pub fn for_rate(rate: f64) -> Self {
        if rate >= 0.0 {
            Side::Long
        } else {
            Side::Short
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: i64,
    pub funding_rate_at_entry: f64,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.quantity * self.entry_price
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        match self.side {
            Side::Long => (current_price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - current_price) * self.quantity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub realized_pnl: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapitalAccount {
    pub total: f64,
    pub available: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerError {
    AlreadyOpen(String),
    NotOpen(String),
    InsufficientCapital { needed: f64, available: f64 },
    InvalidFill { symbol: String, quantity: f64, price: f64 },
    Persist(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::AlreadyOpen(sym) => write!(f, "{}: position already open", sym),
            LedgerError::NotOpen(sym) => write!(f, "{}: no open position", sym),
            LedgerError::InsufficientCapital { needed, available } => {
                write!(f, "insufficient capital: need {:.2}, available {:.2}", needed, available)
            }
            LedgerError::InvalidFill { symbol, quantity, price } => {
                write!(f, "{}: invalid fill qty={} price={}", symbol, quantity, price)
            }
            LedgerError::Persist(msg) => write!(f, "state persistence failed: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

#[derive(Serialize, Deserialize)]
struct StateFile {
    capital: CapitalAccount,
    realized_pnl: f64,
    wins: u64,
    losses: u64,
    positions: Vec<Position>,
    pool: Vec<String>,
}

pub struct PositionLedger {
    positions: BTreeMap<String, Position>,
    capital: CapitalAccount,
    realized_pnl: f64,
    wins: u64,
    losses: u64,
    pool: Vec<String>,
    path: String,
}

impl PositionLedger {
    pub fn new(path: &str, starting_capital: f64) -> Self {
        Self {
            positions: BTreeMap::new(),
            capital: CapitalAccount { total: starting_capital, available: starting_capital },
            realized_pnl: 0.0,
            wins: 0,
            losses: 0,
            pool: Vec::new(),
            path: path.to_string(),
        }
    }

    /// Reload from the state file; a missing file starts a fresh ledger with
    /// the configured capital.
    pub fn load(path: &str, starting_capital: f64) -> Result<Self> {
        if path.is_empty() || !Path::new(path).exists() {
            return Ok(Self::new(path, starting_capital));
        }
        let data = fs::read_to_string(path).with_context(|| format!("read state {}", path))?;
        let file: StateFile =
            serde_json::from_str(&data).with_context(|| format!("parse state {}", path))?;
        let mut ledger = Self::new(path, starting_capital);
        ledger.capital = file.capital;
        ledger.realized_pnl = file.realized_pnl;
        ledger.wins = file.wins;
        ledger.losses = file.losses;
        ledger.pool = file.pool;
        for pos in file.positions {
            ledger.positions.insert(pos.symbol.clone(), pos);
        }
        Ok(ledger)
    }

    pub fn capital(&self) -> CapitalAccount {
        self.capital
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            0.0
        } else {
            self.wins as f64 / total as f64
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    /// Open positions ordered by entry time, oldest first.
    pub fn positions_by_age(&self) -> Vec<Position> {
        let mut list = self.positions();
        list.sort_by_key(|p| p.entry_time);
        list
    }

    /// Sum of open entry notionals.
    pub fn total_exposure(&self) -> f64 {
        self.positions.values().map(|p| p.notional()).sum()
    }

    pub fn unrealized_pnl<F: Fn(&str) -> Option<f64>>(&self, price_for: F) -> f64 {
        self.positions
            .values()
            .map(|p| price_for(&p.symbol).map(|px| p.unrealized_pnl(px)).unwrap_or(0.0))
            .sum()
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    pub fn open(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
        funding_rate: f64,
        fee: f64,
        now: i64,
    ) -> Result<Position, LedgerError> {
        if quantity <= 0.0 || price <= 0.0 || !quantity.is_finite() || !price.is_finite() {
            return Err(LedgerError::InvalidFill { symbol: symbol.to_string(), quantity, price });
        }
        if self.positions.contains_key(symbol) {
            return Err(LedgerError::AlreadyOpen(symbol.to_string()));
        }
        let cost = quantity * price + fee;
        if cost > self.capital.available {
            return Err(LedgerError::InsufficientCapital {
                needed: cost,
                available: self.capital.available,
            });
        }

        let position = Position {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: price,
            entry_time: now,
            funding_rate_at_entry: funding_rate,
        };
        self.positions.insert(symbol.to_string(), position.clone());
        self.capital.available -= cost;

        if let Err(err) = self.persist() {
            self.positions.remove(symbol);
            self.capital.available += cost;
            return Err(LedgerError::Persist(err.to_string()));
        }
        Ok(position)
    }

    pub fn close(
        &mut self,
        symbol: &str,
        exit_price: f64,
        fee: f64,
        reason: &str,
        now: i64,
    ) -> Result<ClosedTrade, LedgerError> {
        let position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| LedgerError::NotOpen(symbol.to_string()))?;

        let realized = position.unrealized_pnl(exit_price) - fee;
        let notional = position.notional();
        let prev_capital = self.capital;

        self.capital.available += notional + realized;
        self.capital.total += realized;
        // A close can realize more loss than the notional it frees; the
        // account never reports negative availability.
        if self.capital.available < 0.0 {
            json_log(
                "ledger",
                obj(&[
                    ("event", v_str("available_floor")),
                    ("symbol", v_str(symbol)),
                    ("available", v_num(self.capital.available)),
                ]),
            );
            self.capital.available = 0.0;
        }
        self.realized_pnl += realized;
        if realized > 0.0 {
            self.wins += 1;
        } else if realized < 0.0 {
            self.losses += 1;
        }

        if let Err(err) = self.persist() {
            self.positions.insert(symbol.to_string(), position);
            self.capital = prev_capital;
            self.realized_pnl -= realized;
            if realized > 0.0 {
                self.wins -= 1;
            } else if realized < 0.0 {
                self.losses -= 1;
            }
            return Err(LedgerError::Persist(err.to_string()));
        }

        Ok(ClosedTrade {
            symbol: position.symbol,
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price,
            entry_time: position.entry_time,
            exit_time: now,
            realized_pnl: realized,
            reason: reason.to_string(),
        })
    }

    /// Close every open position. Symbols without a usable exit price close
    /// flat at their entry price rather than being left dangling.
    pub fn close_all<F: Fn(&str) -> Option<f64>>(
        &mut self,
        price_for: F,
        fee_for_notional: f64,
        reason: &str,
        now: i64,
    ) -> Vec<ClosedTrade> {
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        let mut closed = Vec::new();
        for symbol in symbols {
            let (exit_price, notional) = match self.positions.get(&symbol) {
                Some(p) => (price_for(&symbol).unwrap_or(p.entry_price), p.notional()),
                None => continue,
            };
            match self.close(&symbol, exit_price, notional * fee_for_notional, reason, now) {
                Ok(trade) => closed.push(trade),
                Err(err) => {
                    json_log(
                        "ledger",
                        obj(&[
                            ("event", v_str("close_all_error")),
                            ("symbol", v_str(&symbol)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }
        closed
    }

    /// Replace the persisted pool. The engine is the only caller.
    pub fn replace_pool(&mut self, pool: Vec<String>) -> Result<(), LedgerError> {
        let prev = std::mem::replace(&mut self.pool, pool);
        if let Err(err) = self.persist() {
            self.pool = prev;
            return Err(LedgerError::Persist(err.to_string()));
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        let file = StateFile {
            capital: self.capital,
            realized_pnl: self.realized_pnl,
            wins: self.wins,
            losses: self.losses,
            positions: self.positions.values().cloned().collect(),
            pool: self.pool.clone(),
        };
        let body = serde_json::to_string(&file)?;
        let tmp = format!("{}.tmp", self.path);
        fs::write(&tmp, body).with_context(|| format!("write {}", tmp))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("rename {} -> {}", tmp, self.path))?;
        Ok(())
    }
}
