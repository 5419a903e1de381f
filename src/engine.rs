//! Pool/position reconciliation.
//!
//! Each tick: obtain the freshest snapshot map (degrading to cache when the
//! source fails), select the target pool, diff it against the current pool,
//! close exits before attempting entries, and only then replace the pool. A
//! risk sweep runs on its own schedule and closes positions on exposure or
//! stop/take-profit breaches independent of pool membership.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::cache::ContractCache;
use crate::config::Config;
use crate::exchange::retry::{retry_async, RetryConfig};
use crate::exchange::FundingSource;
use crate::exec::Executor;
use crate::ledger::{CapitalAccount, ClosedTrade, LedgerError, Position, PositionLedger, Side};
use crate::logging::{epoch_secs, json_log, log, obj, v_num, v_str, Level};
use crate::notify::{Notifier, Urgency};
use crate::selector::select_pool;
use crate::snapshot::FundingSnapshot;
use crate::store::HistoryStore;

/// What one reconciliation tick did. Returned for the caller's logs and for
/// tests; the engine has already notified and persisted by the time this is
/// handed back.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub skipped: bool,
    pub degraded: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub pool: Vec<String>,
}

impl TickReport {
    fn skipped() -> Self {
        Self { skipped: true, ..Default::default() }
    }

    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub pool: Vec<String>,
    pub positions: Vec<Position>,
    pub capital: CapitalAccount,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub win_rate: f64,
    pub degraded: bool,
}

pub struct ReconcileEngine {
    cfg: Config,
    source: Box<dyn FundingSource>,
    executor: Box<dyn Executor>,
    notifier: Arc<dyn Notifier>,
    cache: Mutex<ContractCache>,
    ledger: Mutex<PositionLedger>,
    history: Mutex<HistoryStore>,
    /// Serializes ticks; `try_lock` implements skip-if-running.
    tick_gate: tokio::sync::Mutex<()>,
    sweep_gate: tokio::sync::Mutex<()>,
    degraded: AtomicBool,
    /// Pool members whose open was rejected by a risk limit. Membership here
    /// suppresses repeat rejection logs; the open is still re-attempted
    /// silently each tick so freed capital is picked up.
    blocked_opens: Mutex<HashSet<String>>,
    retry: RetryConfig,
}

impl ReconcileEngine {
    pub fn new(
        cfg: Config,
        source: Box<dyn FundingSource>,
        executor: Box<dyn Executor>,
        notifier: Arc<dyn Notifier>,
        cache: ContractCache,
        ledger: PositionLedger,
        history: HistoryStore,
    ) -> Self {
        Self {
            cfg,
            source,
            executor,
            notifier,
            cache: Mutex::new(cache),
            ledger: Mutex::new(ledger),
            history: Mutex::new(history),
            tick_gate: tokio::sync::Mutex::new(()),
            sweep_gate: tokio::sync::Mutex::new(()),
            degraded: AtomicBool::new(false),
            blocked_opens: Mutex::new(HashSet::new()),
            retry: RetryConfig::default(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn current_pool(&self) -> Vec<String> {
        self.ledger.lock().unwrap().pool().to_vec()
    }

    /// Fetch the universe, validate at the boundary, merge into the cache.
    async fn refresh_cache(&self) -> Result<usize> {
        let raws = retry_async(&self.retry, "fetch_all", || self.source.fetch_all()).await?;
        let now = epoch_secs();
        let mut accepted = Vec::with_capacity(raws.len());
        let mut rejected = 0usize;
        for raw in raws {
            match FundingSnapshot::from_raw(raw, now) {
                Ok(snap) => accepted.push(snap),
                Err(err) => {
                    rejected += 1;
                    log(
                        Level::Warn,
                        "snapshot",
                        obj(&[("event", v_str("rejected")), ("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }
        let merged = {
            let mut cache = self.cache.lock().unwrap();
            let n = cache.merge(accepted, now);
            if let Err(err) = cache.save(now) {
                log(
                    Level::Error,
                    "cache",
                    obj(&[("event", v_str("save_failed")), ("error", v_str(&err.to_string()))]),
                );
            }
            n
        };
        if rejected > 0 {
            json_log(
                "snapshot",
                obj(&[("event", v_str("ingest")), ("accepted", v_num(merged as f64)), ("rejected", v_num(rejected as f64))]),
            );
        }
        Ok(merged)
    }

    /// Flip into/out of degraded mode, notifying only on the transition.
    async fn set_degraded(&self, degraded: bool, detail: &str) {
        let was = self.degraded.swap(degraded, Ordering::SeqCst);
        if degraded && !was {
            self.notifier
                .notify(Urgency::Alert, &format!("degraded mode: funding feed unavailable ({})", detail))
                .await;
        } else if !degraded && was {
            self.notifier.notify(Urgency::Alert, "funding feed recovered").await;
        }
    }

    /// Best usable price for a symbol: live snapshot first, then the last
    /// cached positive price at any age.
    fn resolve_price(
        &self,
        snapshots: &HashMap<String, FundingSnapshot>,
        symbol: &str,
    ) -> Option<f64> {
        if let Some(snap) = snapshots.get(symbol) {
            if snap.has_price() {
                return Some(snap.mark_price);
            }
        }
        self.cache.lock().unwrap().last_price(symbol)
    }

    /// One reconciliation tick; skipped when a previous tick is still
    /// running.
    pub async fn tick(&self) -> Result<TickReport> {
        let Ok(_guard) = self.tick_gate.try_lock() else {
            json_log("engine", obj(&[("event", v_str("tick_skipped")), ("reason", v_str("previous_tick_running"))]));
            return Ok(TickReport::skipped());
        };
        self.tick_inner().await
    }

    /// Externally requested tick: waits for any in-flight tick instead of
    /// skipping.
    pub async fn force_refresh(&self) -> Result<TickReport> {
        let _guard = self.tick_gate.lock().await;
        self.tick_inner().await
    }

    async fn tick_inner(&self) -> Result<TickReport> {
        let now = epoch_secs();

        match self.refresh_cache().await {
            Ok(_) => self.set_degraded(false, "").await,
            Err(err) => {
                log(
                    Level::Warn,
                    "engine",
                    obj(&[("event", v_str("refresh_failed")), ("error", v_str(&err.to_string()))]),
                );
                self.set_degraded(true, &err.to_string()).await;
            }
        }
        let degraded = self.is_degraded();

        let mut snapshots = self.cache.lock().unwrap().fresh_map(now);
        self.top_up_snapshots(&mut snapshots, now).await;
        if snapshots.is_empty() && degraded {
            // No live data and nothing usable in cache. An empty map here is
            // "no information", not "empty universe"; diffing against it
            // would close every position on a feed outage.
            json_log("engine", obj(&[("event", v_str("tick_no_data"))]));
            return Ok(TickReport { degraded, skipped: true, pool: self.current_pool(), ..Default::default() });
        }

        let new_pool = select_pool(
            &snapshots,
            self.cfg.funding_threshold,
            self.cfg.min_volume,
            self.cfg.max_pool_size,
        );
        let current = self.current_pool();

        let removed: Vec<String> =
            current.iter().filter(|s| !new_pool.contains(s)).cloned().collect();
        let added: Vec<String> =
            new_pool.iter().filter(|s| !current.contains(s)).cloned().collect();

        let mut messages: Vec<(Urgency, String)> = Vec::new();
        let mut closed = Vec::new();
        let mut opened = Vec::new();

        // Closes before opens: capital freed here funds opens this same tick.
        for symbol in &removed {
            let has_position = self.ledger.lock().unwrap().position(symbol).is_some();
            if !has_position {
                continue;
            }
            match self.close_position(&snapshots, symbol, "pool exit", now) {
                Ok(trade) => {
                    messages.push((
                        Urgency::Alert,
                        format!(
                            "closed {} {} @ {:.6} (pool exit, pnl {:+.2})",
                            trade.side.as_str(),
                            trade.symbol,
                            trade.exit_price,
                            trade.realized_pnl
                        ),
                    ));
                    closed.push(symbol.clone());
                }
                Err(err) => {
                    // One failed close must not stop the rest of the diff.
                    log(
                        Level::Error,
                        "engine",
                        obj(&[
                            ("event", v_str("close_failed")),
                            ("symbol", v_str(symbol)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }

        // Every pool member without a position is an open candidate, not just
        // this tick's additions: a member whose open was blocked earlier gets
        // retried (quietly) once limits free up.
        if self.cfg.auto_trade {
            for symbol in &new_pool {
                if self.ledger.lock().unwrap().position(symbol).is_some() {
                    continue;
                }
                if self.try_open(&snapshots, symbol, now, &mut messages) {
                    opened.push(symbol.clone());
                }
            }
        }

        // Drop blocked markers for symbols that left the pool.
        self.blocked_opens.lock().unwrap().retain(|s| new_pool.contains(s));

        // The pool is replaced only after closes and opens completed, so a
        // crash mid-tick retries from the old pool without double-processing.
        if let Err(err) = self.ledger.lock().unwrap().replace_pool(new_pool.clone()) {
            log(
                Level::Error,
                "engine",
                obj(&[("event", v_str("pool_persist_failed")), ("error", v_str(&err.to_string()))]),
            );
        }

        {
            let mut history = self.history.lock().unwrap();
            for symbol in &added {
                let rate = snapshots.get(symbol).map(|s| s.funding_rate).unwrap_or(0.0);
                let _ = history.record_pool_event(now, "added", symbol, rate);
            }
            for symbol in &removed {
                let rate = snapshots.get(symbol).map(|s| s.funding_rate).unwrap_or(0.0);
                let _ = history.record_pool_event(now, "removed", symbol, rate);
            }
        }

        for (urgency, text) in &messages {
            self.notifier.notify(*urgency, text).await;
        }

        let report = TickReport {
            skipped: false,
            degraded,
            added,
            removed,
            opened,
            closed,
            pool: new_pool,
        };
        let summary = if report.changed() {
            (
                Urgency::Alert,
                format!(
                    "pool update: +{:?} -{:?} | pool {:?}{}",
                    report.added,
                    report.removed,
                    report.pool,
                    if degraded { " [degraded]" } else { "" }
                ),
            )
        } else {
            (
                Urgency::Routine,
                format!("pool unchanged ({} members){}", report.pool.len(), if degraded { " [degraded]" } else { "" }),
            )
        };
        self.notifier.notify(summary.0, &summary.1).await;

        json_log(
            "engine",
            obj(&[
                ("event", v_str("tick")),
                ("added", v_num(report.added.len() as f64)),
                ("removed", v_num(report.removed.len() as f64)),
                ("opened", v_num(report.opened.len() as f64)),
                ("closed", v_num(report.closed.len() as f64)),
                ("pool_size", v_num(report.pool.len() as f64)),
                ("degraded", serde_json::Value::Bool(degraded)),
            ]),
        );
        Ok(report)
    }

    /// Symbols the engine is committed to (current pool members and open
    /// positions) that missed the batch refresh get one direct lookup each.
    /// A failed lookup degrades that symbol to its last cached value at any
    /// age; a symbol with no cached value stays excluded this round.
    async fn top_up_snapshots(&self, snapshots: &mut HashMap<String, FundingSnapshot>, now: i64) {
        let mut committed: HashSet<String> = self.current_pool().into_iter().collect();
        for pos in self.ledger.lock().unwrap().positions() {
            committed.insert(pos.symbol);
        }
        for symbol in committed {
            if snapshots.contains_key(&symbol) {
                continue;
            }
            match self.source.fetch_one(&symbol).await {
                Ok(Some(raw)) => match FundingSnapshot::from_raw(raw, now) {
                    Ok(snap) => {
                        let mut cache = self.cache.lock().unwrap();
                        cache.insert(snap.clone(), now);
                        drop(cache);
                        snapshots.insert(symbol, snap);
                    }
                    Err(err) => {
                        log(
                            Level::Warn,
                            "snapshot",
                            obj(&[("event", v_str("rejected")), ("error", v_str(&err.to_string()))]),
                        );
                    }
                },
                Ok(None) => {
                    json_log(
                        "engine",
                        obj(&[("event", v_str("symbol_delisted")), ("symbol", v_str(&symbol))]),
                    );
                }
                Err(err) => {
                    log(
                        Level::Warn,
                        "engine",
                        obj(&[
                            ("event", v_str("symbol_refresh_failed")),
                            ("symbol", v_str(&symbol)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    if let Some(entry) = self.cache.lock().unwrap().get(&symbol) {
                        let mut snap = entry.snapshot.clone();
                        snap.source = crate::snapshot::Source::Cached;
                        snapshots.insert(symbol, snap);
                    }
                }
            }
        }
    }

    /// Attempt to open one pool member, enforcing the eligibility gate.
    /// Returns true when a position was opened.
    fn try_open(
        &self,
        snapshots: &HashMap<String, FundingSnapshot>,
        symbol: &str,
        now: i64,
        messages: &mut Vec<(Urgency, String)>,
    ) -> bool {
        let Some(snap) = snapshots.get(symbol) else {
            return false;
        };
        // Re-check at open time: the pool decision may be older than the
        // snapshot that drove it.
        if snap.funding_rate.abs() < self.cfg.funding_threshold {
            log(
                Level::Debug,
                "engine",
                obj(&[("event", v_str("open_skipped")), ("symbol", v_str(symbol)), ("reason", v_str("rate_below_threshold"))]),
            );
            return false;
        }
        let Some(price) = self.resolve_price(snapshots, symbol) else {
            json_log(
                "engine",
                obj(&[("event", v_str("open_skipped")), ("symbol", v_str(symbol)), ("reason", v_str("no_valid_price"))]),
            );
            return false;
        };

        let side = Side::for_rate(snap.funding_rate);
        let quantity = self.cfg.order_notional / price;

        // Limit checks and the ledger mutation happen under one ledger lock
        // acquisition each; the ledger itself re-validates the hard
        // invariants (duplicate, capital) atomically.
        let blocked_reason = {
            let ledger = self.ledger.lock().unwrap();
            if ledger.open_count() >= self.cfg.max_positions {
                Some("max_positions")
            } else if ledger.total_exposure() + self.cfg.order_notional
                > self.cfg.max_total_exposure()
            {
                Some("max_exposure")
            } else {
                None
            }
        };
        if let Some(reason) = blocked_reason {
            self.note_blocked(symbol, reason, messages);
            return false;
        }

        let fill = match self.executor.execute(symbol, side, "open", quantity, price) {
            Ok(fill) => fill,
            Err(err) => {
                log(
                    Level::Error,
                    "engine",
                    obj(&[("event", v_str("open_exec_failed")), ("symbol", v_str(symbol)), ("error", v_str(&err.to_string()))]),
                );
                return false;
            }
        };

        let result = self.ledger.lock().unwrap().open(
            symbol,
            side,
            quantity,
            fill.price,
            snap.funding_rate,
            fill.fee,
            now,
        );
        match result {
            Ok(position) => {
                self.blocked_opens.lock().unwrap().remove(symbol);
                messages.push((
                    Urgency::Alert,
                    format!(
                        "opened {} {} qty {:.6} @ {:.6} (rate {:+.4}%)",
                        position.side.as_str(),
                        position.symbol,
                        position.quantity,
                        position.entry_price,
                        snap.funding_rate * 100.0
                    ),
                ));
                true
            }
            Err(LedgerError::AlreadyOpen(_)) => {
                // Lost a race with another loop; the invariant held.
                log(
                    Level::Debug,
                    "engine",
                    obj(&[("event", v_str("open_skipped")), ("symbol", v_str(symbol)), ("reason", v_str("already_open"))]),
                );
                false
            }
            Err(LedgerError::InsufficientCapital { .. }) => {
                self.note_blocked(symbol, "insufficient_capital", messages);
                false
            }
            Err(err) => {
                log(
                    Level::Error,
                    "engine",
                    obj(&[("event", v_str("open_failed")), ("symbol", v_str(symbol)), ("error", v_str(&err.to_string()))]),
                );
                false
            }
        }
    }

    /// Record a risk-blocked open, alerting only the first time a symbol is
    /// blocked while pool-listed. A blocked member legitimately stays in the
    /// pool without a position.
    fn note_blocked(&self, symbol: &str, reason: &str, messages: &mut Vec<(Urgency, String)>) {
        let newly = self.blocked_opens.lock().unwrap().insert(symbol.to_string());
        if newly {
            messages.push((
                Urgency::Alert,
                format!("open blocked for {}: {}", symbol, reason),
            ));
        }
        log(
            Level::Debug,
            "engine",
            obj(&[("event", v_str("open_blocked")), ("symbol", v_str(symbol)), ("reason", v_str(reason))]),
        );
    }

    fn close_position(
        &self,
        snapshots: &HashMap<String, FundingSnapshot>,
        symbol: &str,
        reason: &str,
        now: i64,
    ) -> Result<ClosedTrade, LedgerError> {
        let (side, quantity, entry_price) = {
            let ledger = self.ledger.lock().unwrap();
            let pos = ledger.position(symbol).ok_or_else(|| LedgerError::NotOpen(symbol.to_string()))?;
            (pos.side, pos.quantity, pos.entry_price)
        };
        // A contract that vanished from the feed still has to close; the
        // entry price is the last resort.
        let price = self.resolve_price(snapshots, symbol).unwrap_or(entry_price);
        let fill = self
            .executor
            .execute(symbol, side, reason, quantity, price)
            .map_err(|e| LedgerError::Persist(e.to_string()))?;
        let trade = self.ledger.lock().unwrap().close(symbol, fill.price, fill.fee, reason, now)?;
        if let Err(err) = self.history.lock().unwrap().record_trade(&trade) {
            log(
                Level::Warn,
                "engine",
                obj(&[("event", v_str("history_write_failed")), ("error", v_str(&err.to_string()))]),
            );
        }
        Ok(trade)
    }

    /// Risk sweep, on its own schedule and gate. Closes breaching positions
    /// regardless of pool membership.
    pub async fn risk_sweep(&self) -> Result<Vec<ClosedTrade>> {
        let Ok(_guard) = self.sweep_gate.try_lock() else {
            json_log("risk", obj(&[("event", v_str("sweep_skipped")), ("reason", v_str("previous_sweep_running"))]));
            return Ok(Vec::new());
        };
        let now = epoch_secs();
        let mut closed = Vec::new();
        let mut messages: Vec<(Urgency, String)> = Vec::new();

        // Exposure cap: reduce oldest-entry-first until under 90% of the cap.
        let cap = self.cfg.max_total_exposure();
        let target = cap * 0.9;
        let over: Vec<Position> = {
            let ledger = self.ledger.lock().unwrap();
            if ledger.total_exposure() > cap {
                ledger.positions_by_age()
            } else {
                Vec::new()
            }
        };
        if !over.is_empty() {
            messages.push((
                Urgency::Alert,
                format!("exposure cap breached (cap {:.0}); reducing oldest-first", cap),
            ));
            let empty = HashMap::new();
            for pos in over {
                if self.ledger.lock().unwrap().total_exposure() <= target {
                    break;
                }
                match self.close_position(&empty, &pos.symbol, "exposure cap", now) {
                    Ok(trade) => {
                        messages.push((
                            Urgency::Alert,
                            format!("closed {} (exposure cap, pnl {:+.2})", trade.symbol, trade.realized_pnl),
                        ));
                        closed.push(trade);
                    }
                    Err(err) => {
                        log(
                            Level::Error,
                            "risk",
                            obj(&[("event", v_str("reduce_failed")), ("symbol", v_str(&pos.symbol)), ("error", v_str(&err.to_string()))]),
                        );
                    }
                }
            }
        }

        // Stop-loss / take-profit, per position, with live prices. A price
        // fetch failure skips that symbol this cycle, not the whole sweep.
        let positions = self.ledger.lock().unwrap().positions();
        for pos in positions {
            let price = match self.source.fetch_mark_price(&pos.symbol).await {
                Ok(p) => p,
                Err(err) => {
                    log(
                        Level::Warn,
                        "risk",
                        obj(&[("event", v_str("price_unavailable")), ("symbol", v_str(&pos.symbol)), ("error", v_str(&err.to_string()))]),
                    );
                    continue;
                }
            };
            let move_frac = match pos.side {
                Side::Long => (price - pos.entry_price) / pos.entry_price,
                Side::Short => (pos.entry_price - price) / pos.entry_price,
            };
            let reason = if move_frac <= -self.cfg.stop_loss_ratio {
                Some("stop loss")
            } else if move_frac >= self.cfg.take_profit_ratio {
                Some("take profit")
            } else {
                None
            };
            let Some(reason) = reason else { continue };

            let mut snapshots = HashMap::new();
            if let Some(mut snap) = self.cache.lock().unwrap().get(&pos.symbol).map(|e| e.snapshot.clone()) {
                snap.mark_price = price;
                snapshots.insert(pos.symbol.clone(), snap);
            }
            match self.close_position(&snapshots, &pos.symbol, reason, now) {
                Ok(trade) => {
                    messages.push((
                        Urgency::Alert,
                        format!(
                            "closed {} {} @ {:.6} ({}, pnl {:+.2})",
                            trade.side.as_str(),
                            trade.symbol,
                            trade.exit_price,
                            reason,
                            trade.realized_pnl
                        ),
                    ));
                    closed.push(trade);
                }
                Err(LedgerError::NotOpen(_)) => {} // closed by a racing tick
                Err(err) => {
                    log(
                        Level::Error,
                        "risk",
                        obj(&[("event", v_str("close_failed")), ("symbol", v_str(&pos.symbol)), ("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }

        for (urgency, text) in &messages {
            self.notifier.notify(*urgency, text).await;
        }
        if !closed.is_empty() {
            json_log("risk", obj(&[("event", v_str("sweep")), ("closed", v_num(closed.len() as f64))]));
        }
        Ok(closed)
    }

    /// Slow loop: rediscover the contract universe and its settlement
    /// buckets, pruning delisted symbols.
    pub async fn rescan_universe(&self) -> Result<()> {
        let raws = retry_async(&self.retry, "rescan", || self.source.fetch_all()).await?;
        let now = epoch_secs();
        let snaps: Vec<FundingSnapshot> = raws
            .into_iter()
            .filter_map(|raw| FundingSnapshot::from_raw(raw, now).ok())
            .collect();
        let (inserted, pruned) = {
            let mut cache = self.cache.lock().unwrap();
            let result = cache.replace_all(snaps, now);
            if let Err(err) = cache.save(now) {
                log(
                    Level::Error,
                    "cache",
                    obj(&[("event", v_str("save_failed")), ("error", v_str(&err.to_string()))]),
                );
            }
            result
        };
        json_log(
            "engine",
            obj(&[
                ("event", v_str("universe_rescan")),
                ("contracts", v_num(inserted as f64)),
                ("pruned", v_num(pruned as f64)),
            ]),
        );
        Ok(())
    }

    /// Top-of-hour rebuild: refresh every cached entry and surface buckets
    /// that are stale even after the refresh.
    pub async fn rebuild_cache(&self) -> Result<()> {
        let refreshed = self.refresh_cache().await?;
        let now = epoch_secs();
        let stale = self.cache.lock().unwrap().stale_buckets(now);
        json_log(
            "engine",
            obj(&[("event", v_str("cache_rebuild")), ("refreshed", v_num(refreshed as f64)), ("stale_buckets", v_num(stale.len() as f64))]),
        );
        for bucket in stale {
            self.notifier
                .notify(Urgency::Alert, &format!("cache bucket {} is stale past TTL", bucket.as_str()))
                .await;
        }
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        let ledger = self.ledger.lock().unwrap();
        let cache = self.cache.lock().unwrap();
        let unrealized = ledger.unrealized_pnl(|sym| cache.last_price(sym));
        PoolStatus {
            pool: ledger.pool().to_vec(),
            positions: ledger.positions(),
            capital: ledger.capital(),
            realized_pnl: ledger.realized_pnl(),
            unrealized_pnl: unrealized,
            win_rate: ledger.win_rate(),
            degraded: self.is_degraded(),
        }
    }

    /// Manual close-everything, e.g. operator shutdown.
    pub async fn close_all(&self, reason: &str) -> Vec<ClosedTrade> {
        let now = epoch_secs();
        let closed = {
            let mut ledger = self.ledger.lock().unwrap();
            let cache = self.cache.lock().unwrap();
            ledger.close_all(|sym| cache.last_price(sym), self.cfg.taker_fee, reason, now)
        };
        {
            let mut history = self.history.lock().unwrap();
            for trade in &closed {
                let _ = history.record_trade(trade);
            }
        }
        if !closed.is_empty() {
            let total: f64 = closed.iter().map(|t| t.realized_pnl).sum();
            self.notifier
                .notify(
                    Urgency::Alert,
                    &format!("closed all {} positions ({}, pnl {:+.2})", closed.len(), reason, total),
                )
                .await;
        }
        closed
    }
}
