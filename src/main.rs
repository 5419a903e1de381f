use std::sync::Arc;

use anyhow::Result;

use fundingpool::cache::ContractCache;
use fundingpool::config::Config;
use fundingpool::engine::ReconcileEngine;
use fundingpool::exchange::binance::BinanceFutures;
use fundingpool::exec;
use fundingpool::ledger::PositionLedger;
use fundingpool::logging::{json_log, obj, v_num, v_str};
use fundingpool::notify;
use fundingpool::scheduler::Scheduler;
use fundingpool::store::HistoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;

    json_log(
        "startup",
        obj(&[
            ("threshold", v_num(cfg.funding_threshold)),
            ("min_volume", v_num(cfg.min_volume)),
            ("max_pool_size", v_num(cfg.max_pool_size as f64)),
            ("max_positions", v_num(cfg.max_positions as f64)),
            ("capital", v_num(cfg.capital)),
            ("paper_trading", serde_json::Value::Bool(cfg.paper_trading)),
            ("auto_trade", serde_json::Value::Bool(cfg.auto_trade)),
        ]),
    );

    let source = Box::new(BinanceFutures::new(&cfg)?);
    let executor = exec::build(&cfg);
    let notifier = notify::build(&cfg);

    let cache = ContractCache::load(&cfg.cache_path, cfg.cache_ttl_secs)?;
    let ledger = PositionLedger::load(&cfg.state_path, cfg.capital)?;
    json_log(
        "startup",
        obj(&[
            ("event", v_str("state_recovered")),
            ("cached_contracts", v_num(cache.len() as f64)),
            ("open_positions", v_num(ledger.open_count() as f64)),
            ("pool_size", v_num(ledger.pool().len() as f64)),
            ("available_capital", v_num(ledger.capital().available)),
        ]),
    );

    let mut history = HistoryStore::new(&cfg.sqlite_path)?;
    history.init()?;

    let engine = Arc::new(ReconcileEngine::new(
        cfg.clone(),
        source,
        executor,
        notifier,
        cache,
        ledger,
        history,
    ));

    let mut scheduler = Scheduler::new(cfg, engine.clone());
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    json_log("shutdown", obj(&[("event", v_str("signal_received"))]));
    scheduler.stop().await;

    let status = engine.status();
    json_log(
        "shutdown",
        obj(&[
            ("pool_size", v_num(status.pool.len() as f64)),
            ("open_positions", v_num(status.positions.len() as f64)),
            ("realized_pnl", v_num(status.realized_pnl)),
            ("win_rate", v_num(status.win_rate)),
        ]),
    );
    Ok(())
}
