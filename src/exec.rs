use anyhow::{bail, Result};

use crate::config::Config;
use crate::ledger::Side;
use crate::logging::{json_log, obj, v_num, v_str};

#[derive(Debug, Clone, Copy)]
pub struct ExecutedFill {
    pub price: f64,
    pub fee: f64,
}

/// Execution seam between the engine and a venue. The engine decides what to
/// trade; the executor decides how a fill happens.
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, symbol: &str, side: Side, action: &str, quantity: f64, mark_price: f64)
        -> Result<ExecutedFill>;
}

/// Paper execution: fills at the mark price, charging the configured fee.
pub struct PaperExecutor {
    taker_fee: f64,
}

impl PaperExecutor {
    pub fn new(taker_fee: f64) -> Self {
        Self { taker_fee }
    }
}

impl Executor for PaperExecutor {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn execute(
        &self,
        symbol: &str,
        side: Side,
        action: &str,
        quantity: f64,
        mark_price: f64,
    ) -> Result<ExecutedFill> {
        if mark_price <= 0.0 {
            bail!("{}: cannot fill without a price", symbol);
        }
        let fee = quantity * mark_price * self.taker_fee;
        json_log(
            "exec",
            obj(&[
                ("venue", v_str("paper")),
                ("action", v_str(action)),
                ("symbol", v_str(symbol)),
                ("side", v_str(side.as_str())),
                ("qty", v_num(quantity)),
                ("price", v_num(mark_price)),
                ("fee", v_num(fee)),
            ]),
        );
        Ok(ExecutedFill { price: mark_price, fee })
    }
}

/// Placeholder for live order routing, which is not wired. Refusing loudly
/// beats silently paper-filling when the operator asked for live trading.
pub struct LiveStub;

impl Executor for LiveStub {
    fn name(&self) -> &'static str {
        "live-stub"
    }

    fn execute(
        &self,
        symbol: &str,
        _side: Side,
        action: &str,
        _quantity: f64,
        _mark_price: f64,
    ) -> Result<ExecutedFill> {
        bail!("live order routing is not wired; refusing {} {}", action, symbol)
    }
}

pub fn build(cfg: &Config) -> Box<dyn Executor> {
    if cfg.paper_trading {
        Box::new(PaperExecutor::new(cfg.taker_fee))
    } else {
        json_log(
            "exec",
            obj(&[("venue", v_str("live-stub")), ("warning", v_str("live_routing_not_wired"))]),
        );
        Box::new(LiveStub)
    }
}
