use anyhow::{bail, Result};

/// Runtime configuration. Every knob is an env var with a default so the
/// binary runs without a config file; `validate` rejects combinations the
/// engine cannot operate under.
#[derive(Clone, Debug)]
pub struct Config {
    /// Minimum |funding rate| for pool membership, signed fraction per interval.
    pub funding_threshold: f64,
    /// Minimum 24h quote volume for pool membership.
    pub min_volume: f64,
    pub max_pool_size: usize,
    /// Cap on simultaneously open positions.
    pub max_positions: usize,
    /// Max total open notional as a fraction of total capital.
    pub max_exposure_pct: f64,
    /// Adverse price move fraction that force-closes a position.
    pub stop_loss_ratio: f64,
    /// Favorable price move fraction that takes profit.
    pub take_profit_ratio: f64,
    pub cache_ttl_secs: u64,
    /// Fast funding-rate poll driving reconciliation ticks.
    pub poll_secs: u64,
    /// Slow full-universe rescan.
    pub rescan_secs: u64,
    /// Risk sweep cadence.
    pub sweep_secs: u64,
    pub auto_trade: bool,
    pub paper_trading: bool,
    /// Starting paper capital in quote currency.
    pub capital: f64,
    /// Notional committed per opened position.
    pub order_notional: f64,
    /// Fee fraction charged per fill by the paper executor.
    pub taker_fee: f64,
    pub state_path: String,
    pub cache_path: String,
    pub sqlite_path: String,
    pub fapi_base: String,
    pub http_timeout_secs: u64,
    pub telegram_token: Option<String>,
    pub telegram_chat: Option<String>,
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            funding_threshold: env_f64("FUNDING_THRESHOLD", 0.004),
            min_volume: env_f64("MIN_VOLUME", 1_000_000.0),
            max_pool_size: env_usize("MAX_POOL_SIZE", 10),
            max_positions: env_usize("MAX_POSITIONS", 5),
            max_exposure_pct: env_f64("MAX_EXPOSURE_PCT", 0.8),
            stop_loss_ratio: env_f64("STOP_LOSS_RATIO", 0.05),
            take_profit_ratio: env_f64("TAKE_PROFIT_RATIO", 0.10),
            cache_ttl_secs: env_u64("CACHE_TTL_SECS", 3600),
            poll_secs: env_u64("POLL_SECS", 300),
            rescan_secs: env_u64("RESCAN_SECS", 14_400),
            sweep_secs: env_u64("SWEEP_SECS", 120),
            auto_trade: env_bool("AUTO_TRADE", true),
            paper_trading: env_bool("PAPER_TRADING", true),
            capital: env_f64("CAPITAL", 10_000.0),
            order_notional: env_f64("ORDER_NOTIONAL", 500.0),
            taker_fee: env_f64("TAKER_FEE", 0.0),
            state_path: std::env::var("STATE_PATH").unwrap_or_else(|_| "./fundingpool.state.json".to_string()),
            cache_path: std::env::var("CACHE_PATH").unwrap_or_else(|_| "./fundingpool.cache.json".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./fundingpool.sqlite".to_string()),
            fapi_base: std::env::var("BINANCE_FAPI_BASE").unwrap_or_else(|_| "https://fapi.binance.com".to_string()),
            http_timeout_secs: env_u64("HTTP_TIMEOUT_SECS", 10),
            telegram_token: std::env::var("TELEGRAM_TOKEN").ok(),
            telegram_chat: std::env::var("TELEGRAM_CHAT").ok(),
        }
    }

    /// Reject configurations the engine cannot run under. A zero threshold
    /// would admit every contract with a missing rate into the pool.
    pub fn validate(&self) -> Result<()> {
        if self.funding_threshold <= 0.0 {
            bail!("FUNDING_THRESHOLD must be > 0, got {}", self.funding_threshold);
        }
        if self.min_volume < 0.0 {
            bail!("MIN_VOLUME must be >= 0, got {}", self.min_volume);
        }
        if self.max_pool_size == 0 {
            bail!("MAX_POOL_SIZE must be > 0");
        }
        if self.max_positions == 0 {
            bail!("MAX_POSITIONS must be > 0");
        }
        if !(0.0..=1.0).contains(&self.max_exposure_pct) || self.max_exposure_pct == 0.0 {
            bail!("MAX_EXPOSURE_PCT must be in (0, 1], got {}", self.max_exposure_pct);
        }
        if self.stop_loss_ratio <= 0.0 || self.take_profit_ratio <= 0.0 {
            bail!("STOP_LOSS_RATIO and TAKE_PROFIT_RATIO must be > 0");
        }
        if self.capital <= 0.0 || self.order_notional <= 0.0 {
            bail!("CAPITAL and ORDER_NOTIONAL must be > 0");
        }
        if self.order_notional > self.capital {
            bail!(
                "ORDER_NOTIONAL {} exceeds CAPITAL {}",
                self.order_notional,
                self.capital
            );
        }
        if self.poll_secs == 0 || self.sweep_secs == 0 || self.rescan_secs == 0 {
            bail!("scheduler intervals must be > 0");
        }
        Ok(())
    }

    /// Max open notional in quote currency.
    pub fn max_total_exposure(&self) -> f64 {
        self.capital * self.max_exposure_pct
    }
}

/// Seconds until the next wall-clock hour boundary. The hourly rebuild loop
/// aligns to this rather than a fixed countdown so restarts re-align.
pub fn secs_until_next_hour(now_ts: i64) -> u64 {
    let next = (now_ts / 3600 + 1) * 3600;
    (next - now_ts) as u64
}
