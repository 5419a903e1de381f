use anyhow::Result;
use async_trait::async_trait;

use crate::snapshot::RawSnapshot;

pub mod binance;
pub mod retry;

/// The funding-rate data source. Unreliable by contract: individual lookups
/// may fail, rate-limit, or return partial data; callers degrade to cache.
#[async_trait]
pub trait FundingSource: Send + Sync {
    /// Snapshot the whole perpetual universe in one sweep.
    async fn fetch_all(&self) -> Result<Vec<RawSnapshot>>;

    /// Single-symbol lookup. `Ok(None)` means the symbol is unknown to the
    /// exchange, which is not an error.
    async fn fetch_one(&self, symbol: &str) -> Result<Option<RawSnapshot>>;

    /// Current mark price for one symbol, for risk sweeps.
    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64>;
}
