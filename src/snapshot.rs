//! Typed funding-rate snapshots.
//!
//! Raw exchange records cross into the system exactly once, through
//! [`FundingSnapshot::from_raw`]. Malformed entries are rejected there instead
//! of being guarded at every downstream call site.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a snapshot's data came from when a consumer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Live,
    Cached,
}

/// Funding settlement cadence bucket. Contracts are scanned and cached per
/// bucket because their rates refresh on different clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleBucket {
    H1,
    H2,
    H4,
    H8,
    Other,
}

impl SettleBucket {
    pub fn from_hours(hours: u32) -> Self {
        match hours {
            1 => SettleBucket::H1,
            2 => SettleBucket::H2,
            4 => SettleBucket::H4,
            8 => SettleBucket::H8,
            _ => SettleBucket::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettleBucket::H1 => "1h",
            SettleBucket::H2 => "2h",
            SettleBucket::H4 => "4h",
            SettleBucket::H8 => "8h",
            SettleBucket::Other => "other",
        }
    }
}

/// Unvalidated exchange record, one per symbol per fetch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSnapshot {
    pub symbol: String,
    /// Absent when the exchange omits the field for a contract.
    pub funding_rate: Option<f64>,
    pub mark_price: f64,
    pub volume_24h: f64,
    /// Epoch millis of the next funding settlement, when known.
    pub next_settlement_ms: Option<i64>,
    pub funding_interval_hours: Option<u32>,
}

/// One validated observation of a contract. Immutable; superseded by a newer
/// snapshot, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub symbol: String,
    /// Signed fraction per settlement interval. 0.0 when the exchange omitted
    /// the field; such contracts never pass a positive threshold.
    pub funding_rate: f64,
    /// 0.0 means no usable price; consumers fall back to the last cached one.
    pub mark_price: f64,
    pub volume_24h: f64,
    pub next_settlement: Option<i64>,
    pub observed_at: i64,
    pub source: Source,
    pub bucket: SettleBucket,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotError {
    EmptySymbol,
    BadRate { symbol: String, rate: f64 },
    BadPrice { symbol: String, price: f64 },
    BadVolume { symbol: String, volume: f64 },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::EmptySymbol => write!(f, "snapshot with empty symbol"),
            SnapshotError::BadRate { symbol, rate } => {
                write!(f, "{}: non-finite funding rate {}", symbol, rate)
            }
            SnapshotError::BadPrice { symbol, price } => {
                write!(f, "{}: invalid mark price {}", symbol, price)
            }
            SnapshotError::BadVolume { symbol, volume } => {
                write!(f, "{}: negative volume {}", symbol, volume)
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

impl FundingSnapshot {
    /// The single normalization point for raw exchange data.
    pub fn from_raw(raw: RawSnapshot, now: i64) -> Result<Self, SnapshotError> {
        if raw.symbol.is_empty() {
            return Err(SnapshotError::EmptySymbol);
        }
        let funding_rate = match raw.funding_rate {
            Some(r) if !r.is_finite() => {
                return Err(SnapshotError::BadRate { symbol: raw.symbol, rate: r })
            }
            Some(r) => r,
            None => 0.0,
        };
        if !raw.mark_price.is_finite() || raw.mark_price < 0.0 {
            return Err(SnapshotError::BadPrice { symbol: raw.symbol, price: raw.mark_price });
        }
        if !raw.volume_24h.is_finite() || raw.volume_24h < 0.0 {
            return Err(SnapshotError::BadVolume { symbol: raw.symbol, volume: raw.volume_24h });
        }
        Ok(Self {
            symbol: raw.symbol,
            funding_rate,
            mark_price: raw.mark_price,
            volume_24h: raw.volume_24h,
            next_settlement: raw.next_settlement_ms.map(|ms| ms / 1000),
            observed_at: now,
            source: Source::Live,
            bucket: SettleBucket::from_hours(raw.funding_interval_hours.unwrap_or(8)),
        })
    }

    pub fn age_secs(&self, now: i64) -> i64 {
        (now - self.observed_at).max(0)
    }

    pub fn has_price(&self) -> bool {
        self.mark_price > 0.0
    }
}
