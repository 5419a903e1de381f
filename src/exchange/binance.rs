use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::exchange::FundingSource;
use crate::snapshot::RawSnapshot;

/// Binance USD-M perpetual futures, public market-data endpoints only.
pub struct BinanceFutures {
    client: Client,
    base: String,
}

impl BinanceFutures {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;
        Ok(Self { client, base: cfg.fapi_base.clone() })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} -> {}: {}", path, status.as_u16(), body));
        }
        Ok(resp.json().await?)
    }

    /// Funding interval hours per symbol. The endpoint only lists contracts
    /// that deviate from the 8h default, and it is non-essential: on failure
    /// every contract falls back to 8h.
    async fn fetch_intervals(&self) -> HashMap<String, u32> {
        let infos: Vec<FundingInfo> = match self.get_json("/fapi/v1/fundingInfo").await {
            Ok(v) => v,
            Err(_) => return HashMap::new(),
        };
        infos
            .into_iter()
            .map(|i| (i.symbol, i.funding_interval_hours))
            .collect()
    }
}

#[derive(Deserialize, Debug)]
struct PremiumIndex {
    symbol: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

#[derive(Deserialize, Debug)]
struct Ticker24h {
    symbol: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
}

#[derive(Deserialize, Debug)]
struct FundingInfo {
    symbol: String,
    #[serde(rename = "fundingIntervalHours")]
    funding_interval_hours: u32,
}

fn to_raw(idx: PremiumIndex, volume_24h: f64, interval_hours: Option<u32>) -> RawSnapshot {
    RawSnapshot {
        funding_rate: idx.last_funding_rate.parse::<f64>().ok(),
        mark_price: idx.mark_price.parse::<f64>().unwrap_or(0.0),
        volume_24h,
        next_settlement_ms: (idx.next_funding_time > 0).then_some(idx.next_funding_time),
        funding_interval_hours: interval_hours,
        symbol: idx.symbol,
    }
}

#[async_trait]
impl FundingSource for BinanceFutures {
    async fn fetch_all(&self) -> Result<Vec<RawSnapshot>> {
        let indices: Vec<PremiumIndex> = self.get_json("/fapi/v1/premiumIndex").await?;
        let tickers: Vec<Ticker24h> = self.get_json("/fapi/v1/ticker/24hr").await?;
        let intervals = self.fetch_intervals().await;

        let volumes: HashMap<String, f64> = tickers
            .into_iter()
            .map(|t| {
                let v = t.quote_volume.parse::<f64>().unwrap_or(0.0);
                (t.symbol, v)
            })
            .collect();

        Ok(indices
            .into_iter()
            .map(|idx| {
                let volume = volumes.get(&idx.symbol).copied().unwrap_or(0.0);
                let hours = intervals.get(&idx.symbol).copied();
                to_raw(idx, volume, hours)
            })
            .collect())
    }

    async fn fetch_one(&self, symbol: &str) -> Result<Option<RawSnapshot>> {
        let path = format!("/fapi/v1/premiumIndex?symbol={}", symbol);
        let url = format!("{}{}", self.base, path);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        // Unknown symbol answers 400; that is "not listed", not a failure.
        if status.as_u16() == 400 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("GET {} -> {}", path, status.as_u16()));
        }
        let idx: PremiumIndex = resp.json().await?;

        let volume = match self
            .get_json::<Ticker24h>(&format!("/fapi/v1/ticker/24hr?symbol={}", symbol))
            .await
        {
            Ok(t) => t.quote_volume.parse::<f64>().unwrap_or(0.0),
            Err(_) => 0.0,
        };
        Ok(Some(to_raw(idx, volume, None)))
    }

    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64> {
        let idx: PremiumIndex = self
            .get_json(&format!("/fapi/v1/premiumIndex?symbol={}", symbol))
            .await?;
        let price = idx.mark_price.parse::<f64>().unwrap_or(0.0);
        if price <= 0.0 {
            return Err(anyhow!("{}: no usable mark price", symbol));
        }
        Ok(price)
    }
}
