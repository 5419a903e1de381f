//! Persisted contract cache: symbol -> last-known funding snapshot, grouped
//! by settlement bucket, with a TTL freshness check against wall clock.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::snapshot::{FundingSnapshot, SettleBucket, Source};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub snapshot: FundingSnapshot,
    pub written_at: i64,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    saved_at: i64,
    entries: Vec<CacheEntry>,
}

pub struct ContractCache {
    entries: BTreeMap<String, CacheEntry>,
    path: String,
    ttl_secs: u64,
}

impl ContractCache {
    pub fn new(path: &str, ttl_secs: u64) -> Self {
        Self { entries: BTreeMap::new(), path: path.to_string(), ttl_secs }
    }

    /// Reload from disk. A missing file is an empty cache; entries come back
    /// marked `Cached` so consumers can tell replayed data from live data.
    pub fn load(path: &str, ttl_secs: u64) -> Result<Self> {
        let mut cache = Self::new(path, ttl_secs);
        if path.is_empty() || !Path::new(path).exists() {
            return Ok(cache);
        }
        let data = fs::read_to_string(path).with_context(|| format!("read cache {}", path))?;
        let file: CacheFile =
            serde_json::from_str(&data).with_context(|| format!("parse cache {}", path))?;
        for mut entry in file.entries {
            entry.snapshot.source = Source::Cached;
            cache.entries.insert(entry.snapshot.symbol.clone(), entry);
        }
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, snapshot: FundingSnapshot, now: i64) {
        self.entries
            .insert(snapshot.symbol.clone(), CacheEntry { snapshot, written_at: now });
    }

    /// Merge a partial refresh; symbols absent from `snapshots` keep their
    /// old entries. Returns how many entries were written.
    pub fn merge(&mut self, snapshots: Vec<FundingSnapshot>, now: i64) -> usize {
        let n = snapshots.len();
        for snap in snapshots {
            self.insert(snap, now);
        }
        n
    }

    /// Full universe replacement: delisted symbols drop out. Returns
    /// (inserted, pruned).
    pub fn replace_all(&mut self, snapshots: Vec<FundingSnapshot>, now: i64) -> (usize, usize) {
        let before: Vec<String> = self.entries.keys().cloned().collect();
        let mut next = BTreeMap::new();
        for snap in snapshots {
            next.insert(snap.symbol.clone(), CacheEntry { snapshot: snap, written_at: now });
        }
        let pruned = before.iter().filter(|s| !next.contains_key(*s)).count();
        let inserted = next.len();
        self.entries = next;
        (inserted, pruned)
    }

    pub fn get(&self, symbol: &str) -> Option<&CacheEntry> {
        self.entries.get(symbol)
    }

    /// Last known positive price regardless of age, for price fallback.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.entries
            .get(symbol)
            .map(|e| e.snapshot.mark_price)
            .filter(|p| *p > 0.0)
    }

    fn is_fresh(&self, entry: &CacheEntry, now: i64) -> bool {
        now.saturating_sub(entry.written_at) < self.ttl_secs as i64
    }

    /// Snapshot map for pool selection: only entries within TTL. Stale
    /// symbols are simply absent, which excludes them from consideration.
    pub fn fresh_map(&self, now: i64) -> HashMap<String, FundingSnapshot> {
        self.entries
            .values()
            .filter(|e| self.is_fresh(e, now))
            .map(|e| (e.snapshot.symbol.clone(), e.snapshot.clone()))
            .collect()
    }

    pub fn symbols_in_bucket(&self, bucket: SettleBucket) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.snapshot.bucket == bucket)
            .map(|e| e.snapshot.symbol.clone())
            .collect()
    }

    /// Buckets whose newest entry has aged past the TTL. Empty buckets are
    /// not reported; a bucket with zero members has nothing to go stale.
    pub fn stale_buckets(&self, now: i64) -> Vec<SettleBucket> {
        let mut newest: BTreeMap<SettleBucket, i64> = BTreeMap::new();
        for e in self.entries.values() {
            let slot = newest.entry(e.snapshot.bucket).or_insert(i64::MIN);
            *slot = (*slot).max(e.written_at);
        }
        newest
            .into_iter()
            .filter(|(_, written)| now.saturating_sub(*written) >= self.ttl_secs as i64)
            .map(|(bucket, _)| bucket)
            .collect()
    }

    /// Atomic persistence: write a temp file beside the target, then rename,
    /// so a reader never observes a half-written cache.
    pub fn save(&self, now: i64) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        let file = CacheFile { saved_at: now, entries: self.entries.values().cloned().collect() };
        let body = serde_json::to_string(&file)?;
        let tmp = format!("{}.tmp", self.path);
        fs::write(&tmp, body).with_context(|| format!("write {}", tmp))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("rename {} -> {}", tmp, self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RawSnapshot;

    fn snap(symbol: &str, rate: f64, price: f64, hours: u32, now: i64) -> FundingSnapshot {
        FundingSnapshot::from_raw(
            RawSnapshot {
                symbol: symbol.to_string(),
                funding_rate: Some(rate),
                mark_price: price,
                volume_24h: 1e6,
                next_settlement_ms: None,
                funding_interval_hours: Some(hours),
            },
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_map_respects_ttl() {
        let mut cache = ContractCache::new("", 60);
        cache.insert(snap("BTCUSDT", 0.005, 50_000.0, 8, 1000), 1000);
        cache.insert(snap("ETHUSDT", 0.004, 3000.0, 8, 990), 990);

        // Both inside TTL
        assert_eq!(cache.fresh_map(1010).len(), 2);
        // ETHUSDT (written 990) ages out at 1050, BTCUSDT survives until 1060
        let fresh = cache.fresh_map(1055);
        assert_eq!(fresh.len(), 1);
        assert!(fresh.contains_key("BTCUSDT"));
        assert!(cache.fresh_map(1060).is_empty());
    }

    #[test]
    fn test_merge_keeps_absent_symbols() {
        let mut cache = ContractCache::new("", 3600);
        cache.insert(snap("BTCUSDT", 0.005, 50_000.0, 8, 0), 0);
        let n = cache.merge(vec![snap("ETHUSDT", 0.004, 3000.0, 8, 10)], 10);
        assert_eq!(n, 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("BTCUSDT").is_some());
    }

    #[test]
    fn test_replace_all_prunes_delisted() {
        let mut cache = ContractCache::new("", 3600);
        cache.insert(snap("OLDUSDT", 0.005, 1.0, 8, 0), 0);
        cache.insert(snap("BTCUSDT", 0.005, 50_000.0, 8, 0), 0);
        let (inserted, pruned) = cache.replace_all(vec![snap("BTCUSDT", 0.006, 50_100.0, 8, 10)], 10);
        assert_eq!(inserted, 1);
        assert_eq!(pruned, 1);
        assert!(cache.get("OLDUSDT").is_none());
        assert_eq!(cache.get("BTCUSDT").unwrap().snapshot.funding_rate, 0.006);
    }

    #[test]
    fn test_last_price_ignores_zero() {
        let mut cache = ContractCache::new("", 3600);
        cache.insert(snap("BTCUSDT", 0.005, 0.0, 8, 0), 0);
        assert_eq!(cache.last_price("BTCUSDT"), None);
        cache.insert(snap("BTCUSDT", 0.005, 50_000.0, 8, 5), 5);
        assert_eq!(cache.last_price("BTCUSDT"), Some(50_000.0));
    }

    #[test]
    fn test_bucket_partition() {
        let mut cache = ContractCache::new("", 3600);
        cache.insert(snap("AUSDT", 0.001, 1.0, 1, 0), 0);
        cache.insert(snap("BUSDT", 0.001, 1.0, 8, 0), 0);
        cache.insert(snap("CUSDT", 0.001, 1.0, 8, 0), 0);
        assert_eq!(cache.symbols_in_bucket(SettleBucket::H1), vec!["AUSDT"]);
        assert_eq!(cache.symbols_in_bucket(SettleBucket::H8).len(), 2);
    }

    #[test]
    fn test_stale_buckets() {
        let mut cache = ContractCache::new("", 60);
        cache.insert(snap("AUSDT", 0.001, 1.0, 1, 0), 0);
        cache.insert(snap("BUSDT", 0.001, 1.0, 8, 50), 50);
        // At t=70 the 1h bucket (written 0) is stale, the 8h bucket is not
        assert_eq!(cache.stale_buckets(70), vec![SettleBucket::H1]);
        // At t=200 both are stale
        assert_eq!(cache.stale_buckets(200).len(), 2);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let path = path.to_str().unwrap();

        let mut cache = ContractCache::new(path, 3600);
        cache.insert(snap("BTCUSDT", 0.0061, 50_000.0, 8, 1000), 1000);
        cache.insert(snap("XRPUSDT", -0.0045, 0.5, 4, 1000), 1000);
        cache.save(1000).unwrap();

        let reloaded = ContractCache::load(path, 3600).unwrap();
        assert_eq!(reloaded.len(), 2);
        let btc = reloaded.get("BTCUSDT").unwrap();
        assert_eq!(btc.snapshot.funding_rate, 0.0061);
        assert_eq!(btc.snapshot.source, Source::Cached);
        assert_eq!(btc.written_at, 1000);
        let xrp = reloaded.get("XRPUSDT").unwrap();
        assert_eq!(xrp.snapshot.bucket, SettleBucket::H4);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let cache = ContractCache::load("/nonexistent/cache.json", 60).unwrap();
        assert!(cache.is_empty());
    }
}
