//! Pool selection: the pure candidate filter/rank at the heart of each tick.

use std::collections::HashMap;

use crate::snapshot::FundingSnapshot;

/// Rank qualifying symbols: `|funding_rate| >= threshold` and
/// `volume_24h >= min_volume`, ordered by `|funding_rate|` descending with an
/// ascending-symbol tie-break for determinism, truncated to `max_pool_size`.
///
/// Pure function; an empty snapshot map yields an empty pool. Callers are
/// responsible for rejecting a zero threshold at configuration time —
/// contracts with a missing rate carry 0.0 and must never qualify.
pub fn select_pool(
    snapshots: &HashMap<String, FundingSnapshot>,
    threshold: f64,
    min_volume: f64,
    max_pool_size: usize,
) -> Vec<String> {
    let mut candidates: Vec<(&String, f64)> = snapshots
        .iter()
        .filter(|(_, s)| s.funding_rate.abs() >= threshold && s.volume_24h >= min_volume)
        .map(|(sym, s)| (sym, s.funding_rate.abs()))
        .collect();

    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    candidates.truncate(max_pool_size);
    candidates.into_iter().map(|(sym, _)| sym.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RawSnapshot;

    fn snaps(entries: &[(&str, f64, f64)]) -> HashMap<String, FundingSnapshot> {
        entries
            .iter()
            .map(|(sym, rate, vol)| {
                let s = FundingSnapshot::from_raw(
                    RawSnapshot {
                        symbol: sym.to_string(),
                        funding_rate: Some(*rate),
                        mark_price: 100.0,
                        volume_24h: *vol,
                        next_settlement_ms: None,
                        funding_interval_hours: None,
                    },
                    0,
                )
                .unwrap();
                (sym.to_string(), s)
            })
            .collect()
    }

    #[test]
    fn test_empty_map_empty_pool() {
        let pool = select_pool(&HashMap::new(), 0.005, 1e6, 5);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_threshold_filter() {
        let snaps = snaps(&[
            ("BTCUSDT", 0.006, 2e6),
            ("ETHUSDT", 0.004, 2e6), // below threshold
            ("XRPUSDT", -0.007, 2e6), // negative rate qualifies on magnitude
        ]);
        let pool = select_pool(&snaps, 0.005, 1e6, 5);
        assert_eq!(pool, vec!["XRPUSDT", "BTCUSDT"]);
    }

    #[test]
    fn test_volume_filter() {
        let snaps = snaps(&[
            ("BTCUSDT", 0.008, 2e6),
            ("THINUSDT", 0.02, 50_000.0), // huge rate, no volume
        ]);
        let pool = select_pool(&snaps, 0.005, 1e6, 5);
        assert_eq!(pool, vec!["BTCUSDT"]);
    }

    #[test]
    fn test_ranked_by_abs_rate_desc() {
        let snaps = snaps(&[
            ("AUSDT", 0.006, 2e6),
            ("BUSDT", -0.010, 2e6),
            ("CUSDT", 0.008, 2e6),
        ]);
        let pool = select_pool(&snaps, 0.005, 1e6, 5);
        assert_eq!(pool, vec!["BUSDT", "CUSDT", "AUSDT"]);
    }

    #[test]
    fn test_tie_break_ascending_symbol() {
        let snaps = snaps(&[
            ("ZUSDT", 0.006, 2e6),
            ("AUSDT", 0.006, 2e6),
            ("MUSDT", -0.006, 2e6),
        ]);
        let pool = select_pool(&snaps, 0.005, 1e6, 5);
        assert_eq!(pool, vec!["AUSDT", "MUSDT", "ZUSDT"]);
    }

    #[test]
    fn test_truncation_to_max_pool_size() {
        let snaps = snaps(&[
            ("AUSDT", 0.006, 2e6),
            ("BUSDT", 0.010, 2e6),
            ("CUSDT", 0.008, 2e6),
            ("DUSDT", 0.007, 2e6),
        ]);
        let pool = select_pool(&snaps, 0.005, 1e6, 2);
        assert_eq!(pool, vec!["BUSDT", "CUSDT"]);
    }

    #[test]
    fn test_boundary_rate_qualifies() {
        let snaps = snaps(&[("AUSDT", 0.005, 1e6)]);
        let pool = select_pool(&snaps, 0.005, 1e6, 5);
        assert_eq!(pool, vec!["AUSDT"]);
    }

    #[test]
    fn test_missing_rate_never_qualifies() {
        let mut map = snaps(&[("AUSDT", 0.006, 2e6)]);
        let no_rate = FundingSnapshot::from_raw(
            RawSnapshot {
                symbol: "NORATEUSDT".to_string(),
                funding_rate: None,
                mark_price: 100.0,
                volume_24h: 2e6,
                next_settlement_ms: None,
                funding_interval_hours: None,
            },
            0,
        )
        .unwrap();
        map.insert("NORATEUSDT".to_string(), no_rate);
        let pool = select_pool(&map, 0.005, 1e6, 5);
        assert_eq!(pool, vec!["AUSDT"]);
    }

    #[test]
    fn test_output_bounded_and_qualifying() {
        // Every returned symbol satisfies both filters and the output never
        // exceeds the cap, whatever the input.
        let snaps = snaps(&[
            ("AUSDT", 0.0051, 1.5e6),
            ("BUSDT", 0.02, 9e5),
            ("CUSDT", -0.03, 3e6),
            ("DUSDT", 0.0001, 5e6),
            ("EUSDT", 0.0049, 5e6),
        ]);
        let pool = select_pool(&snaps, 0.005, 1e6, 2);
        assert!(pool.len() <= 2);
        for sym in &pool {
            let s = &snaps[sym];
            assert!(s.funding_rate.abs() >= 0.005);
            assert!(s.volume_24h >= 1e6);
        }
    }
}
