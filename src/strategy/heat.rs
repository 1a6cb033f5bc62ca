use crate::models::{gte, PairSnapshot};
use crate::strategy::StrategyConfig;

/// Snapshot-wide precondition over aggregate trading activity.
///
/// Computes the mean txns-1h of the top-N pairs by 24h volume. When the gate
/// fails, the engine suppresses new entries for the tick; existing positions
/// are still marked to market and swept for exits. It never forces
/// liquidation.
pub struct MarketHeatGate;

impl MarketHeatGate {
    /// True when the market is hot enough to admit new entries.
    ///
    /// Fails closed: an empty snapshot, a zero top-N, or fewer rows than
    /// `heat_top_n` all return false.
    pub fn check(snapshot: &[PairSnapshot], cfg: &StrategyConfig) -> bool {
        if cfg.heat_top_n == 0 || snapshot.len() < cfg.heat_top_n {
            return false;
        }

        let mut by_volume: Vec<&PairSnapshot> = snapshot.iter().collect();
        by_volume.sort_by(|a, b| {
            b.volume_24h_usd
                .partial_cmp(&a.volume_24h_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let top = &by_volume[..cfg.heat_top_n];
        let avg_tx = top.iter().map(|p| p.txns_1h as f64).sum::<f64>() / top.len() as f64;

        gte(avg_tx, cfg.heat_avg_tx_min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PairSnapshot;

    fn pair(pair: &str, volume: f64, txns: u32) -> PairSnapshot {
        PairSnapshot {
            pair: pair.to_string(),
            venue: "raydium".to_string(),
            price_usd: Some(1.0),
            liquidity_usd: 50_000.0,
            volume_24h_usd: volume,
            txns_1h: txns,
            momentum_score: 50,
            change_1h: None,
            change_4h: None,
            change_24h: None,
            created_at: None,
            url: String::new(),
            base_address: String::new(),
        }
    }

    fn cfg(top_n: usize, avg_min: f64) -> StrategyConfig {
        StrategyConfig {
            heat_top_n: top_n,
            heat_avg_tx_min: avg_min,
            ..StrategyConfig::default()
        }
    }

    #[test]
    fn test_empty_snapshot_fails_closed() {
        assert!(!MarketHeatGate::check(&[], &cfg(10, 120.0)));
    }

    #[test]
    fn test_fewer_rows_than_top_n_fails_closed() {
        let rows = vec![pair("A/SOL", 1000.0, 500), pair("B/SOL", 900.0, 500)];
        assert!(!MarketHeatGate::check(&rows, &cfg(3, 1.0)));
    }

    #[test]
    fn test_mean_over_top_n_by_volume() {
        // Top 2 by volume have 200 and 100 txns -> mean 150; the busy
        // low-volume pair must not be counted.
        let rows = vec![
            pair("A/SOL", 5000.0, 200),
            pair("B/SOL", 4000.0, 100),
            pair("C/SOL", 10.0, 9999),
        ];
        assert!(MarketHeatGate::check(&rows, &cfg(2, 150.0)));
        assert!(!MarketHeatGate::check(&rows, &cfg(2, 151.0)));
    }

    #[test]
    fn test_exact_threshold_passes() {
        let rows = vec![pair("A/SOL", 100.0, 120)];
        assert!(MarketHeatGate::check(&rows, &cfg(1, 120.0)));
    }
}
