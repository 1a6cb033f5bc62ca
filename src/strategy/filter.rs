use crate::models::{gte, lte, Candidate, Direction, PairSnapshot, Side};
use crate::strategy::StrategyConfig;

/// Stateless predicate + ranking over a gate-passed snapshot.
///
/// Applies the admission thresholds as a conjunction, decides the side per
/// the engine's direction mode, and returns a ranked, bounded candidate
/// list. Rows lacking a usable price or a required optional field are
/// dropped, never errored on.
pub struct StrategyFilter;

impl StrategyFilter {
    pub fn candidates(
        snapshot: &[PairSnapshot],
        cfg: &StrategyConfig,
        direction: Direction,
    ) -> Vec<Candidate> {
        let venues: Vec<String> = cfg.allow_venues.iter().map(|v| v.to_lowercase()).collect();

        let mut out: Vec<Candidate> = snapshot
            .iter()
            .filter_map(|row| Self::qualify(row, cfg, &venues, direction))
            .collect();

        // Deterministic ranking: score, then tx-rate, then liquidity, all
        // descending; pair name breaks remaining ties.
        out.sort_by(|a, b| {
            b.momentum_score
                .cmp(&a.momentum_score)
                .then(b.txns_1h.cmp(&a.txns_1h))
                .then(
                    b.liquidity_usd
                        .partial_cmp(&a.liquidity_usd)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then_with(|| a.pair.cmp(&b.pair))
        });
        out.truncate(cfg.max_candidates);
        out
    }

    fn qualify(
        row: &PairSnapshot,
        cfg: &StrategyConfig,
        venues: &[String],
        direction: Direction,
    ) -> Option<Candidate> {
        let price = row.usable_price()?;
        row.base_symbol()?;

        if !venues.contains(&row.venue.to_lowercase()) {
            return None;
        }
        if row.momentum_score < cfg.min_score {
            return None;
        }
        if row.txns_1h < cfg.min_txns_1h {
            return None;
        }
        if !gte(row.liquidity_usd, cfg.liquidity_min_usd)
            || !lte(row.liquidity_usd, cfg.liquidity_max_usd)
        {
            return None;
        }
        if !gte(row.turnover(), cfg.turnover_min) {
            return None;
        }
        let chg24 = row.change_24h.unwrap_or(0.0);
        if !gte(chg24, cfg.change_24h_min) || !lte(chg24, cfg.change_24h_max) {
            return None;
        }

        let side = match direction {
            Direction::Long => Side::Long,
            Direction::Short => {
                if !Self::momentum_reversal(row) {
                    return None;
                }
                Side::Short
            }
            Direction::Both => {
                if Self::momentum_reversal(row) {
                    Side::Short
                } else {
                    Side::Long
                }
            }
        };

        Some(Candidate {
            pair: row.pair.clone(),
            venue: row.venue.to_lowercase(),
            side,
            price_usd: price,
            momentum_score: row.momentum_score,
            txns_1h: row.txns_1h,
            liquidity_usd: row.liquidity_usd,
            volume_24h_usd: row.volume_24h_usd,
            change_24h: row.change_24h,
        })
    }

    /// Short-side predicate: momentum rolling over on both the 1h and the
    /// 4h (or 6h) window. Missing fields mean no reversal signal.
    fn momentum_reversal(row: &PairSnapshot) -> bool {
        match (row.change_1h, row.change_4h) {
            (Some(h1), Some(h4)) => h1 < 0.0 && h4 < 0.0,
            _ => false,
        }
    }
}
