// Candidate selection over a market snapshot
pub mod filter;
pub mod heat;

pub use filter::StrategyFilter;
pub use heat::MarketHeatGate;

use serde::{Deserialize, Serialize};

/// Admission thresholds for entry candidates. Read-only during a tick.
///
/// All percentage fields are signed fractions; all currency fields are USD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Minimum momentum score (0-100).
    pub min_score: u8,
    /// Minimum buys+sells over the last hour.
    pub min_txns_1h: u32,
    pub liquidity_min_usd: f64,
    pub liquidity_max_usd: f64,
    /// Minimum volume-24h / liquidity ratio.
    pub turnover_min: f64,
    /// Accepted 24h-change band, fractions.
    pub change_24h_min: f64,
    pub change_24h_max: f64,
    /// Venue allow-list, matched case-insensitively.
    pub allow_venues: Vec<String>,
    /// Market heat gate: pairs ranked by volume-24h considered for the mean.
    pub heat_top_n: usize,
    /// Minimum mean txns-1h across the top-N for new entries to be allowed.
    pub heat_avg_tx_min: f64,
    /// Cap on the ranked candidate list.
    pub max_candidates: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_score: 70,
            min_txns_1h: 200,
            liquidity_min_usd: 10_000.0,
            liquidity_max_usd: 200_000.0,
            turnover_min: 1.2,
            change_24h_min: -0.08,
            change_24h_max: 1.80,
            allow_venues: vec![
                "raydium".to_string(),
                "orca".to_string(),
                "meteora".to_string(),
                "lifinity".to_string(),
            ],
            heat_top_n: 10,
            heat_avg_tx_min: 120.0,
            max_candidates: 20,
        }
    }
}
