use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{gte, lte, Candidate, Direction, Side};

/// One rung of the R-multiple partial take-profit ladder.
///
/// `multiple` is expressed in R (multiples of the stop-loss distance);
/// `fraction` is the share of the *current remaining* size realized when the
/// rung fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LadderStep {
    pub multiple: f64,
    pub fraction: f64,
}

/// Portfolio-level risk policy. Read-only during a tick; may be swapped
/// between ticks without rewriting the stop/ladder state of positions
/// already open.
///
/// All percentage fields are signed fractions; all currency fields are USD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    // sizing & limits
    pub position_usd: f64,
    pub max_positions: usize,
    pub max_positions_per_symbol: u32,
    pub daily_loss_limit_usd: f64,

    // exits
    pub stop_loss_pct: f64,
    /// Legacy take-profit, used only when `use_r_multiple` is off.
    pub take_profit_pct: f64,
    pub trailing_pct: f64,
    pub time_stop_min: i64,

    // break-even lock
    pub be_trigger_pct: f64,
    pub be_lock_profit_pct: f64,
    pub dd_lock_pct: f64,

    // anti-duplicate
    pub symbol_cooldown_min: i64,
    pub allow_pyramiding: bool,
    pub pyramid_add_on_trigger_pct: f64,

    // direction & R-multiple ladder
    pub direction: Direction,
    pub use_r_multiple: bool,
    pub partial_tp_enable: bool,
    /// Ascending rungs, e.g. `[(2.0, 0.5), (3.0, 0.25)]`.
    pub partial_ladder: Vec<LadderStep>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            position_usd: 50.0,
            max_positions: 3,
            max_positions_per_symbol: 1,
            daily_loss_limit_usd: 200.0,
            stop_loss_pct: 0.20,
            take_profit_pct: 0.40,
            trailing_pct: 0.15,
            time_stop_min: 60,
            be_trigger_pct: 0.10,
            be_lock_profit_pct: 0.02,
            dd_lock_pct: 0.06,
            symbol_cooldown_min: 20,
            allow_pyramiding: false,
            pyramid_add_on_trigger_pct: 0.08,
            direction: Direction::Long,
            use_r_multiple: true,
            partial_tp_enable: true,
            partial_ladder: vec![LadderStep { multiple: 2.0, fraction: 0.5 }],
        }
    }
}

impl RiskConfig {
    /// Ladder rungs sorted ascending by multiple, invalid fractions dropped.
    pub fn sorted_ladder(&self) -> Vec<LadderStep> {
        let mut rungs: Vec<LadderStep> = self
            .partial_ladder
            .iter()
            .copied()
            .filter(|r| r.fraction > 0.0 && r.fraction <= 1.0 && r.multiple > 0.0)
            .collect();
        rungs.sort_by(|a, b| a.multiple.partial_cmp(&b.multiple).unwrap_or(std::cmp::Ordering::Equal));
        rungs
    }
}

/// Why a ranked candidate was not opened. A normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoFreeSlots,
    DuplicateSymbol,
    Cooldown,
    PyramidTriggerNotMet,
    CircuitBreaker,
}

/// Mutable per-engine risk bookkeeping: daily P&L with UTC day rollover,
/// per-symbol cooldown timestamps and open-position counts.
#[derive(Debug, Clone)]
pub struct RiskState {
    pub daily_pnl: f64,
    day: NaiveDate,
    last_open: HashMap<String, DateTime<Utc>>,
    open_count: HashMap<String, u32>,
}

impl RiskState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_pnl: 0.0,
            day: now.date_naive(),
            last_open: HashMap::new(),
            open_count: HashMap::new(),
        }
    }

    /// Reset daily P&L when the UTC date has advanced. Cooldown bookkeeping
    /// survives the rollover.
    pub fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            tracing::info!(
                day = %today,
                prior_daily_pnl = self.daily_pnl,
                "daily P&L reset at day boundary"
            );
            self.day = today;
            self.daily_pnl = 0.0;
        }
    }

    pub fn open_count(&self, base: &str) -> u32 {
        self.open_count.get(base).copied().unwrap_or(0)
    }

    pub fn last_open(&self, base: &str) -> Option<DateTime<Utc>> {
        self.last_open.get(base).copied()
    }

    /// Bookkeeping for an accepted open; called atomically with the open.
    pub fn note_open(&mut self, base: &str, now: DateTime<Utc>) {
        self.last_open.insert(base.to_string(), now);
        *self.open_count.entry(base.to_string()).or_insert(0) += 1;
    }

    /// Bookkeeping for a full close.
    pub fn note_close(&mut self, base: &str) {
        let count = self
            .open_count
            .get_mut(base)
            .unwrap_or_else(|| panic!("close for untracked symbol {base}"));
        assert!(*count > 0, "open_count underflow for {base}");
        *count -= 1;
    }
}

/// Admission control over ranked candidates.
pub struct RiskManager;

impl RiskManager {
    /// Per-candidate admission check, in spec order: per-symbol cap,
    /// cooldown, pyramiding trigger. The caller supplies the most recent
    /// entry price among open positions on the symbol for the add-on check.
    pub fn admit(
        cfg: &RiskConfig,
        state: &RiskState,
        candidate: &Candidate,
        last_entry_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        let base = candidate
            .pair
            .split_once('/')
            .map(|(b, _)| b)
            .unwrap_or(candidate.pair.as_str());

        let needs_add_on = state.open_count(base) >= cfg.max_positions_per_symbol;
        if needs_add_on && !cfg.allow_pyramiding {
            return Err(RejectReason::DuplicateSymbol);
        }

        if let Some(last) = state.last_open(base) {
            if (now - last).num_seconds() < cfg.symbol_cooldown_min * 60 {
                return Err(RejectReason::Cooldown);
            }
        }

        if needs_add_on {
            let last_entry = last_entry_price.ok_or(RejectReason::PyramidTriggerNotMet)?;
            let trigger_met = match candidate.side {
                Side::Long => gte(candidate.price_usd, last_entry * (1.0 + cfg.pyramid_add_on_trigger_pct)),
                Side::Short => lte(candidate.price_usd, last_entry * (1.0 - cfg.pyramid_add_on_trigger_pct)),
            };
            if !trigger_met {
                return Err(RejectReason::PyramidTriggerNotMet);
            }
        }

        Ok(())
    }

    /// Portfolio circuit breaker: realized daily P&L plus the unrealized sum
    /// of open positions at or below the negative daily limit. Checked once
    /// per tick, not per candidate.
    pub fn circuit_breaker_tripped(cfg: &RiskConfig, state: &RiskState, unrealized_sum: f64) -> bool {
        lte(state.daily_pnl + unrealized_sum, -cfg.daily_loss_limit_usd.abs())
    }
}
