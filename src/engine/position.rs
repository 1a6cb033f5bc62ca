use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{OpenPositionView, Side, FRAC_EPS};
use crate::risk::{LadderStep, RiskConfig};

/// What last set the stop price. A stop cross closes with reason `trailing`
/// when the trailing rule owns the stop and `stop` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Initial,
    LadderLock,
    Trailing,
}

/// One rung of a position's partial-exit ladder. Fires at most once.
#[derive(Debug, Clone, Copy)]
pub struct LadderRung {
    pub multiple: f64,
    pub fraction: f64,
    pub fired: bool,
}

/// A live simulated position. Owned exclusively by the [`PositionStore`];
/// destroyed on full close. Everything external sees derived snapshots.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    /// "BASE/QUOTE" pair symbol.
    pub symbol: String,
    pub venue: String,
    pub side: Side,
    pub entry_price: f64,
    pub initial_qty: f64,
    pub remaining_qty: f64,
    pub opened_at: DateTime<Utc>,
    pub stop_price: f64,
    pub stop_kind: StopKind,
    /// High-water-mark price for longs, low-water-mark for shorts.
    pub water_mark: f64,
    /// Ascending, fire-once partial-exit rungs.
    pub ladder: Vec<LadderRung>,
    /// Set once unrealized return has ever reached the break-even trigger.
    pub be_armed: bool,
    /// Best favorable return ever seen, for the drawdown lock.
    pub best_return: f64,
    pub last_price: f64,
}

impl Position {
    pub fn open(
        id: Uuid,
        symbol: String,
        venue: String,
        side: Side,
        entry_price: f64,
        cfg: &RiskConfig,
        now: DateTime<Utc>,
    ) -> Self {
        assert!(entry_price > 0.0, "entry price must be positive");
        let qty = cfg.position_usd / entry_price;
        let stop_price = match side {
            Side::Long => entry_price * (1.0 - cfg.stop_loss_pct),
            Side::Short => entry_price * (1.0 + cfg.stop_loss_pct),
        };
        let ladder = if cfg.use_r_multiple && cfg.partial_tp_enable {
            cfg.sorted_ladder()
                .into_iter()
                .map(|LadderStep { multiple, fraction }| LadderRung { multiple, fraction, fired: false })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            id,
            symbol,
            venue,
            side,
            entry_price,
            initial_qty: qty,
            remaining_qty: qty,
            opened_at: now,
            stop_price,
            stop_kind: StopKind::Initial,
            water_mark: entry_price,
            ladder,
            be_armed: false,
            best_return: 0.0,
            last_price: entry_price,
        }
    }

    pub fn base_symbol(&self) -> &str {
        self.symbol.split_once('/').map(|(b, _)| b).unwrap_or(&self.symbol)
    }

    pub fn unrealized_return(&self, price: f64) -> f64 {
        self.side.unrealized_return(self.entry_price, price)
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.pnl_usd(self.entry_price, price, self.remaining_qty)
    }

    /// Remaining notional at entry prices.
    pub fn remaining_usd(&self) -> f64 {
        self.remaining_qty * self.entry_price
    }

    pub fn age_min(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_minutes()
    }

    pub fn partially_closed(&self) -> bool {
        self.remaining_qty < self.initial_qty - FRAC_EPS
    }

    /// Ratchet the stop in the risk-reducing direction only. A proposal that
    /// would loosen the stop is ignored; on a successful move the stop's
    /// provenance is updated.
    pub fn ratchet_stop(&mut self, proposed: f64, kind: StopKind) {
        let tightens = match self.side {
            Side::Long => proposed > self.stop_price,
            Side::Short => proposed < self.stop_price,
        };
        if tightens {
            self.stop_price = proposed;
            self.stop_kind = kind;
        }
    }

    /// Shrink the position by `fraction` of the current remaining size,
    /// returning the quantity realized. Panics on an out-of-range fraction
    /// or a negative result — that is an exit-ladder bug, not an input
    /// condition.
    pub fn reduce(&mut self, fraction: f64) -> f64 {
        assert!(
            fraction > 0.0 && fraction <= 1.0 + FRAC_EPS,
            "ladder fraction out of range: {fraction}"
        );
        let closed_qty = self.remaining_qty * fraction.min(1.0);
        self.remaining_qty -= closed_qty;
        assert!(
            self.remaining_qty >= -FRAC_EPS && self.remaining_qty <= self.initial_qty + FRAC_EPS,
            "remaining size out of bounds: {} of {}",
            self.remaining_qty,
            self.initial_qty
        );
        if self.remaining_qty < FRAC_EPS {
            self.remaining_qty = 0.0;
        }
        closed_qty
    }

    pub fn view(&self, now: DateTime<Utc>) -> OpenPositionView {
        OpenPositionView {
            id: self.id,
            symbol: self.symbol.clone(),
            venue: self.venue.clone(),
            side: self.side,
            entry_price: self.entry_price,
            last_price: self.last_price,
            stop_price: self.stop_price,
            remaining_usd: self.remaining_usd(),
            pnl_usd: self.unrealized_pnl(self.last_price),
            pnl_pct: self.unrealized_return(self.last_price),
            opened_at: self.opened_at,
            partially_closed: self.partially_closed(),
            age_min: self.age_min(now),
        }
    }
}

/// The authoritative table of live positions, keyed by id. Candidate lists
/// and UI projections are derived snapshots, never aliases into this table.
#[derive(Debug, Default)]
pub struct PositionStore {
    positions: HashMap<Uuid, Position>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: Position) {
        let prior = self.positions.insert(position.id, position);
        assert!(prior.is_none(), "duplicate position id");
    }

    pub fn get(&self, id: Uuid) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Position> {
        self.positions.get_mut(&id)
    }

    /// Remove a fully closed position from the table.
    pub fn remove(&mut self, id: Uuid) -> Option<Position> {
        self.positions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Ids ordered by open time (ties broken by id) so sweeps and views are
    /// deterministic.
    pub fn ids_by_open_time(&self) -> Vec<Uuid> {
        let mut ids: Vec<(DateTime<Utc>, Uuid)> =
            self.positions.values().map(|p| (p.opened_at, p.id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Entry price of the most recently opened position on `base`, for the
    /// pyramiding add-on trigger.
    pub fn last_entry_price_for(&self, base: &str) -> Option<f64> {
        self.positions
            .values()
            .filter(|p| p.base_symbol() == base)
            .max_by_key(|p| (p.opened_at, p.id))
            .map(|p| p.entry_price)
    }

    /// Sum of unrealized P&L across the table at last-mark prices.
    pub fn unrealized_sum(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl(p.last_price)).sum()
    }
}
