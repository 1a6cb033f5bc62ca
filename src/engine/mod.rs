// Trade engine: candidate admission, position lifecycle, exit sweep
pub mod exits;
pub mod position;

pub use exits::{ExitEvaluator, ExitOutcome};
pub use position::{LadderRung, Position, PositionStore, StopKind};

use std::collections::HashMap;

use anyhow::bail;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Candidate, ClosedTrade, ExitReason, OpenPositionView, PairSnapshot, FRAC_EPS,
};
use crate::risk::{RejectReason, RiskConfig, RiskManager, RiskState};
use crate::strategy::{MarketHeatGate, StrategyConfig, StrategyFilter};

/// Everything one tick produced: the three output projections plus the
/// gate/breaker flags for the tick summary.
#[derive(Debug)]
pub struct StepOutput {
    /// Ranked candidates, pre-admission (display/audit).
    pub candidates: Vec<Candidate>,
    /// Live view of open and partially-closed positions.
    pub open_positions: Vec<OpenPositionView>,
    /// Closed-trade records appended this tick (partials included).
    pub closed_this_tick: Vec<ClosedTrade>,
    /// Ids of positions opened this tick.
    pub opened: Vec<Uuid>,
    /// Rule-based admission rejections, in candidate rank order.
    pub rejections: Vec<(String, RejectReason)>,
    pub heat_ok: bool,
    pub circuit_breaker: bool,
}

/// Deterministic, synchronous paper-trading engine: one `step` per market
/// refresh tick. All engine state lives here — no process-wide globals. When
/// shared across tasks, wrap the whole engine in one mutex so a tick's
/// mutations are never partially visible.
pub struct TradeEngine {
    risk_cfg: RiskConfig,
    strategy_cfg: StrategyConfig,
    store: PositionStore,
    risk_state: RiskState,
    closed_trades: Vec<ClosedTrade>,
}

impl TradeEngine {
    pub fn new(risk_cfg: RiskConfig, strategy_cfg: StrategyConfig) -> Self {
        Self {
            risk_cfg,
            strategy_cfg,
            store: PositionStore::new(),
            risk_state: RiskState::new(Utc::now()),
            closed_trades: Vec::new(),
        }
    }

    /// Swap configuration between ticks. Positions already open keep their
    /// computed stop/ladder state.
    pub fn update_configs(&mut self, risk: RiskConfig, strategy: StrategyConfig) {
        self.risk_cfg = risk;
        self.strategy_cfg = strategy;
    }

    pub fn risk_state(&self) -> &RiskState {
        &self.risk_state
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn open_position_count(&self) -> usize {
        self.store.len()
    }

    /// One evaluation tick against the current wall clock.
    pub fn step(&mut self, snapshot: &[PairSnapshot]) -> StepOutput {
        self.step_at(snapshot, Utc::now())
    }

    /// One evaluation tick with an explicit timestamp (tests, replays).
    pub fn step_at(&mut self, snapshot: &[PairSnapshot], now: DateTime<Utc>) -> StepOutput {
        self.risk_state.roll_day(now);

        // Gate failure suppresses new entries only; the exit sweep below
        // still runs on existing positions.
        let heat_ok = MarketHeatGate::check(snapshot, &self.strategy_cfg);
        let candidates = if heat_ok {
            StrategyFilter::candidates(snapshot, &self.strategy_cfg, self.risk_cfg.direction)
        } else {
            Vec::new()
        };

        // Portfolio circuit breaker, once per tick, against last marks.
        let circuit_breaker = RiskManager::circuit_breaker_tripped(
            &self.risk_cfg,
            &self.risk_state,
            self.store.unrealized_sum(),
        );

        let mut opened = Vec::new();
        let mut rejections = Vec::new();
        if heat_ok && !circuit_breaker {
            self.admit_candidates(&candidates, now, &mut opened, &mut rejections);
        } else if circuit_breaker && !candidates.is_empty() {
            tracing::warn!(
                daily_pnl = self.risk_state.daily_pnl,
                "daily loss limit reached, suppressing all new entries"
            );
            rejections.extend(
                candidates
                    .iter()
                    .map(|c| (c.pair.clone(), RejectReason::CircuitBreaker)),
            );
        }

        let closed_start = self.closed_trades.len();
        self.sweep_exits(snapshot, now);

        StepOutput {
            candidates,
            open_positions: self.open_views(now),
            closed_this_tick: self.closed_trades[closed_start..].to_vec(),
            opened,
            rejections,
            heat_ok,
            circuit_breaker,
        }
    }

    /// Manual out-of-band close, bypassing candidate generation/admission.
    /// Closes the full remaining size at `override_price` when given (and
    /// positive), otherwise at the last mark.
    pub fn close_by_id(&mut self, id: Uuid, override_price: Option<f64>) -> anyhow::Result<ClosedTrade> {
        let position = match self.store.get(id) {
            Some(p) => p,
            None => bail!("position {} not found or already closed", id),
        };
        let price = override_price.filter(|p| *p > 0.0).unwrap_or(position.last_price);
        let record = self.close_position(id, price, ExitReason::Manual, Utc::now());
        Ok(record)
    }

    // ------------------------------------------------------------------
    // admission
    // ------------------------------------------------------------------

    fn admit_candidates(
        &mut self,
        candidates: &[Candidate],
        now: DateTime<Utc>,
        opened: &mut Vec<Uuid>,
        rejections: &mut Vec<(String, RejectReason)>,
    ) {
        let mut free_slots = self.risk_cfg.max_positions.saturating_sub(self.store.len());

        for candidate in candidates {
            if free_slots == 0 {
                rejections.push((candidate.pair.clone(), RejectReason::NoFreeSlots));
                continue;
            }
            let base = candidate
                .pair
                .split_once('/')
                .map(|(b, _)| b)
                .unwrap_or(candidate.pair.as_str());
            let last_entry = self.store.last_entry_price_for(base);

            match RiskManager::admit(&self.risk_cfg, &self.risk_state, candidate, last_entry, now) {
                Ok(()) => {
                    let position = Position::open(
                        Uuid::new_v4(),
                        candidate.pair.clone(),
                        candidate.venue.clone(),
                        candidate.side,
                        candidate.price_usd,
                        &self.risk_cfg,
                        now,
                    );
                    let id = position.id;
                    tracing::info!(
                        symbol = %candidate.pair,
                        side = candidate.side.label(),
                        entry = candidate.price_usd,
                        stop = position.stop_price,
                        "opened position"
                    );
                    self.store.insert(position);
                    self.risk_state.note_open(base, now);
                    opened.push(id);
                    free_slots -= 1;
                }
                Err(reason) => {
                    tracing::debug!(symbol = %candidate.pair, ?reason, "candidate rejected");
                    rejections.push((candidate.pair.clone(), reason));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // exit sweep
    // ------------------------------------------------------------------

    fn sweep_exits(&mut self, snapshot: &[PairSnapshot], now: DateTime<Utc>) {
        if self.store.is_empty() {
            return;
        }

        let mut prices: HashMap<&str, f64> = HashMap::new();
        for row in snapshot {
            if let Some(px) = row.usable_price() {
                prices.insert(row.pair.as_str(), px);
            }
        }

        for id in self.store.ids_by_open_time() {
            // Marks of earlier positions in this sweep are already fresh.
            let rest_unrealized: f64 = self
                .store
                .iter()
                .filter(|p| p.id != id)
                .map(|p| p.unrealized_pnl(p.last_price))
                .sum();

            let position = self
                .store
                .get_mut(id)
                .expect("swept position vanished mid-tick");
            let price = prices
                .get(position.symbol.as_str())
                .copied()
                .unwrap_or(position.last_price);
            if price <= 0.0 {
                continue;
            }
            // The daily-loss rule must see this position at the tick price,
            // not its stale mark: a breach driven by the position's own move
            // flattens on the breach tick.
            let portfolio_unrealized = rest_unrealized + position.unrealized_pnl(price);

            let outcome = ExitEvaluator::evaluate(
                position,
                &self.risk_cfg,
                price,
                now,
                &mut self.risk_state,
                portfolio_unrealized,
            );
            for partial in &outcome.partials {
                tracing::info!(
                    symbol = %partial.symbol,
                    pnl_usd = partial.pnl_usd,
                    "partial take-profit filled"
                );
            }
            self.closed_trades.extend(outcome.partials);

            if let Some((exit_price, reason)) = outcome.close {
                self.close_position(id, exit_price, reason, now);
            }
        }
    }

    /// Full close: realize the remaining size, book the P&L, drop the
    /// position from the table and append the record. A ladder-consumed
    /// position (remaining ~0) is just dropped — its last partial record is
    /// the final one.
    fn close_position(
        &mut self,
        id: Uuid,
        price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> ClosedTrade {
        let position = self
            .store
            .remove(id)
            .expect("closing a position that is not in the table");
        self.risk_state.note_close(position.base_symbol());

        let realized = position.unrealized_pnl(price);
        let record = ClosedTrade {
            position_id: position.id,
            symbol: position.symbol.clone(),
            venue: position.venue.clone(),
            side: position.side,
            reason,
            pnl_usd: realized,
            pnl_pct: position.unrealized_return(price),
            exit_price: price,
            opened_at: position.opened_at,
            closed_at: now,
        };

        if position.remaining_qty > FRAC_EPS {
            self.risk_state.daily_pnl += realized;
            tracing::info!(
                symbol = %record.symbol,
                reason = reason.as_str(),
                pnl_usd = record.pnl_usd,
                daily_pnl = self.risk_state.daily_pnl,
                "closed position"
            );
            self.closed_trades.push(record.clone());
        }
        record
    }

    fn open_views(&self, now: DateTime<Utc>) -> Vec<OpenPositionView> {
        self.store
            .ids_by_open_time()
            .into_iter()
            .filter_map(|id| self.store.get(id))
            .map(|p| p.view(now))
            .collect()
    }
}
