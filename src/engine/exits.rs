use chrono::{DateTime, Utc};

use crate::engine::position::{Position, StopKind};
use crate::models::{gte, lte, ClosedTrade, ExitReason, Side, FRAC_EPS};
use crate::risk::{RiskConfig, RiskManager, RiskState};

/// Result of one per-position, per-tick rule sweep.
pub struct ExitOutcome {
    /// Partial-fill records realized this tick, already booked into the
    /// daily P&L.
    pub partials: Vec<ClosedTrade>,
    /// Full-close decision: exit price and reason. The caller performs the
    /// close.
    pub close: Option<(f64, ExitReason)>,
}

/// Per-position exit-rule evaluation, in a fixed order per tick:
/// mark-to-market, R-multiple ladder, trailing ratchet, break-even drawdown
/// lock, time-stop, hard stop / legacy take-profit, daily-loss flatten.
///
/// Partial realizations are booked into `RiskState.daily_pnl` immediately,
/// before later rules run — the daily-loss rule depends on the updated
/// number.
pub struct ExitEvaluator;

impl ExitEvaluator {
    pub fn evaluate(
        position: &mut Position,
        cfg: &RiskConfig,
        price: f64,
        now: DateTime<Utc>,
        risk_state: &mut RiskState,
        portfolio_unrealized: f64,
    ) -> ExitOutcome {
        assert!(price > 0.0, "mark price must be positive");
        let mut partials = Vec::new();

        // 1. Mark-to-market and water-mark.
        position.last_price = price;
        position.water_mark = match position.side {
            Side::Long => position.water_mark.max(price),
            Side::Short => position.water_mark.min(price),
        };
        let ret = position.unrealized_return(price);
        position.best_return = position.side.unrealized_return(position.entry_price, position.water_mark);
        if cfg.be_trigger_pct > 0.0 && gte(ret, cfg.be_trigger_pct) {
            position.be_armed = true;
        }

        // 2. R-multiple partial ladder, ascending, each rung fire-once. The
        // break-even-plus-lock ratchet runs after every rung fire, not only
        // the first.
        for i in 0..position.ladder.len() {
            let rung = position.ladder[i];
            if rung.fired || !gte(ret, rung.multiple * cfg.stop_loss_pct) {
                continue;
            }
            let closed_qty = position.reduce(rung.fraction);
            let realized = position.side.pnl_usd(position.entry_price, price, closed_qty);
            risk_state.daily_pnl += realized;
            position.ladder[i].fired = true;

            partials.push(ClosedTrade {
                position_id: position.id,
                symbol: position.symbol.clone(),
                venue: position.venue.clone(),
                side: position.side,
                reason: ExitReason::Partial,
                pnl_usd: realized,
                pnl_pct: ret,
                exit_price: price,
                opened_at: position.opened_at,
                closed_at: now,
            });

            let lock_pct = cfg.be_lock_profit_pct.max(cfg.stop_loss_pct);
            let lock = match position.side {
                Side::Long => position.entry_price * (1.0 + lock_pct),
                Side::Short => position.entry_price * (1.0 - lock_pct),
            };
            position.ratchet_stop(lock, StopKind::LadderLock);
        }

        // Ladder consumed the whole position: final rung closes it.
        if position.remaining_qty <= FRAC_EPS {
            return ExitOutcome { partials, close: Some((price, ExitReason::Partial)) };
        }

        // 3. Trailing stop: ratchet toward the water-mark trail once the
        // mark has moved favorably beyond entry; never loosens.
        if cfg.trailing_pct > 0.0 {
            match position.side {
                Side::Long if position.water_mark > position.entry_price => {
                    let trail = position.water_mark * (1.0 - cfg.trailing_pct);
                    position.ratchet_stop(trail, StopKind::Trailing);
                }
                Side::Short if position.water_mark < position.entry_price => {
                    let trail = position.water_mark * (1.0 + cfg.trailing_pct);
                    position.ratchet_stop(trail, StopKind::Trailing);
                }
                _ => {}
            }
        }

        // 4. Break-even drawdown lock: once armed, a retracement from the
        // best-ever return beyond the lock threshold closes the runner.
        if cfg.dd_lock_pct > 0.0
            && position.be_armed
            && gte(position.best_return - ret, cfg.dd_lock_pct)
        {
            return ExitOutcome { partials, close: Some((price, ExitReason::BreakEvenLock)) };
        }

        // 5. Time-stop: stale positions are cut, but not winners that simply
        // have not reached target yet.
        if cfg.time_stop_min > 0
            && position.age_min(now) >= cfg.time_stop_min
            && ret < cfg.stop_loss_pct / 2.0
        {
            return ExitOutcome { partials, close: Some((price, ExitReason::TimeStop)) };
        }

        // 6. Hard stop cross / legacy take-profit.
        let stop_crossed = match position.side {
            Side::Long => lte(price, position.stop_price),
            Side::Short => gte(price, position.stop_price),
        };
        if stop_crossed {
            let reason = if position.stop_kind == StopKind::Trailing {
                ExitReason::Trailing
            } else {
                ExitReason::Stop
            };
            return ExitOutcome { partials, close: Some((price, reason)) };
        }
        if !cfg.use_r_multiple && gte(ret, cfg.take_profit_pct) {
            return ExitOutcome { partials, close: Some((price, ExitReason::TakeProfit)) };
        }

        // 7. Portfolio daily-loss flatten: realized plus unrealized at or
        // below the negative daily limit.
        if RiskManager::circuit_breaker_tripped(cfg, risk_state, portfolio_unrealized) {
            return ExitOutcome { partials, close: Some((price, ExitReason::DailyLossLimit)) };
        }

        ExitOutcome { partials, close: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cfg() -> RiskConfig {
        // Exit-rule tests isolate one rule at a time; locks and time-stop
        // are switched off here and enabled per test.
        RiskConfig {
            trailing_pct: 0.0,
            be_trigger_pct: 0.0,
            dd_lock_pct: 0.0,
            time_stop_min: 0,
            ..RiskConfig::default()
        }
    }

    fn open(cfg: &RiskConfig, side: Side, entry: f64) -> Position {
        Position::open(
            Uuid::new_v4(),
            "WIF/SOL".to_string(),
            "raydium".to_string(),
            side,
            entry,
            cfg,
            Utc::now(),
        )
    }

    fn eval(
        p: &mut Position,
        cfg: &RiskConfig,
        price: f64,
        state: &mut RiskState,
    ) -> ExitOutcome {
        let unrealized = p.unrealized_pnl(price);
        ExitEvaluator::evaluate(p, cfg, price, Utc::now(), state, unrealized)
    }

    #[test]
    fn test_hard_stop_long() {
        let cfg = cfg();
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);

        let out = eval(&mut p, &cfg, 0.79, &mut state);
        assert_eq!(out.close, Some((0.79, ExitReason::Stop)));
        assert!(out.partials.is_empty());
    }

    #[test]
    fn test_hard_stop_short() {
        let cfg = RiskConfig { direction: crate::models::Direction::Short, ..cfg() };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Short, 1.0);

        assert!(eval(&mut p, &cfg, 1.19, &mut state).close.is_none());
        let out = eval(&mut p, &cfg, 1.21, &mut state);
        assert_eq!(out.close, Some((1.21, ExitReason::Stop)));
    }

    #[test]
    fn test_ladder_rung_fires_exactly_once_and_ratchets() {
        let cfg = cfg(); // rung (2.0, 0.5), stop 0.20 -> fires at +40%
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);
        let qty0 = p.remaining_qty;

        // +39%: nothing fires
        assert!(eval(&mut p, &cfg, 1.39, &mut state).partials.is_empty());

        // +40%: rung fires, half realized, stop locked above entry
        let out = eval(&mut p, &cfg, 1.40, &mut state);
        assert_eq!(out.partials.len(), 1);
        assert_eq!(out.partials[0].reason, ExitReason::Partial);
        assert!((p.remaining_qty - qty0 * 0.5).abs() < 1e-9);
        let realized = out.partials[0].pnl_usd;
        assert!((realized - qty0 * 0.5 * 0.40).abs() < 1e-9);
        assert_eq!(state.daily_pnl, realized);
        // lock = entry * (1 + max(0.02, 0.20))
        assert!((p.stop_price - 1.20).abs() < 1e-12);
        assert_eq!(p.stop_kind, StopKind::LadderLock);

        // higher price, same rung never refires
        let out = eval(&mut p, &cfg, 1.45, &mut state);
        assert!(out.partials.is_empty());
    }

    #[test]
    fn test_multi_rung_ladder_ratchets_after_every_rung() {
        let cfg = RiskConfig {
            partial_ladder: vec![
                crate::risk::LadderStep { multiple: 2.0, fraction: 0.5 },
                crate::risk::LadderStep { multiple: 3.0, fraction: 0.5 },
            ],
            ..cfg()
        };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);
        let qty0 = p.remaining_qty;

        // +60% crosses both rungs in one tick: each takes half of the
        // remainder in ascending order.
        let out = eval(&mut p, &cfg, 1.60, &mut state);
        assert_eq!(out.partials.len(), 2);
        assert!((p.remaining_qty - qty0 * 0.25).abs() < 1e-9);
        assert_eq!(p.stop_kind, StopKind::LadderLock);
        assert!(out.close.is_none());
    }

    #[test]
    fn test_full_fraction_rung_closes_with_reason_partial() {
        let cfg = RiskConfig {
            partial_ladder: vec![crate::risk::LadderStep { multiple: 2.0, fraction: 1.0 }],
            ..cfg()
        };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);

        let out = eval(&mut p, &cfg, 1.40, &mut state);
        assert_eq!(out.partials.len(), 1);
        assert_eq!(out.close, Some((1.40, ExitReason::Partial)));
        assert_eq!(p.remaining_qty, 0.0);
    }

    #[test]
    fn test_trailing_ratchet_and_close_reason() {
        let cfg = RiskConfig { trailing_pct: 0.15, ..cfg() };
        let mut state = RiskState::new(Utc::now());
        // disable the ladder so the runner stays whole
        let cfg = RiskConfig { partial_tp_enable: false, ..cfg };
        let mut p = open(&cfg, Side::Long, 1.0);

        assert!(eval(&mut p, &cfg, 1.50, &mut state).close.is_none());
        assert!((p.stop_price - 1.275).abs() < 1e-12);
        assert_eq!(p.stop_kind, StopKind::Trailing);

        let out = eval(&mut p, &cfg, 1.20, &mut state);
        assert_eq!(out.close, Some((1.20, ExitReason::Trailing)));
    }

    #[test]
    fn test_trailing_does_not_engage_before_profit() {
        // With the mark never above entry the initial stop owns the exit.
        let cfg = RiskConfig { trailing_pct: 0.15, ..cfg() };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);

        let out = eval(&mut p, &cfg, 0.79, &mut state);
        assert_eq!(out.close, Some((0.79, ExitReason::Stop)));
    }

    #[test]
    fn test_break_even_drawdown_lock() {
        let cfg = RiskConfig {
            be_trigger_pct: 0.10,
            dd_lock_pct: 0.06,
            partial_tp_enable: false,
            ..cfg()
        };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);

        // +12% arms the lock
        assert!(eval(&mut p, &cfg, 1.12, &mut state).close.is_none());
        assert!(p.be_armed);

        // retrace to +5%: 7% off the best return -> lock closes it
        let out = eval(&mut p, &cfg, 1.05, &mut state);
        assert_eq!(out.close, Some((1.05, ExitReason::BreakEvenLock)));
    }

    #[test]
    fn test_drawdown_lock_needs_arming_first() {
        let cfg = RiskConfig {
            be_trigger_pct: 0.10,
            dd_lock_pct: 0.06,
            partial_tp_enable: false,
            ..cfg()
        };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);

        // +8% never reaches the trigger; the same 7% retrace is ignored
        assert!(eval(&mut p, &cfg, 1.08, &mut state).close.is_none());
        assert!(eval(&mut p, &cfg, 1.01, &mut state).close.is_none());
    }

    #[test]
    fn test_time_stop_spares_winners() {
        let cfg = RiskConfig { time_stop_min: 60, partial_tp_enable: false, ..cfg() };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);
        p.opened_at = Utc::now() - chrono::Duration::minutes(61);

        // +5% < half the 20% stop magnitude: cut
        let out = eval(&mut p, &cfg, 1.05, &mut state);
        assert_eq!(out.close, Some((1.05, ExitReason::TimeStop)));

        // +15% >= 10%: the winner keeps running
        let mut p = open(&cfg, Side::Long, 1.0);
        p.opened_at = Utc::now() - chrono::Duration::minutes(61);
        assert!(eval(&mut p, &cfg, 1.15, &mut state).close.is_none());
    }

    #[test]
    fn test_legacy_take_profit() {
        let cfg = RiskConfig { use_r_multiple: false, ..cfg() };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);

        assert!(eval(&mut p, &cfg, 1.39, &mut state).close.is_none());
        let out = eval(&mut p, &cfg, 1.40, &mut state);
        assert_eq!(out.close, Some((1.40, ExitReason::TakeProfit)));
    }

    #[test]
    fn test_daily_loss_flatten() {
        let cfg = cfg(); // limit 200
        let mut state = RiskState::new(Utc::now());
        state.daily_pnl = -195.0;
        let mut p = open(&cfg, Side::Long, 1.0);

        // -10% on a 50 USD position: -5 unrealized, total -200
        let unrealized = p.unrealized_pnl(0.90);
        let out = ExitEvaluator::evaluate(&mut p, &cfg, 0.90, Utc::now(), &mut state, unrealized);
        assert_eq!(out.close, Some((0.90, ExitReason::DailyLossLimit)));
    }

    #[test]
    fn test_stop_never_loosens_across_ticks() {
        let cfg = RiskConfig { trailing_pct: 0.15, partial_tp_enable: false, ..cfg() };
        let mut state = RiskState::new(Utc::now());
        let mut p = open(&cfg, Side::Long, 1.0);

        assert!(eval(&mut p, &cfg, 1.50, &mut state).close.is_none());
        let stop_after_high = p.stop_price;
        // pullback that does not cross the stop must not move it down
        assert!(eval(&mut p, &cfg, 1.30, &mut state).close.is_none());
        assert_eq!(p.stop_price, stop_after_high);
    }
}
