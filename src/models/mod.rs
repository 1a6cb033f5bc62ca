use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Epsilon for fraction/percentage comparisons.
///
/// All percentages in this crate are signed fractions (0.20 = 20%), never
/// post-multiplied percents. Threshold checks go through [`gte`]/[`lte`] so
/// a return that lands exactly on a rung or a stop still triggers it.
pub const FRAC_EPS: f64 = 1e-9;

/// `a >= b` with epsilon tolerance.
pub fn gte(a: f64, b: f64) -> bool {
    a >= b - FRAC_EPS
}

/// `a <= b` with epsilon tolerance.
pub fn lte(a: f64, b: f64) -> bool {
    a <= b + FRAC_EPS
}

/// One tradable pair as reported by the market-data provider.
///
/// Immutable per tick; the engine never mutates a snapshot row. Optional
/// fields stay `None` when the venue did not report them — rows missing a
/// usable price are dropped by the strategy filter, not errored on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSnapshot {
    /// "BASE/QUOTE" symbol pair.
    pub pair: String,
    /// Venue (dex) identifier, lowercase.
    pub venue: String,
    /// Last price in USD; must be > 0 to be usable.
    pub price_usd: Option<f64>,
    pub liquidity_usd: f64,
    pub volume_24h_usd: f64,
    /// Buys + sells over the last hour.
    pub txns_1h: u32,
    /// Momentum score in [0, 100], computed by the provider.
    pub momentum_score: u8,
    /// Signed fraction change over 1h.
    pub change_1h: Option<f64>,
    /// Signed fraction change over 4h (6h when the venue only reports 6h).
    pub change_4h: Option<f64>,
    /// Signed fraction change over 24h.
    pub change_24h: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    pub url: String,
    pub base_address: String,
}

impl PairSnapshot {
    /// Base symbol of the pair, if the pair string is well-formed.
    pub fn base_symbol(&self) -> Option<&str> {
        self.pair.split_once('/').map(|(base, _)| base)
    }

    /// Price usable for entry/mark-to-market (present and strictly positive).
    pub fn usable_price(&self) -> Option<f64> {
        self.price_usd.filter(|p| *p > 0.0)
    }

    /// Volume-24h over liquidity, with liquidity floored at 1 USD.
    pub fn turnover(&self) -> f64 {
        self.volume_24h_usd / self.liquidity_usd.max(1.0)
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Unrealized return as a signed fraction, positive when favorable.
    pub fn unrealized_return(&self, entry: f64, price: f64) -> f64 {
        match self {
            Side::Long => price / entry - 1.0,
            Side::Short => 1.0 - price / entry,
        }
    }

    /// Unrealized P&L in USD for `qty` base units held from `entry`.
    pub fn pnl_usd(&self, entry: f64, price: f64, qty: f64) -> f64 {
        match self {
            Side::Long => (price - entry) * qty,
            Side::Short => (entry - price) * qty,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

/// Direction mode for the whole engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Both,
}

/// Why a position (or part of one) was closed.
///
/// Closed enum: every consumer matches exhaustively, so adding a reason is a
/// compile-time touch-point everywhere it is displayed or counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    Stop,
    TakeProfit,
    Partial,
    Trailing,
    BreakEvenLock,
    TimeStop,
    DailyLossLimit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stop => "stop",
            ExitReason::TakeProfit => "take-profit",
            ExitReason::Partial => "partial",
            ExitReason::Trailing => "trailing",
            ExitReason::BreakEvenLock => "break-even-lock",
            ExitReason::TimeStop => "time-stop",
            ExitReason::DailyLossLimit => "daily-loss-limit",
            ExitReason::Manual => "manual",
        }
    }
}

/// Append-only record of a full or partial close. Never mutated after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: Uuid,
    pub symbol: String,
    pub venue: String,
    pub side: Side,
    pub reason: ExitReason,
    /// Realized P&L in USD for the size closed by this record.
    pub pnl_usd: f64,
    /// Return fraction at the close price.
    pub pnl_pct: f64,
    pub exit_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn duration_min(&self) -> i64 {
        (self.closed_at - self.opened_at).num_minutes()
    }
}

/// Ranked entry candidate produced by the strategy filter, pre-admission.
/// A read-only projection for display/audit; never aliases the live table.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub pair: String,
    pub venue: String,
    pub side: Side,
    pub price_usd: f64,
    pub momentum_score: u8,
    pub txns_1h: u32,
    pub liquidity_usd: f64,
    pub volume_24h_usd: f64,
    pub change_24h: Option<f64>,
}

impl Candidate {
    pub fn label(&self) -> String {
        format!("{} | {}", self.venue, self.side.label())
    }
}

/// Read-only view of a live position, derived fresh every tick.
#[derive(Debug, Clone, Serialize)]
pub struct OpenPositionView {
    pub id: Uuid,
    pub symbol: String,
    pub venue: String,
    pub side: Side,
    pub entry_price: f64,
    pub last_price: f64,
    pub stop_price: f64,
    pub remaining_usd: f64,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub opened_at: DateTime<Utc>,
    pub partially_closed: bool,
    pub age_min: i64,
}

/// Human-readable age, e.g. "1h 12m" / "4m 30s" / "12s".
pub fn fmt_age(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (h, rem) = (seconds / 3600, seconds % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
