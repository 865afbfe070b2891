// ===============================
// src/domain.rs
// ===============================
use std::collections::HashSet;
use std::fmt;

use chrono::{NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Sizes below this are treated as zero.
pub const QTY_EPS: f64 = 1e-9;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Round `x` to the nearest multiple of `step` (no-op for non-positive step).
pub fn round_to_step(x: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return x;
    }
    (x / step).round() * step
}

/// Format `x` with as many decimals as `step` carries (0.001 -> 3).
pub fn format_step(x: f64, step: f64) -> String {
    let mut decimals = 0usize;
    let mut s = step;
    while decimals < 12 && (s - s.round()).abs() > 1e-12 {
        s *= 10.0;
        decimals += 1;
    }
    format!("{:.*}", decimals, round_to_step(x, step))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "Buy", Side::Sell => "Sell" } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick { pub symbol: String, pub ts_ms: i64, pub bid: f64, pub ask: f64, pub mark_price: f64 }
impl Tick {
    /// Mid of the book, falling back to mark price when a side is missing.
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 { (self.bid + self.ask) / 2.0 } else { self.mark_price }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction { Long, Short, Flat }
impl Direction {
    pub fn side(&self) -> Option<Side> {
        match self { Direction::Long => Some(Side::Buy), Direction::Short => Some(Side::Sell), Direction::Flat => None }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Direction::Long => "long", Direction::Short => "short", Direction::Flat => "flat" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub ts_ms: i64,
    pub symbol: String,
    pub direction: Direction,
    pub strength: f64,
    pub basis_price: f64,
    pub zscore: f64,
    pub mean: f64,
}

/// Locally generated idempotency key (Bybit `orderLinkId`, max 36 chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientOrderId(String);
impl ClientOrderId {
    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}
impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// `{prefix}-{ms}-{counter}-{rand}`; the counter keeps ids unique inside one run,
/// the random suffix across restarts in the same millisecond.
#[derive(Debug)]
pub struct ClientOrderIdGen { prefix: String, counter: u64 }
impl ClientOrderIdGen {
    pub fn new(prefix: impl Into<String>) -> Self { Self { prefix: prefix.into(), counter: 0 } }
    pub fn next(&mut self, now_ms: i64) -> ClientOrderId {
        self.counter += 1;
        let salt: u16 = rand::thread_rng().gen();
        ClientOrderId(format!("{}-{}-{}-{:04x}", self.prefix, now_ms, self.counter, salt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind { Market, Limit(f64) }
impl OrderKind {
    pub fn limit_price(&self) -> Option<f64> { match self { OrderKind::Limit(px) => Some(*px), OrderKind::Market => None } }
}

/// Never mutated after creation; a retry re-sends the same object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_order_id: ClientOrderId,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub kind: OrderKind,
    pub reduce_only: bool,
    /// Protective stop attached to an entry (Bybit `stopLoss`).
    #[serde(default)]
    pub stop_loss: Option<f64>,
    pub reason: Signal,
    pub created_at_ms: i64,
}
impl OrderIntent {
    pub fn signed_size(&self) -> f64 { self.side.sign() * self.size }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Created,
    Submitted { retrying: bool },
    Acknowledged,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}
impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired)
    }
    /// Live on the exchange book (or believed to be).
    pub fn is_resting(&self) -> bool { matches!(self, OrderState::Acknowledged | OrderState::PartiallyFilled) }
    /// Tie-break between events carrying the same exchange sequence.
    pub fn rank(&self) -> u8 {
        match self {
            OrderState::Created => 0,
            OrderState::Submitted { .. } => 1,
            OrderState::Acknowledged => 2,
            OrderState::PartiallyFilled => 3,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired => 4,
        }
    }
    pub fn label(&self) -> &'static str {
        match self {
            OrderState::Created => "created",
            OrderState::Submitted { retrying: false } => "submitted",
            OrderState::Submitted { retrying: true } => "submitted_retrying",
            OrderState::Acknowledged => "acknowledged",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
            OrderState::Expired => "expired",
        }
    }
}
impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.label()) }
}

/// Order status as reported by the venue, after normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeStatus { New, PartiallyFilled, Filled, Cancelled, Rejected }

/// One order update from the account stream or a status query. `seq` is the
/// exchange-assigned ordering (Bybit `updatedTime`, paper venue counter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub client_order_id: Option<ClientOrderId>,
    pub exchange_order_id: Option<String>,
    pub event_id: String,
    pub seq: u64,
    pub side: Side,
    pub status: ExchangeStatus,
    pub qty: f64,
    pub price: Option<f64>,
    pub cum_filled: f64,
    pub avg_price: f64,
    pub reduce_only: bool,
    pub reason: Option<String>,
}

/// Ordering key of an applied event; see `OrderLifecycleManager::apply`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventKey { pub seq: u64, pub cum_filled: f64, pub rank: u8 }
impl EventKey {
    pub fn is_after(&self, other: &EventKey) -> bool {
        if self.seq != other.seq {
            return self.seq > other.seq;
        }
        if (self.cum_filled - other.cum_filled).abs() > QTY_EPS {
            return self.cum_filled > other.cum_filled;
        }
        self.rank > other.rank
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub requested_size: f64,
    pub state: OrderState,
    pub filled_size: f64,
    pub remaining_size: f64,
    pub avg_fill_price: f64,
    pub limit_price: Option<f64>,
    pub basis_price: f64,
    pub reduce_only: bool,
    pub created_at_ms: i64,
    pub last_event_at_ms: i64,
    pub last_key: Option<EventKey>,
    /// Fill already on the exchange when the order was adopted at resync;
    /// it is part of the position baseline, not of this record's contribution.
    pub pre_adoption_filled: f64,
    pub cancel_requested_at_ms: Option<i64>,
    pub expiring: bool,
    pub resubmits: u32,
    pub failed_queries: u32,
    pub reject_reason: Option<String>,
    #[serde(skip)]
    pub intent: Option<OrderIntent>,
    #[serde(skip)]
    pub seen: HashSet<(String, OrderState)>,
}
impl OrderRecord {
    pub fn from_intent(intent: &OrderIntent, now_ms: i64) -> Self {
        Self {
            client_order_id: intent.client_order_id.clone(),
            exchange_order_id: None,
            symbol: intent.symbol.clone(),
            side: intent.side,
            requested_size: intent.size,
            state: OrderState::Created,
            filled_size: 0.0,
            remaining_size: intent.size,
            avg_fill_price: 0.0,
            limit_price: intent.kind.limit_price(),
            basis_price: intent.reason.basis_price,
            reduce_only: intent.reduce_only,
            created_at_ms: now_ms,
            last_event_at_ms: now_ms,
            last_key: None,
            pre_adoption_filled: 0.0,
            cancel_requested_at_ms: None,
            expiring: false,
            resubmits: 0,
            failed_queries: 0,
            reject_reason: None,
            intent: Some(intent.clone()),
            seen: HashSet::new(),
        }
    }

    /// Signed size this record has moved the local position by.
    pub fn position_contribution(&self) -> f64 {
        self.side.sign() * (self.filled_size - self.pre_adoption_filled)
    }

    pub fn signed_remaining(&self) -> f64 {
        if self.state.is_terminal() { 0.0 } else { self.side.sign() * self.remaining_size }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub net_size: f64,
    pub avg_entry_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub last_mark: f64,
    pub last_update_ms: i64,
}

impl Position {
    pub fn flat(symbol: impl Into<String>) -> Self { Self { symbol: symbol.into(), ..Default::default() } }

    pub fn is_flat(&self) -> bool { self.net_size.abs() < QTY_EPS }

    /// Apply a confirmed fill; returns the PnL realized by the closing part.
    pub fn apply_fill(&mut self, side: Side, qty: f64, price: f64, ts_ms: i64) -> f64 {
        let signed_qty = side.sign() * qty;
        let prev = self.net_size;
        let mut realized = 0.0;

        if prev.abs() < QTY_EPS || prev.signum() == signed_qty.signum() {
            // same direction -> weighted average entry
            let total = prev.abs() + qty;
            self.avg_entry_price = if total > QTY_EPS {
                (self.avg_entry_price * prev.abs() + price * qty) / total
            } else {
                0.0
            };
            self.net_size = prev + signed_qty;
        } else {
            let closed = qty.min(prev.abs());
            realized = (price - self.avg_entry_price) * closed * prev.signum();
            self.net_size = prev + signed_qty;
            if self.net_size.abs() < QTY_EPS {
                self.net_size = 0.0;
                self.avg_entry_price = 0.0;
            } else if self.net_size.signum() != prev.signum() {
                // flipped through zero: the remainder opened at this price
                self.avg_entry_price = price;
            }
        }

        self.realized_pnl += realized;
        self.last_update_ms = ts_ms;
        if self.last_mark > 0.0 {
            self.mark_to_market(self.last_mark, ts_ms);
        }
        realized
    }

    pub fn mark_to_market(&mut self, mark: f64, ts_ms: i64) {
        self.last_mark = mark;
        self.unrealized_pnl = if self.is_flat() { 0.0 } else { (mark - self.avg_entry_price) * self.net_size };
        self.last_update_ms = ts_ms;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot { pub symbol: String, pub net_size: f64, pub avg_entry_price: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_open_orders: usize,
    pub daily_loss_limit: f64,
    pub loss_cooldown_ms: i64,
    /// 0 disables.
    pub max_daily_trades: u32,
    /// 0 disables.
    pub profit_lock: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub max_position_size: f64,
    pub max_open_orders: usize,
    pub cooldown_until_ms: Option<i64>,
    pub daily_loss_limit: f64,
    pub daily_realized_pnl: f64,
    pub loss_cooldown_ms: i64,
    /// Set when the daily loss limit is breached; cleared by the day roll.
    pub loss_locked: bool,
    pub trading_day: NaiveDate,
    pub trades_today: u32,
    pub max_daily_trades: u32,
    pub profit_lock: f64,
}

impl RiskState {
    pub fn new(limits: &RiskLimits, now_ms: i64) -> Self {
        Self {
            max_position_size: limits.max_position_size,
            max_open_orders: limits.max_open_orders,
            cooldown_until_ms: None,
            daily_loss_limit: limits.daily_loss_limit,
            daily_realized_pnl: 0.0,
            loss_cooldown_ms: limits.loss_cooldown_ms,
            loss_locked: false,
            trading_day: day_of(now_ms),
            trades_today: 0,
            max_daily_trades: limits.max_daily_trades,
            profit_lock: limits.profit_lock,
        }
    }

    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms.map_or(false, |until| now_ms < until)
    }

    /// Fold realized PnL in; returns true when this call engaged the loss cooldown.
    pub fn record_realized(&mut self, pnl: f64, now_ms: i64) -> bool {
        self.roll_day(now_ms);
        self.daily_realized_pnl += pnl;
        if !self.loss_locked && self.daily_realized_pnl < -self.daily_loss_limit.abs() {
            self.loss_locked = true;
            self.cooldown_until_ms = Some(now_ms + self.loss_cooldown_ms);
            return true;
        }
        false
    }

    pub fn record_trade(&mut self, now_ms: i64) {
        self.roll_day(now_ms);
        self.trades_today += 1;
    }

    /// Reset daily counters on a new UTC day; returns true when it rolled.
    pub fn roll_day(&mut self, now_ms: i64) -> bool {
        let today = day_of(now_ms);
        if today == self.trading_day {
            return false;
        }
        self.trading_day = today;
        self.daily_realized_pnl = 0.0;
        self.trades_today = 0;
        self.loss_locked = false;
        true
    }
}

fn day_of(ts_ms: i64) -> NaiveDate {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent { Tick(Tick), FeedDown, FeedUp }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccountEvent { Order(OrderUpdate), StreamDown, StreamUp }

/// Journal lines written by the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Md(Tick),
    Sig(Signal),
    Intent(OrderIntent),
    Transition { symbol: String, cl_id: ClientOrderId, from: OrderState, to: OrderState, ts_ms: i64 },
    RiskReject { symbol: String, cl_id: ClientOrderId, reason: String, ts_ms: i64 },
    Note(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_averages_same_side_fills() {
        let mut p = Position::flat("BTCUSDT");
        p.apply_fill(Side::Buy, 1.0, 100.0, 1);
        p.apply_fill(Side::Buy, 1.0, 110.0, 2);
        assert!((p.net_size - 2.0).abs() < QTY_EPS);
        assert!((p.avg_entry_price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn position_realizes_on_close_and_flips() {
        let mut p = Position::flat("BTCUSDT");
        p.apply_fill(Side::Buy, 1.0, 100.0, 1);
        let realized = p.apply_fill(Side::Sell, 1.5, 90.0, 2);
        assert!((realized + 10.0).abs() < 1e-9);
        assert!((p.net_size + 0.5).abs() < QTY_EPS);
        assert!((p.avg_entry_price - 90.0).abs() < 1e-9);
        assert!((p.realized_pnl + 10.0).abs() < 1e-9);
    }

    #[test]
    fn short_close_realizes_profit_when_price_falls() {
        let mut p = Position::flat("ETHUSDT");
        p.apply_fill(Side::Sell, 2.0, 50.0, 1);
        let realized = p.apply_fill(Side::Buy, 2.0, 45.0, 2);
        assert!((realized - 10.0).abs() < 1e-9);
        assert!(p.is_flat());
        assert_eq!(p.avg_entry_price, 0.0);
    }

    #[test]
    fn loss_breach_engages_cooldown_once() {
        let limits = RiskLimits {
            max_position_size: 1.0,
            max_open_orders: 2,
            daily_loss_limit: 50.0,
            loss_cooldown_ms: 60_000,
            max_daily_trades: 0,
            profit_lock: 0.0,
        };
        let mut rs = RiskState::new(&limits, 1_700_000_000_000);
        assert!(!rs.record_realized(-30.0, 1_700_000_000_000));
        assert!(rs.record_realized(-30.0, 1_700_000_001_000));
        assert!(rs.in_cooldown(1_700_000_002_000));
        assert!(!rs.record_realized(-5.0, 1_700_000_003_000));
        assert!(!rs.in_cooldown(1_700_000_061_001));
        assert!(rs.loss_locked);
    }

    #[test]
    fn day_roll_clears_daily_counters() {
        let limits = RiskLimits {
            max_position_size: 1.0,
            max_open_orders: 2,
            daily_loss_limit: 10.0,
            loss_cooldown_ms: 1_000,
            max_daily_trades: 3,
            profit_lock: 0.0,
        };
        let day1 = 1_700_000_000_000;
        let mut rs = RiskState::new(&limits, day1);
        rs.record_realized(-20.0, day1);
        rs.record_trade(day1);
        assert!(rs.roll_day(day1 + 86_400_000));
        assert_eq!(rs.trades_today, 0);
        assert_eq!(rs.daily_realized_pnl, 0.0);
        assert!(!rs.loss_locked);
    }

    #[test]
    fn event_key_orders_by_seq_then_fill_then_rank() {
        let a = EventKey { seq: 5, cum_filled: 0.0, rank: 2 };
        let b = EventKey { seq: 5, cum_filled: 0.5, rank: 3 };
        let c = EventKey { seq: 6, cum_filled: 0.0, rank: 4 };
        assert!(b.is_after(&a));
        assert!(c.is_after(&b));
        assert!(!a.is_after(&a));
    }

    #[test]
    fn step_formatting() {
        assert_eq!(format_step(0.30000000000000004, 0.001), "0.300");
        assert_eq!(format_step(27123.456, 0.1), "27123.5");
        assert_eq!(format_step(3.0, 1.0), "3");
    }
}
