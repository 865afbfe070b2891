// ===============================
// src/lifecycle.rs (order state machine + reconciliation)
// ===============================
//
// Owns every OrderRecord of one instrument together with the Position and
// RiskState they move. All three are mutated in the same call, so a fill can
// never be half-applied.
//
// Created -> Submitted{retrying} -> Acknowledged <-> PartiallyFilled
//         -> Filled | Cancelled | Rejected | Expired      (terminal)
//
// Inbound updates are matched by exchange id, then client id, and ordered by
// EventKey (exchange seq, cumulative fill, state rank). Anything not newer than
// the last applied key is a no-op, so replays and late arrivals converge.
//
use ahash::AHashMap as HashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::{
    ClientOrderId, EventKey, ExchangeStatus, OrderIntent, OrderRecord, OrderState, OrderUpdate, Position,
    PositionSnapshot, RiskLimits, RiskState, Side, QTY_EPS,
};
use crate::port::{PortError, SubmitAck};

/// Tolerance for the position invariant (float sums of exchange-rounded sizes).
const POSITION_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error("client order id {0} already registered")]
    DuplicateClientOrderId(ClientOrderId),
    #[error("unknown client order id {0}")]
    UnknownOrder(ClientOrderId),
    #[error("cannot {action} order {id} in state {state}")]
    InvalidTransition { id: ClientOrderId, state: OrderState, action: &'static str },
    #[error("reconciliation conflict: {0}")]
    ReconciliationConflict(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillDelta {
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub client_order_id: ClientOrderId,
    pub from: OrderState,
    pub to: OrderState,
    pub fill: Option<FillDelta>,
    /// This fill pushed the day through the loss limit.
    pub cooldown_engaged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Transition(Transition),
    /// Accepted but nothing observable changed.
    Unchanged,
    /// Older than (or equal to) what the record already reflects.
    Stale,
    /// Same event id with the same resulting state seen before.
    Duplicate,
    /// No record matches; not ours or already compacted.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    Applied(Applied),
    /// Venue confirmed "not found" for an order that was never acknowledged:
    /// the same intent (same client order id) may be sent again.
    Resubmit(OrderIntent),
    /// Not found and out of resubmits; the record is now Rejected.
    GaveUp(Transition),
    /// Nothing to do (record never left Created).
    Pending,
}

pub struct OrderLifecycleManager {
    symbol: String,
    records: HashMap<ClientOrderId, OrderRecord>,
    by_exchange_id: HashMap<String, ClientOrderId>,
    position: Position,
    risk: RiskState,
    /// Position not explained by any live record (adopted at resync, or folded
    /// in from compacted records).
    baseline: f64,
    halted: Option<String>,
    max_resubmits: u32,
}

impl OrderLifecycleManager {
    pub fn new(symbol: impl Into<String>, limits: &RiskLimits, max_resubmits: u32, now_ms: i64) -> Self {
        let symbol = symbol.into();
        Self {
            position: Position::flat(symbol.clone()),
            risk: RiskState::new(limits, now_ms),
            symbol,
            records: HashMap::new(),
            by_exchange_id: HashMap::new(),
            baseline: 0.0,
            halted: None,
            max_resubmits,
        }
    }

    pub fn position(&self) -> &Position { &self.position }
    pub fn risk(&self) -> &RiskState { &self.risk }
    pub fn risk_mut(&mut self) -> &mut RiskState { &mut self.risk }
    pub fn record(&self, id: &ClientOrderId) -> Option<&OrderRecord> { self.records.get(id) }
    pub fn halted(&self) -> Option<&str> { self.halted.as_deref() }

    pub fn mark(&mut self, mark: f64, now_ms: i64) {
        self.position.mark_to_market(mark, now_ms);
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.halted.is_none() {
            error!(symbol = %self.symbol, %reason, "instrument halted");
        }
        self.halted = Some(reason);
    }

    pub fn clear_halt(&mut self) -> bool {
        self.halted.take().is_some()
    }

    // ---- registration / submission ----

    pub fn register(&mut self, intent: &OrderIntent, now_ms: i64) -> Result<(), LifecycleError> {
        if self.records.contains_key(&intent.client_order_id) {
            return Err(LifecycleError::DuplicateClientOrderId(intent.client_order_id.clone()));
        }
        self.records.insert(intent.client_order_id.clone(), OrderRecord::from_intent(intent, now_ms));
        Ok(())
    }

    /// Created (or retrying after a confirmed "not found") -> Submitted.
    pub fn mark_submitted(&mut self, id: &ClientOrderId, now_ms: i64) -> Result<Transition, LifecycleError> {
        let rec = self.records.get_mut(id).ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        match rec.state {
            OrderState::Created | OrderState::Submitted { retrying: true } => {
                let from = rec.state;
                rec.state = OrderState::Submitted { retrying: false };
                rec.last_event_at_ms = now_ms;
                Ok(transition(id, from, rec.state))
            }
            state => Err(LifecycleError::InvalidTransition { id: id.clone(), state, action: "submit" }),
        }
    }

    pub fn on_submit_ok(&mut self, id: &ClientOrderId, ack: &SubmitAck, now_ms: i64) -> Result<Applied, LifecycleError> {
        let rec = self.records.get_mut(id).ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        if rec.exchange_order_id.is_none() && !ack.exchange_order_id.is_empty() {
            rec.exchange_order_id = Some(ack.exchange_order_id.clone());
            self.by_exchange_id.insert(ack.exchange_order_id.clone(), id.clone());
        }
        match rec.state {
            OrderState::Created | OrderState::Submitted { .. } => {
                let from = rec.state;
                rec.state = OrderState::Acknowledged;
                rec.last_event_at_ms = now_ms;
                Ok(Applied::Transition(transition(id, from, rec.state)))
            }
            // the stream got there first
            _ => Ok(Applied::Unchanged),
        }
    }

    pub fn on_submit_failed(&mut self, id: &ClientOrderId, err: &PortError, now_ms: i64) -> Result<Applied, LifecycleError> {
        let rec = self.records.get_mut(id).ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        if !matches!(rec.state, OrderState::Submitted { .. }) {
            return Ok(Applied::Unchanged);
        }
        let from = rec.state;
        rec.last_event_at_ms = now_ms;
        match err {
            PortError::Permanent(msg) => {
                rec.state = OrderState::Rejected;
                rec.remaining_size = 0.0;
                rec.reject_reason = Some(msg.clone());
            }
            PortError::Transient(_) | PortError::Timeout(_) => {
                rec.state = OrderState::Submitted { retrying: true };
            }
        }
        if from == rec.state {
            return Ok(Applied::Unchanged);
        }
        Ok(Applied::Transition(transition(id, from, rec.state)))
    }

    /// No acknowledgement within the timeout: flag for a status query.
    pub fn mark_retrying(&mut self, id: &ClientOrderId, now_ms: i64) -> Option<Transition> {
        let rec = self.records.get_mut(id)?;
        if rec.state != (OrderState::Submitted { retrying: false }) {
            return None;
        }
        rec.state = OrderState::Submitted { retrying: true };
        rec.last_event_at_ms = now_ms;
        Some(transition(id, OrderState::Submitted { retrying: false }, rec.state))
    }

    // ---- status queries ----

    pub fn on_status(&mut self, id: &ClientOrderId, snapshot: Option<&OrderUpdate>, now_ms: i64) -> Result<StatusOutcome, LifecycleError> {
        let max_resubmits = self.max_resubmits;
        let rec = self.records.get_mut(id).ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        rec.failed_queries = 0;
        rec.last_event_at_ms = now_ms;

        if let Some(update) = snapshot {
            return self.apply(update, now_ms).map(StatusOutcome::Applied);
        }

        match rec.state {
            OrderState::Created => Ok(StatusOutcome::Pending),
            OrderState::Submitted { .. } => {
                if rec.resubmits >= max_resubmits || rec.intent.is_none() {
                    let from = rec.state;
                    rec.state = OrderState::Rejected;
                    rec.remaining_size = 0.0;
                    rec.reject_reason = Some(format!("not found after {} resubmits", rec.resubmits));
                    return Ok(StatusOutcome::GaveUp(transition(id, from, rec.state)));
                }
                rec.resubmits += 1;
                rec.state = OrderState::Submitted { retrying: true };
                match rec.intent.clone() {
                    Some(intent) => Ok(StatusOutcome::Resubmit(intent)),
                    None => Ok(StatusOutcome::Pending),
                }
            }
            OrderState::Acknowledged | OrderState::PartiallyFilled => {
                let msg = format!("order {} is {} locally but unknown to the venue", id, rec.state);
                self.halt(msg.clone());
                Err(LifecycleError::ReconciliationConflict(msg))
            }
            _ => Ok(StatusOutcome::Applied(Applied::Unchanged)),
        }
    }

    /// Count a failed query; returns the consecutive failure count.
    pub fn on_query_failed(&mut self, id: &ClientOrderId) -> u32 {
        match self.records.get_mut(id) {
            Some(rec) => {
                rec.failed_queries += 1;
                rec.failed_queries
            }
            None => 0,
        }
    }

    // ---- inbound events ----

    fn resolve(&self, update: &OrderUpdate) -> Option<ClientOrderId> {
        if let Some(id) = update.exchange_order_id.as_ref().and_then(|x| self.by_exchange_id.get(x)) {
            return Some(id.clone());
        }
        update.client_order_id.as_ref().filter(|id| self.records.contains_key(*id)).cloned()
    }

    pub fn apply(&mut self, update: &OrderUpdate, now_ms: i64) -> Result<Applied, LifecycleError> {
        let Some(id) = self.resolve(update) else {
            debug!(symbol = %self.symbol, event_id = %update.event_id, "update for unknown order");
            return Ok(Applied::Unknown);
        };
        let Some(rec) = self.records.get_mut(&id) else {
            return Ok(Applied::Unknown);
        };

        let target = target_state(update.status, update.cum_filled, rec.requested_size, rec.expiring);
        if !rec.seen.insert((update.event_id.clone(), target)) {
            debug!(cl_id = %id, event_id = %update.event_id, "duplicate event");
            return Ok(Applied::Duplicate);
        }
        if rec.state.is_terminal() {
            // a closed record may absorb late events, never new fills
            if update.cum_filled > rec.filled_size + QTY_EPS {
                let msg = format!(
                    "order {} is {} locally but the venue reports cumulative fill {} over {}",
                    id, rec.state, update.cum_filled, rec.filled_size
                );
                self.halt(msg.clone());
                return Err(LifecycleError::ReconciliationConflict(msg));
            }
            debug!(cl_id = %id, state = %rec.state, "event after terminal state ignored");
            return Ok(Applied::Unchanged);
        }
        let key = EventKey { seq: update.seq, cum_filled: update.cum_filled, rank: target.rank() };
        if let Some(last) = rec.last_key {
            if !key.is_after(&last) {
                debug!(cl_id = %id, seq = update.seq, "stale event ignored");
                return Ok(Applied::Stale);
            }
        }

        let delta = update.cum_filled - rec.filled_size;
        if delta < -QTY_EPS || update.cum_filled > rec.requested_size + QTY_EPS {
            let msg = format!(
                "order {}: venue reports cumulative fill {} against local {} of {}",
                id, update.cum_filled, rec.filled_size, rec.requested_size
            );
            self.halt(msg.clone());
            return Err(LifecycleError::ReconciliationConflict(msg));
        }

        if rec.exchange_order_id.is_none() {
            if let Some(xid) = &update.exchange_order_id {
                rec.exchange_order_id = Some(xid.clone());
                self.by_exchange_id.insert(xid.clone(), id.clone());
            }
        }

        let from = rec.state;
        let mut fill = None;
        let mut cooldown_engaged = false;
        if delta > QTY_EPS {
            let price = delta_price(rec, update, delta);
            let first_fill = rec.filled_size <= QTY_EPS;
            rec.avg_fill_price = if update.avg_price > 0.0 {
                update.avg_price
            } else {
                (rec.avg_fill_price * rec.filled_size + price * delta) / update.cum_filled
            };
            rec.filled_size = update.cum_filled;
            let realized = self.position.apply_fill(rec.side, delta, price, now_ms);
            cooldown_engaged = self.risk.record_realized(realized, now_ms);
            if first_fill {
                self.risk.record_trade(now_ms);
            }
            fill = Some(FillDelta { side: rec.side, size: delta, price, realized_pnl: realized });
        }

        rec.remaining_size = if target.is_terminal() { 0.0 } else { (rec.requested_size - rec.filled_size).max(0.0) };
        rec.state = target;
        rec.last_key = Some(key);
        rec.last_event_at_ms = now_ms;
        if target == OrderState::Rejected {
            rec.reject_reason = update.reason.clone().or_else(|| Some("rejected by venue".into()));
        }

        self.verify_position()?;

        if from == target && fill.is_none() {
            return Ok(Applied::Unchanged);
        }
        Ok(Applied::Transition(Transition { client_order_id: id, from, to: target, fill, cooldown_engaged }))
    }

    // ---- cancel / expiry ----

    pub fn begin_cancel(&mut self, id: &ClientOrderId, expire: bool, now_ms: i64) -> Result<(), LifecycleError> {
        let rec = self.records.get_mut(id).ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        if rec.state.is_terminal() {
            return Err(LifecycleError::InvalidTransition { id: id.clone(), state: rec.state, action: "cancel" });
        }
        rec.cancel_requested_at_ms = Some(now_ms);
        rec.expiring |= expire;
        Ok(())
    }

    /// Cancel call failed for good; allow housekeeping to try again.
    pub fn cancel_failed(&mut self, id: &ClientOrderId) {
        if let Some(rec) = self.records.get_mut(id) {
            rec.cancel_requested_at_ms = None;
        }
    }

    /// Resting orders past their TTL or whose signal basis drifted too far.
    /// Reduce-only exits are included; the engine re-issues them at the touch.
    pub fn stale_orders(&self, now_ms: i64, mark: f64, ttl_ms: i64, threshold: f64) -> Vec<ClientOrderId> {
        self.records
            .values()
            .filter(|r| r.state.is_resting() && r.cancel_requested_at_ms.is_none())
            .filter(|r| {
                let aged = ttl_ms > 0 && now_ms - r.created_at_ms >= ttl_ms;
                let drifted = mark > 0.0 && r.basis_price > 0.0 && ((mark - r.basis_price) / r.basis_price).abs() > threshold;
                aged || drifted
            })
            .map(|r| r.client_order_id.clone())
            .collect()
    }

    pub fn awaiting_ack(&self, now_ms: i64, timeout_ms: i64) -> Vec<ClientOrderId> {
        self.records
            .values()
            .filter(|r| matches!(r.state, OrderState::Submitted { .. }) && now_ms - r.last_event_at_ms >= timeout_ms)
            .map(|r| r.client_order_id.clone())
            .collect()
    }

    pub fn awaiting_cancel(&self, now_ms: i64, timeout_ms: i64) -> Vec<ClientOrderId> {
        self.records
            .values()
            .filter(|r| !r.state.is_terminal())
            .filter(|r| r.cancel_requested_at_ms.map_or(false, |t| now_ms - t >= timeout_ms))
            .map(|r| r.client_order_id.clone())
            .collect()
    }

    // ---- views ----

    pub fn open_orders(&self) -> impl Iterator<Item = &OrderRecord> {
        self.records.values().filter(|r| !r.state.is_terminal())
    }

    pub fn open_count(&self) -> usize { self.open_orders().count() }

    pub fn pending_exposure(&self) -> f64 { self.open_orders().map(|r| r.signed_remaining()).sum() }

    /// Non-terminal records the venue should know about (everything past Created).
    pub fn unsettled_ids(&self) -> Vec<ClientOrderId> {
        self.open_orders()
            .filter(|r| r.state != OrderState::Created)
            .map(|r| r.client_order_id.clone())
            .collect()
    }

    pub fn derived_net_size(&self) -> f64 {
        self.baseline + self.records.values().map(|r| r.position_contribution()).sum::<f64>()
    }

    /// `net_size == baseline + Σ fills`; a mismatch halts the instrument.
    pub fn verify_position(&mut self) -> Result<(), LifecycleError> {
        let derived = self.derived_net_size();
        if (derived - self.position.net_size).abs() > POSITION_TOLERANCE {
            let msg = format!("position {} disagrees with fills {}", self.position.net_size, derived);
            self.halt(msg.clone());
            return Err(LifecycleError::ReconciliationConflict(msg));
        }
        Ok(())
    }

    // ---- resync ----

    /// Take over an open order found on the venue that has no local record.
    pub fn adopt(&mut self, update: &OrderUpdate, now_ms: i64) -> Result<Applied, LifecycleError> {
        if self.resolve(update).is_some() {
            return self.apply(update, now_ms);
        }
        let id = update
            .client_order_id
            .clone()
            .or_else(|| update.exchange_order_id.as_ref().map(|x| ClientOrderId::new(format!("ext-{x}"))))
            .ok_or_else(|| LifecycleError::ReconciliationConflict("venue order without any id".into()))?;
        if self.records.contains_key(&id) {
            return self.apply(update, now_ms);
        }

        let state = target_state(update.status, update.cum_filled, update.qty, false);
        let basis = update.price.filter(|p| *p > 0.0).unwrap_or(update.avg_price);
        let rec = OrderRecord {
            client_order_id: id.clone(),
            exchange_order_id: update.exchange_order_id.clone(),
            symbol: update.symbol.clone(),
            side: update.side,
            requested_size: update.qty,
            state,
            filled_size: update.cum_filled,
            remaining_size: if state.is_terminal() { 0.0 } else { (update.qty - update.cum_filled).max(0.0) },
            avg_fill_price: update.avg_price,
            limit_price: update.price,
            basis_price: basis,
            reduce_only: update.reduce_only,
            created_at_ms: now_ms,
            last_event_at_ms: now_ms,
            last_key: Some(EventKey { seq: update.seq, cum_filled: update.cum_filled, rank: state.rank() }),
            pre_adoption_filled: update.cum_filled,
            cancel_requested_at_ms: None,
            expiring: false,
            resubmits: 0,
            failed_queries: 0,
            reject_reason: None,
            intent: None,
            seen: std::iter::once((update.event_id.clone(), state)).collect(),
        };
        if let Some(xid) = &update.exchange_order_id {
            self.by_exchange_id.insert(xid.clone(), id.clone());
        }
        info!(symbol = %self.symbol, cl_id = %id, %state, "adopted venue order");
        self.records.insert(id.clone(), rec);
        Ok(Applied::Transition(Transition { client_order_id: id, from: OrderState::Created, to: state, fill: None, cooldown_engaged: false }))
    }

    /// The venue has no trace of a resting order during a full resync: close it
    /// out locally. Its fills so far stay in the position.
    pub fn force_close(&mut self, id: &ClientOrderId, now_ms: i64) -> Option<Transition> {
        let rec = self.records.get_mut(id).filter(|r| !r.state.is_terminal())?;
        let from = rec.state;
        rec.state = OrderState::Cancelled;
        rec.remaining_size = 0.0;
        rec.last_event_at_ms = now_ms;
        warn!(symbol = %self.symbol, cl_id = %id, %from, "order missing on venue, closed locally");
        Some(transition(id, from, OrderState::Cancelled))
    }

    pub fn position_matches(&self, snap: &PositionSnapshot) -> bool {
        (snap.net_size - self.position.net_size).abs() <= POSITION_TOLERANCE
    }

    /// Make the venue's position authoritative; record fills stay as they are
    /// and the baseline absorbs the difference.
    pub fn rebase(&mut self, snap: &PositionSnapshot, now_ms: i64) {
        let contributions: f64 = self.records.values().map(|r| r.position_contribution()).sum();
        if !self.position_matches(snap) {
            warn!(
                symbol = %self.symbol,
                local = self.position.net_size,
                venue = snap.net_size,
                "rebasing position on venue state"
            );
        }
        self.baseline = snap.net_size - contributions;
        self.position.net_size = snap.net_size;
        self.position.avg_entry_price = if snap.net_size.abs() < QTY_EPS { 0.0 } else { snap.avg_entry_price };
        let mark = self.position.last_mark;
        if mark > 0.0 {
            self.position.mark_to_market(mark, now_ms);
        }
    }

    /// Drop terminal records older than `retain_ms`, folding their fills into
    /// the baseline. Returns how many were removed.
    pub fn compact(&mut self, now_ms: i64, retain_ms: i64) -> usize {
        let old: Vec<ClientOrderId> = self
            .records
            .values()
            .filter(|r| r.state.is_terminal() && now_ms - r.last_event_at_ms >= retain_ms)
            .map(|r| r.client_order_id.clone())
            .collect();
        for id in &old {
            if let Some(rec) = self.records.remove(id) {
                self.baseline += rec.position_contribution();
                if let Some(xid) = rec.exchange_order_id {
                    self.by_exchange_id.remove(&xid);
                }
            }
        }
        old.len()
    }
}

fn transition(id: &ClientOrderId, from: OrderState, to: OrderState) -> Transition {
    Transition { client_order_id: id.clone(), from, to, fill: None, cooldown_engaged: false }
}

fn target_state(status: ExchangeStatus, cum_filled: f64, requested: f64, expiring: bool) -> OrderState {
    match status {
        ExchangeStatus::New if cum_filled > QTY_EPS => OrderState::PartiallyFilled,
        ExchangeStatus::New => OrderState::Acknowledged,
        ExchangeStatus::PartiallyFilled if cum_filled >= requested - QTY_EPS => OrderState::Filled,
        ExchangeStatus::PartiallyFilled => OrderState::PartiallyFilled,
        ExchangeStatus::Filled => OrderState::Filled,
        ExchangeStatus::Cancelled if expiring => OrderState::Expired,
        ExchangeStatus::Cancelled => OrderState::Cancelled,
        ExchangeStatus::Rejected => OrderState::Rejected,
    }
}

/// Price of the newly filled slice, backed out of the cumulative average.
fn delta_price(rec: &OrderRecord, update: &OrderUpdate, delta: f64) -> f64 {
    if update.avg_price > 0.0 {
        let px = (update.cum_filled * update.avg_price - rec.filled_size * rec.avg_fill_price) / delta;
        if px.is_finite() && px > 0.0 {
            return px;
        }
        return update.avg_price;
    }
    rec.limit_price.unwrap_or(rec.basis_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, OrderKind, Signal};

    const NOW: i64 = 1_700_000_000_000;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: 10.0,
            max_open_orders: 5,
            daily_loss_limit: 100.0,
            loss_cooldown_ms: 60_000,
            max_daily_trades: 0,
            profit_lock: 0.0,
        }
    }

    fn manager() -> OrderLifecycleManager {
        OrderLifecycleManager::new("BTCUSDT", &limits(), 2, NOW)
    }

    fn intent(id: &str, side: Side, size: f64, px: f64) -> OrderIntent {
        OrderIntent {
            client_order_id: ClientOrderId::new(id),
            symbol: "BTCUSDT".into(),
            side,
            size,
            kind: OrderKind::Limit(px),
            reduce_only: false,
            stop_loss: Some(px - 1.5),
            reason: Signal {
                ts_ms: NOW,
                symbol: "BTCUSDT".into(),
                direction: Direction::Long,
                strength: 0.9,
                basis_price: px,
                zscore: -2.6,
                mean: px + 2.0,
            },
            created_at_ms: NOW,
        }
    }

    fn update(id: &str, seq: u64, status: ExchangeStatus, side: Side, cum: f64, avg: f64) -> OrderUpdate {
        OrderUpdate {
            symbol: "BTCUSDT".into(),
            client_order_id: Some(ClientOrderId::new(id)),
            exchange_order_id: Some(format!("x-{id}")),
            event_id: format!("{id}:{seq}:{status:?}"),
            seq,
            side,
            status,
            qty: 1.0,
            price: Some(100.0),
            cum_filled: cum,
            avg_price: avg,
            reduce_only: false,
            reason: None,
        }
    }

    fn submitted(m: &mut OrderLifecycleManager, id: &str, side: Side, size: f64) -> ClientOrderId {
        let i = intent(id, side, size, 100.0);
        m.register(&i, NOW).expect("register");
        m.mark_submitted(&i.client_order_id, NOW).expect("submit");
        i.client_order_id
    }

    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn happy_path_walks_the_state_machine() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        assert_eq!(m.record(&id).map(|r| r.state), Some(OrderState::Submitted { retrying: false }));

        let ack = SubmitAck { exchange_order_id: "x-a".into() };
        assert!(matches!(m.on_submit_ok(&id, &ack, NOW), Ok(Applied::Transition(_))));

        let t = m.apply(&update("a", 2, ExchangeStatus::PartiallyFilled, Side::Buy, 0.4, 100.0), NOW + 1).expect("partial");
        match t {
            Applied::Transition(t) => {
                assert_eq!(t.to, OrderState::PartiallyFilled);
                assert_eq!(t.fill.as_ref().map(|f| f.size), Some(0.4));
            }
            other => panic!("unexpected {other:?}"),
        }
        m.apply(&update("a", 3, ExchangeStatus::Filled, Side::Buy, 1.0, 100.0), NOW + 2).expect("filled");

        let rec = m.record(&id).expect("record");
        assert_eq!(rec.state, OrderState::Filled);
        assert_eq!(rec.remaining_size, 0.0);
        assert!((m.position().net_size - 1.0).abs() < 1e-9);
        assert_eq!(m.open_count(), 0);
        assert_eq!(m.risk().trades_today, 1);
    }

    #[test]
    fn filled_before_acknowledged_ends_filled() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        m.apply(&update("a", 5, ExchangeStatus::Filled, Side::Buy, 1.0, 100.0), NOW).expect("fill");
        let late_ack = m.apply(&update("a", 1, ExchangeStatus::New, Side::Buy, 0.0, 0.0), NOW + 1).expect("ack");
        assert_eq!(late_ack, Applied::Stale);
        // the REST ack arriving even later changes nothing either
        let rest_ack = m.on_submit_ok(&id, &SubmitAck { exchange_order_id: "x-a".into() }, NOW + 2).expect("rest");
        assert_eq!(rest_ack, Applied::Unchanged);
        assert_eq!(m.record(&id).map(|r| r.state), Some(OrderState::Filled));
        assert!((m.position().net_size - 1.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_delivery_is_detected() {
        let mut m = manager();
        submitted(&mut m, "a", Side::Buy, 1.0);
        let u = update("a", 2, ExchangeStatus::PartiallyFilled, Side::Buy, 0.5, 100.0);
        assert!(matches!(m.apply(&u, NOW), Ok(Applied::Transition(_))));
        assert_eq!(m.apply(&u, NOW), Ok(Applied::Duplicate));
        assert!((m.position().net_size - 0.5).abs() < 1e-9);
    }

    #[test]
    fn every_delivery_order_converges_to_filled() {
        let events = vec![
            update("a", 1, ExchangeStatus::New, Side::Buy, 0.0, 0.0),
            update("a", 2, ExchangeStatus::PartiallyFilled, Side::Buy, 0.4, 100.0),
            update("a", 3, ExchangeStatus::PartiallyFilled, Side::Buy, 0.7, 100.3),
            update("a", 4, ExchangeStatus::Filled, Side::Buy, 1.0, 100.6),
        ];
        let mut finals = Vec::new();
        for order in permutations(&events) {
            let mut m = manager();
            let id = submitted(&mut m, "a", Side::Buy, 1.0);
            for e in &order {
                m.apply(e, NOW).expect("apply");
                // invariant after every step
                assert!((m.derived_net_size() - m.position().net_size).abs() < 1e-9);
            }
            let rec = m.record(&id).expect("record");
            finals.push((rec.state, rec.filled_size, m.position().net_size, m.position().avg_entry_price));
        }
        let (state, filled, net, avg) = finals[0];
        assert_eq!(state, OrderState::Filled);
        for f in &finals {
            assert_eq!(f.0, state);
            assert!((f.1 - filled).abs() < 1e-9);
            assert!((f.2 - net).abs() < 1e-9);
            assert!((f.3 - avg).abs() < 1e-6, "avg {} vs {}", f.3, avg);
        }
        assert!((avg - 100.6).abs() < 1e-6);
    }

    #[test]
    fn every_delivery_order_converges_to_cancelled_with_partial() {
        let events = vec![
            update("a", 1, ExchangeStatus::New, Side::Sell, 0.0, 0.0),
            update("a", 2, ExchangeStatus::PartiallyFilled, Side::Sell, 0.5, 101.0),
            update("a", 3, ExchangeStatus::Cancelled, Side::Sell, 0.5, 101.0),
        ];
        for order in permutations(&events) {
            let mut m = manager();
            let id = submitted(&mut m, "a", Side::Sell, 1.0);
            for e in &order {
                m.apply(e, NOW).expect("apply");
            }
            assert_eq!(m.record(&id).map(|r| r.state), Some(OrderState::Cancelled));
            assert!((m.position().net_size + 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn timeout_then_query_finds_order_acknowledged() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        let t = m.on_submit_failed(&id, &PortError::Timeout("no response".into()), NOW).expect("fail");
        assert!(matches!(t, Applied::Transition(Transition { to: OrderState::Submitted { retrying: true }, .. })));

        let snap = update("a", 3, ExchangeStatus::New, Side::Buy, 0.0, 0.0);
        let out = m.on_status(&id, Some(&snap), NOW + 10).expect("status");
        assert!(matches!(out, StatusOutcome::Applied(Applied::Transition(Transition { to: OrderState::Acknowledged, .. }))));
        let rec = m.record(&id).expect("record");
        assert_eq!(rec.state, OrderState::Acknowledged);
        assert_eq!(rec.exchange_order_id.as_deref(), Some("x-a"));
        assert_eq!(rec.resubmits, 0);
    }

    #[test]
    fn not_found_allows_bounded_resubmits_then_gives_up() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        m.on_submit_failed(&id, &PortError::Timeout("t".into()), NOW).expect("fail");

        for _ in 0..2 {
            match m.on_status(&id, None, NOW).expect("status") {
                StatusOutcome::Resubmit(i) => assert_eq!(i.client_order_id, id),
                other => panic!("expected resubmit, got {other:?}"),
            }
            m.mark_submitted(&id, NOW).expect("resend");
        }
        match m.on_status(&id, None, NOW).expect("status") {
            StatusOutcome::GaveUp(t) => assert_eq!(t.to, OrderState::Rejected),
            other => panic!("expected give up, got {other:?}"),
        }
        assert_eq!(m.open_count(), 0);
    }

    #[test]
    fn acknowledged_order_missing_on_venue_halts() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        m.on_submit_ok(&id, &SubmitAck { exchange_order_id: "x-a".into() }, NOW).expect("ack");
        let err = m.on_status(&id, None, NOW).expect_err("conflict");
        assert!(matches!(err, LifecycleError::ReconciliationConflict(_)));
        assert!(m.halted().is_some());
        assert!(m.clear_halt());
        assert!(m.halted().is_none());
    }

    #[test]
    fn permanent_submit_failure_rejects() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        let t = m.on_submit_failed(&id, &PortError::Permanent("insufficient margin".into()), NOW).expect("fail");
        assert!(matches!(t, Applied::Transition(Transition { to: OrderState::Rejected, .. })));
        assert_eq!(m.record(&id).and_then(|r| r.reject_reason.clone()).as_deref(), Some("insufficient margin"));
        assert_eq!(m.pending_exposure(), 0.0);
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let mut m = manager();
        let i = intent("dup", Side::Buy, 1.0, 100.0);
        m.register(&i, NOW).expect("first");
        assert_eq!(m.register(&i, NOW), Err(LifecycleError::DuplicateClientOrderId(i.client_order_id.clone())));
    }

    #[test]
    fn stale_resting_order_is_expired_on_cancel_confirmation() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        m.apply(&update("a", 1, ExchangeStatus::New, Side::Buy, 0.0, 0.0), NOW).expect("ack");

        assert!(m.stale_orders(NOW + 1_000, 100.2, 60_000, 0.005).is_empty());
        let stale = m.stale_orders(NOW + 1_000, 101.0, 60_000, 0.005);
        assert_eq!(stale, vec![id.clone()]);
        assert_eq!(m.stale_orders(NOW + 60_000, 100.0, 60_000, 0.005), vec![id.clone()]);

        m.begin_cancel(&id, true, NOW + 1_000).expect("cancel");
        assert!(m.stale_orders(NOW + 1_000, 101.0, 60_000, 0.005).is_empty());
        m.apply(&update("a", 2, ExchangeStatus::Cancelled, Side::Buy, 0.0, 0.0), NOW + 2_000).expect("cxl");
        assert_eq!(m.record(&id).map(|r| r.state), Some(OrderState::Expired));
    }

    #[test]
    fn losing_round_trip_engages_cooldown() {
        let mut m = manager();
        submitted(&mut m, "open", Side::Buy, 1.0);
        m.apply(&update("open", 1, ExchangeStatus::Filled, Side::Buy, 1.0, 1000.0), NOW).expect("open");
        submitted(&mut m, "close", Side::Sell, 1.0);
        let t = m.apply(&update("close", 2, ExchangeStatus::Filled, Side::Sell, 1.0, 850.0), NOW + 1).expect("close");
        match t {
            Applied::Transition(t) => {
                assert!(t.cooldown_engaged);
                assert!((t.fill.expect("fill").realized_pnl + 150.0).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(m.risk().in_cooldown(NOW + 2));
        assert!(m.position().is_flat());
    }

    #[test]
    fn cumulative_fill_going_backwards_is_a_conflict() {
        let mut m = manager();
        submitted(&mut m, "a", Side::Buy, 1.0);
        m.apply(&update("a", 2, ExchangeStatus::PartiallyFilled, Side::Buy, 0.6, 100.0), NOW).expect("fill");
        let err = m.apply(&update("a", 3, ExchangeStatus::PartiallyFilled, Side::Buy, 0.3, 100.0), NOW).expect_err("conflict");
        assert!(matches!(err, LifecycleError::ReconciliationConflict(_)));
        assert!(m.halted().is_some());
    }

    #[test]
    fn adoption_and_rebase_keep_the_invariant() {
        let mut m = manager();
        let mut venue = update("old", 7, ExchangeStatus::PartiallyFilled, Side::Buy, 0.25, 99.0);
        venue.qty = 1.0;
        assert!(matches!(m.adopt(&venue, NOW), Ok(Applied::Transition(_))));
        m.rebase(&PositionSnapshot { symbol: "BTCUSDT".into(), net_size: 0.75, avg_entry_price: 99.5 }, NOW);
        assert!(m.verify_position().is_ok());
        assert_eq!(m.open_count(), 1);
        assert!((m.pending_exposure() - 0.75).abs() < 1e-9);

        // the adopted order keeps filling through the stream
        m.apply(&update("old", 8, ExchangeStatus::Filled, Side::Buy, 1.0, 99.2), NOW).expect("fill");
        assert!((m.position().net_size - 1.5).abs() < 1e-9);
        assert!(m.verify_position().is_ok());
    }

    #[test]
    fn compaction_folds_fills_into_baseline() {
        let mut m = manager();
        submitted(&mut m, "a", Side::Buy, 1.0);
        m.apply(&update("a", 1, ExchangeStatus::Filled, Side::Buy, 1.0, 100.0), NOW).expect("fill");
        assert_eq!(m.compact(NOW + 10, 60_000), 0);
        assert_eq!(m.compact(NOW + 60_000, 60_000), 1);
        assert!(m.record(&ClientOrderId::new("a")).is_none());
        assert!(m.verify_position().is_ok());
        assert!((m.derived_net_size() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn force_close_keeps_partial_fill() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        m.apply(&update("a", 1, ExchangeStatus::PartiallyFilled, Side::Buy, 0.3, 100.0), NOW).expect("fill");
        let t = m.force_close(&id, NOW + 1).expect("closed");
        assert_eq!((t.from, t.to), (OrderState::PartiallyFilled, OrderState::Cancelled));
        assert!(m.force_close(&id, NOW + 2).is_none());
        assert!((m.position().net_size - 0.3).abs() < 1e-9);
        assert!(m.verify_position().is_ok());
    }

    #[test]
    fn unknown_updates_are_reported_not_applied() {
        let mut m = manager();
        let out = m.apply(&update("ghost", 1, ExchangeStatus::Filled, Side::Buy, 1.0, 100.0), NOW);
        assert_eq!(out, Ok(Applied::Unknown));
        assert!(m.position().is_flat());
    }

    #[test]
    fn fill_on_a_closed_record_is_a_conflict() {
        let mut m = manager();
        let id = submitted(&mut m, "a", Side::Buy, 1.0);
        m.apply(&update("a", 1, ExchangeStatus::New, Side::Buy, 0.0, 0.0), NOW).expect("ack");
        m.force_close(&id, NOW + 1).expect("closed");

        // a late replay without new fills is still absorbed
        assert_eq!(m.apply(&update("a", 2, ExchangeStatus::New, Side::Buy, 0.0, 0.0), NOW + 2), Ok(Applied::Unchanged));
        assert!(m.halted().is_none());

        let err = m
            .apply(&update("a", 3, ExchangeStatus::PartiallyFilled, Side::Buy, 0.4, 100.0), NOW + 3)
            .expect_err("conflict");
        assert!(matches!(err, LifecycleError::ReconciliationConflict(_)));
        assert!(m.halted().is_some());
        assert!(m.position().is_flat());
    }

    #[test]
    fn drifted_exit_is_stale_too() {
        let mut m = manager();
        let mut i = intent("exit", Side::Sell, 1.0, 101.0);
        i.reduce_only = true;
        m.register(&i, NOW).expect("register");
        m.mark_submitted(&i.client_order_id, NOW).expect("submit");
        m.apply(&update("exit", 1, ExchangeStatus::New, Side::Sell, 0.0, 0.0), NOW).expect("ack");
        assert!(m.stale_orders(NOW + 1, 101.0, 60_000, 0.005).is_empty());
        assert_eq!(m.stale_orders(NOW + 1, 80.0, 60_000, 0.005), vec![i.client_order_id]);
    }
}
