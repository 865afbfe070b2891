// ===============================
// src/engine.rs
// ===============================
//
// One task per instrument. The task owns SignalEngine, RiskManager and the
// OrderLifecycleManager; venue calls run in JoinSet workers and come back as
// WorkerResult, so trading state is only ever touched from this loop.
//
//   select! { shutdown | worker result | account event | market event | housekeeping }
//
// Submissions pause while the instrument is halted, the account stream is
// down, a resync is pending or running, or shutdown has begun.
//
use std::time::Duration;

use ahash::AHashSet as HashSet;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinSet},
    time::{interval, timeout_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::domain::{
    now_ms, round_to_step, AccountEvent, ClientOrderId, ClientOrderIdGen, Direction, Event, MarketEvent, OrderIntent,
    OrderKind, OrderState, OrderUpdate, PositionSnapshot, RiskLimits, Side, Signal, Tick, QTY_EPS,
};
use crate::lifecycle::{Applied, LifecycleError, OrderLifecycleManager, StatusOutcome, Transition};
use crate::metrics::{
    COOLDOWN, HALTED, INTENTS, LAT_SUBMIT_ACK, OPEN_ORDERS, PNL_REALIZED, PNL_UNREALIZED, PORT_ERRORS, POSITION,
    RISK_REJECTS, SIGNALS, TRANSITIONS,
};
use crate::notifier::{Notice, Notifier};
use crate::port::{PortError, SharedPort, SubmitAck};
use crate::recorder::Journal;
use crate::retry::{retry, RetryPolicy};
use crate::risk::{RiskContext, RiskDecision, RiskManager, RiskRejection};
use crate::strategy::{SignalEngine, SignalParams};

/// Terminal records are kept this long before compaction.
const RETAIN_TERMINAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType { Limit, Market }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialFillPolicy {
    /// Leave the remainder working.
    Hold,
    /// Cancel the remainder when the latest signal is flat or opposite.
    Reevaluate,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub order_size: f64,
    pub order_type: OrderType,
    pub qty_step: f64,
    pub price_tick: f64,
    pub min_strength: f64,
    pub exit_z: f64,
    /// Entry stop distance is the smaller of `stop_loss_pct × price` and
    /// `stop_loss_atr_mult × ATR`; both zero sends no stop.
    pub stop_loss_pct: f64,
    pub stop_loss_atr_mult: f64,
    /// Close once price is this many ATRs beyond the average entry (0 = off).
    pub trailing_atr_mult: f64,
    pub ack_timeout: Duration,
    pub order_ttl: Duration,
    pub stale_threshold: f64,
    pub partial_fill_policy: PartialFillPolicy,
    pub max_resubmits: u32,
    pub housekeeping: Duration,
    pub resync_interval: Duration,
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order_size: 0.01,
            order_type: OrderType::Limit,
            qty_step: 0.001,
            price_tick: 0.1,
            min_strength: 0.6,
            exit_z: 0.0,
            stop_loss_pct: 0.015,
            stop_loss_atr_mult: 1.5,
            trailing_atr_mult: 1.2,
            ack_timeout: Duration::from_millis(5000),
            order_ttl: Duration::from_secs(120),
            stale_threshold: 0.005,
            partial_fill_policy: PartialFillPolicy::Hold,
            max_resubmits: 2,
            housekeeping: Duration::from_millis(1000),
            resync_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let bad = |msg: &str| Err(EngineError::Configuration(msg.to_string()));
        if !(self.qty_step > 0.0) || !(self.price_tick > 0.0) {
            return bad("qty step and price tick must be positive");
        }
        if round_to_step(self.order_size, self.qty_step) < QTY_EPS {
            return bad("order size rounds to zero at the quantity step");
        }
        if !(0.0..=1.0).contains(&self.min_strength) {
            return bad("min strength must be within [0, 1]");
        }
        let stops = [self.stop_loss_pct, self.stop_loss_atr_mult, self.trailing_atr_mult];
        if stops.iter().any(|x| !(*x >= 0.0) || !x.is_finite()) {
            return bad("stop settings must be non-negative");
        }
        if self.housekeeping.is_zero() || self.ack_timeout.is_zero() {
            return bad("housekeeping interval and ack timeout must be non-zero");
        }
        if self.retry.max_attempts == 0 {
            return bad("retry attempts must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient network failure: {0}")]
    TransientNetwork(PortError),
    #[error("exchange rejection: {0}")]
    ExchangeRejection(String),
    #[error("reconciliation conflict: {0}")]
    ReconciliationConflict(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<PortError> for EngineError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::Permanent(msg) => EngineError::ExchangeRejection(msg),
            other => EngineError::TransientNetwork(other),
        }
    }
}

impl From<LifecycleError> for EngineError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::ReconciliationConflict(msg) => EngineError::ReconciliationConflict(msg),
            other => EngineError::ReconciliationConflict(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResyncKind {
    Bootstrap,
    Reconnect,
    HaltRecovery,
}

impl ResyncKind {
    /// Bootstrap and halt recovery take the venue position as the new baseline;
    /// a reconnect only checks it.
    fn rebases(self) -> bool { !matches!(self, ResyncKind::Reconnect) }

    fn label(self) -> &'static str {
        match self {
            ResyncKind::Bootstrap => "bootstrap",
            ResyncKind::Reconnect => "reconnect",
            ResyncKind::HaltRecovery => "halt_recovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op { Submit, Cancel, Query }

struct ResyncData {
    position: PositionSnapshot,
    open: Vec<OrderUpdate>,
    statuses: Vec<(ClientOrderId, Option<OrderUpdate>)>,
}

enum WorkerResult {
    Submitted { id: ClientOrderId, res: Result<SubmitAck, PortError>, sent_at: Instant },
    Cancelled { id: ClientOrderId, res: Result<(), PortError> },
    Status { id: ClientOrderId, res: Result<Option<OrderUpdate>, PortError> },
    Resync { kind: ResyncKind, res: Result<ResyncData, EngineError> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSummary {
    pub symbol: String,
    pub net_size: f64,
    pub realized_pnl: f64,
    pub cancelled: usize,
    pub failed: usize,
}

pub struct Engine {
    symbol: String,
    cfg: EngineConfig,
    port: SharedPort,
    signal: SignalEngine,
    risk: RiskManager,
    lifecycle: OrderLifecycleManager,
    ids: ClientOrderIdGen,
    notifier: Notifier,
    journal: Journal,
    workers: JoinSet<WorkerResult>,
    in_flight: HashSet<(ClientOrderId, Op)>,
    last_signal: Option<Signal>,
    last_tick: Option<Tick>,
    stream_up: bool,
    synced: bool,
    resync_running: bool,
    resync_started_ms: i64,
    pending_resync: Option<ResyncKind>,
    next_resync_at: Instant,
    halt_notified: bool,
    cooldown_notified: bool,
    last_risk_reason: Option<&'static str>,
    stopping: bool,
    shutdown_cancelled: usize,
    shutdown_failed: usize,
}

impl Engine {
    pub fn new(
        symbol: impl Into<String>,
        cfg: EngineConfig,
        signal: SignalParams,
        limits: &RiskLimits,
        port: SharedPort,
        notifier: Notifier,
        journal: Journal,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            lifecycle: OrderLifecycleManager::new(symbol.clone(), limits, cfg.max_resubmits, now_ms()),
            ids: ClientOrderIdGen::new("mr"),
            signal: SignalEngine::new(signal),
            risk: RiskManager::new(),
            symbol,
            cfg,
            port,
            notifier,
            journal,
            workers: JoinSet::new(),
            in_flight: HashSet::new(),
            last_signal: None,
            last_tick: None,
            stream_up: false,
            synced: false,
            resync_running: false,
            resync_started_ms: 0,
            pending_resync: None,
            next_resync_at: Instant::now(),
            halt_notified: false,
            cooldown_notified: false,
            last_risk_reason: None,
            stopping: false,
            shutdown_cancelled: 0,
            shutdown_failed: 0,
        }
    }

    pub async fn run(
        mut self,
        mut market_rx: mpsc::Receiver<MarketEvent>,
        mut account_rx: mpsc::Receiver<AccountEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> EngineSummary {
        info!(symbol = %self.symbol, venue = self.port.name(), "engine started");
        self.request_resync(ResyncKind::Bootstrap);

        let mut hk = interval(self.cfg.housekeeping);
        hk.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut market_open = true;
        let mut account_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => self.on_joined(joined),
                ev = account_rx.recv(), if account_open => match ev {
                    Some(ev) => self.on_account(ev),
                    None => {
                        account_open = false;
                        self.on_account(AccountEvent::StreamDown);
                    }
                },
                ev = market_rx.recv(), if market_open => match ev {
                    Some(ev) => self.on_market(ev),
                    None => {
                        warn!(symbol = %self.symbol, "market channel closed");
                        market_open = false;
                    }
                },
                _ = hk.tick() => self.housekeeping(),
            }
        }
        self.shutdown().await
    }

    // ---- market side ----

    fn on_market(&mut self, ev: MarketEvent) {
        match ev {
            MarketEvent::FeedUp => info!(symbol = %self.symbol, "market feed up"),
            MarketEvent::FeedDown => warn!(symbol = %self.symbol, "market feed down"),
            MarketEvent::Tick(t) => {
                if t.symbol != self.symbol {
                    return;
                }
                let now = now_ms();
                let mid = t.mid();
                if mid > 0.0 {
                    self.lifecycle.mark(mid, now);
                }
                let sig = self.signal.on_tick(&t);
                self.journal.record(Event::Md(t.clone()));
                self.last_tick = Some(t);
                if let Some(sig) = sig {
                    SIGNALS.with_label_values(&[self.symbol.as_str(), sig.direction.as_str()]).inc();
                    if sig.direction != Direction::Flat {
                        debug!(symbol = %self.symbol, dir = sig.direction.as_str(), z = sig.zscore, strength = sig.strength, "signal");
                        self.journal.record(Event::Sig(sig.clone()));
                    }
                    self.last_signal = Some(sig.clone());
                    self.decide(&sig);
                }
            }
        }
    }

    fn can_submit(&self) -> bool {
        !self.stopping
            && self.stream_up
            && self.synced
            && !self.resync_running
            && self.lifecycle.halted().is_none()
    }

    fn decide(&mut self, sig: &Signal) {
        if !self.can_submit() {
            return;
        }
        self.cancel_conflicting();
        let Some(tick) = self.last_tick.clone() else { return };

        // exit: price reverted through the mean, or ran too far against the entry
        let (net, entry) = {
            let pos = self.lifecycle.position();
            (pos.net_size, pos.avg_entry_price)
        };
        if net.abs() > QTY_EPS {
            let held = if net > 0.0 { Side::Buy } else { Side::Sell };
            let has_exit = self.lifecycle.open_orders().any(|r| r.reduce_only);
            let reverted = match held {
                Side::Buy => sig.zscore >= self.cfg.exit_z,
                Side::Sell => sig.zscore <= -self.cfg.exit_z,
            };
            let stopped = match self.signal.atr() {
                Some(atr) if atr > 0.0 && entry > 0.0 && self.cfg.trailing_atr_mult > 0.0 => {
                    let dist = self.cfg.trailing_atr_mult * atr;
                    match held {
                        Side::Buy => sig.basis_price <= entry - dist,
                        Side::Sell => sig.basis_price >= entry + dist,
                    }
                }
                _ => false,
            };
            if (reverted || stopped) && !has_exit {
                let size = round_to_step(net.abs(), self.cfg.qty_step);
                if size > QTY_EPS {
                    let intent = self.build_intent(held.opposite(), size, true, sig, &tick);
                    if stopped && !reverted {
                        warn!(symbol = %self.symbol, net, entry, px = sig.basis_price, "stop distance reached, closing position");
                    } else {
                        info!(symbol = %self.symbol, net, z = sig.zscore, "mean reached, closing position");
                    }
                    self.place(intent);
                    return;
                }
            }
        }

        // entry
        let Some(side) = sig.direction.side() else { return };
        if sig.strength < self.cfg.min_strength || self.lifecycle.open_count() > 0 {
            return;
        }
        let intent = self.build_intent(side, self.cfg.order_size, false, sig, &tick);
        self.place(intent);
    }

    fn build_intent(&mut self, side: Side, size: f64, reduce_only: bool, sig: &Signal, tick: &Tick) -> OrderIntent {
        let now = now_ms();
        let kind = match self.cfg.order_type {
            OrderType::Market => OrderKind::Market,
            OrderType::Limit => {
                let touch = match side {
                    Side::Buy => tick.ask,
                    Side::Sell => tick.bid,
                };
                let px = if touch > 0.0 { touch } else { tick.mid() };
                OrderKind::Limit(round_to_step(px, self.cfg.price_tick))
            }
        };
        let stop_loss = if reduce_only {
            None
        } else {
            self.stop_loss_for(side, kind.limit_price().unwrap_or_else(|| tick.mid()))
        };
        OrderIntent {
            client_order_id: self.ids.next(now),
            symbol: self.symbol.clone(),
            side,
            size: round_to_step(size, self.cfg.qty_step),
            kind,
            reduce_only,
            stop_loss,
            reason: sig.clone(),
            created_at_ms: now,
        }
    }

    fn stop_loss_for(&self, side: Side, entry: f64) -> Option<f64> {
        let by_pct = (self.cfg.stop_loss_pct > 0.0).then(|| self.cfg.stop_loss_pct * entry);
        let by_atr = self
            .signal
            .atr()
            .filter(|atr| *atr > 0.0 && self.cfg.stop_loss_atr_mult > 0.0)
            .map(|atr| self.cfg.stop_loss_atr_mult * atr);
        let dist = match (by_pct, by_atr) {
            (Some(p), Some(a)) => p.min(a),
            (Some(d), None) | (None, Some(d)) => d,
            (None, None) => return None,
        };
        if !(dist > 0.0) || !(entry > 0.0) {
            return None;
        }
        let px = match side {
            Side::Buy => entry - dist,
            Side::Sell => entry + dist,
        };
        let px = round_to_step(px, self.cfg.price_tick);
        (px > 0.0).then_some(px)
    }

    fn place(&mut self, intent: OrderIntent) {
        let now = now_ms();
        let decision = self.risk.approve(
            &intent,
            &RiskContext {
                position: self.lifecycle.position(),
                state: self.lifecycle.risk(),
                open_orders: self.lifecycle.open_count(),
                pending_exposure: self.lifecycle.pending_exposure(),
                now_ms: now,
            },
        );
        if let RiskDecision::Rejected(reason) = decision {
            self.on_risk_rejection(&intent, reason, now);
            return;
        }
        self.last_risk_reason = None;

        // journal before anything leaves the process
        self.journal.record(Event::Intent(intent.clone()));
        if let Err(e) = self.lifecycle.register(&intent, now) {
            error!(symbol = %self.symbol, err = %e, "register failed");
            return;
        }
        match self.lifecycle.mark_submitted(&intent.client_order_id, now) {
            Ok(t) => self.on_transition(t),
            Err(e) => {
                error!(symbol = %self.symbol, err = %e, "submit transition refused");
                return;
            }
        }
        INTENTS.with_label_values(&[self.symbol.as_str(), intent.side.as_str()]).inc();
        info!(
            symbol = %self.symbol,
            cl_id = %intent.client_order_id,
            side = intent.side.as_str(),
            size = intent.size,
            kind = ?intent.kind,
            reduce_only = intent.reduce_only,
            "submitting order"
        );
        self.spawn_submit(intent);
    }

    fn on_risk_rejection(&mut self, intent: &OrderIntent, reason: RiskRejection, now: i64) {
        let code = reason.code();
        RISK_REJECTS.with_label_values(&[self.symbol.as_str(), code]).inc();
        self.journal.record(Event::RiskReject {
            symbol: self.symbol.clone(),
            cl_id: intent.client_order_id.clone(),
            reason: code.to_string(),
            ts_ms: now,
        });
        if self.last_risk_reason == Some(code) {
            debug!(symbol = %self.symbol, reason = code, "risk rejected");
            return;
        }
        warn!(symbol = %self.symbol, cl_id = %intent.client_order_id, reason = %reason, "risk rejected");
        self.last_risk_reason = Some(code);
        self.notifier.notify(Notice::RiskRejected { symbol: self.symbol.clone(), reason: reason.to_string() });
    }

    /// Cancel resting entry orders that fight the latest signal. Under
    /// `Reevaluate` a partially filled entry is also cancelled on a flat signal.
    fn cancel_conflicting(&mut self) {
        let Some(dir) = self.last_signal.as_ref().map(|s| s.direction) else { return };
        let wanted = dir.side();
        let reevaluate = self.cfg.partial_fill_policy == PartialFillPolicy::Reevaluate;
        let doomed: Vec<ClientOrderId> = self
            .lifecycle
            .open_orders()
            .filter(|r| r.state.is_resting() && !r.reduce_only && r.cancel_requested_at_ms.is_none())
            .filter(|r| match wanted {
                Some(side) => side != r.side,
                None => reevaluate && r.state == OrderState::PartiallyFilled,
            })
            .map(|r| r.client_order_id.clone())
            .collect();
        for id in doomed {
            info!(symbol = %self.symbol, cl_id = %id, dir = dir.as_str(), "cancelling order against signal");
            self.spawn_cancel(&id, false);
        }
    }

    // ---- account side ----

    fn on_account(&mut self, ev: AccountEvent) {
        match ev {
            AccountEvent::Order(u) => {
                if u.symbol != self.symbol {
                    return;
                }
                let res = self.lifecycle.apply(&u, now_ms());
                if matches!(res, Ok(Applied::Unknown)) {
                    debug!(symbol = %self.symbol, event_id = %u.event_id, "event for an order this engine does not track");
                }
                self.handle_applied(res);
            }
            AccountEvent::StreamDown => {
                if self.stream_up {
                    warn!(symbol = %self.symbol, "account stream down, submissions paused");
                }
                self.stream_up = false;
                self.synced = false;
            }
            AccountEvent::StreamUp => {
                info!(symbol = %self.symbol, "account stream up, resyncing");
                self.stream_up = true;
                self.synced = false;
                self.request_resync(ResyncKind::Reconnect);
            }
        }
    }

    fn handle_applied(&mut self, res: Result<Applied, LifecycleError>) {
        match res {
            Ok(Applied::Transition(t)) => self.on_transition(t),
            Ok(_) => {}
            Err(e) => self.on_lifecycle_error(e),
        }
    }

    fn on_lifecycle_error(&mut self, e: LifecycleError) {
        if self.lifecycle.halted().is_some() {
            self.after_halt();
        } else {
            error!(symbol = %self.symbol, err = %e, "lifecycle error");
        }
    }

    fn after_halt(&mut self) {
        let Some(reason) = self.lifecycle.halted().map(str::to_string) else { return };
        self.synced = false;
        HALTED.with_label_values(&[self.symbol.as_str()]).set(1);
        if !self.halt_notified {
            self.halt_notified = true;
            self.notifier.notify(Notice::Halted { symbol: self.symbol.clone(), reason });
        }
        self.schedule_resync(ResyncKind::HaltRecovery, self.cfg.resync_interval);
    }

    fn on_transition(&mut self, t: Transition) {
        let now = now_ms();
        info!(
            symbol = %self.symbol,
            cl_id = %t.client_order_id,
            from = %t.from,
            to = %t.to,
            fill = ?t.fill.as_ref().map(|f| (f.size, f.price)),
            "order transition"
        );
        TRANSITIONS.with_label_values(&[self.symbol.as_str(), t.to.label()]).inc();
        self.journal.record(Event::Transition {
            symbol: self.symbol.clone(),
            cl_id: t.client_order_id.clone(),
            from: t.from,
            to: t.to,
            ts_ms: now,
        });

        if t.fill.is_some() {
            self.export_position();
        }
        if t.cooldown_engaged {
            let risk = self.lifecycle.risk();
            warn!(symbol = %self.symbol, daily_pnl = risk.daily_realized_pnl, "daily loss limit breached, cooldown engaged");
            self.notifier.notify(Notice::CooldownEngaged {
                symbol: self.symbol.clone(),
                daily_pnl: risk.daily_realized_pnl,
                until_ms: risk.cooldown_until_ms.unwrap_or(now),
            });
            self.cooldown_notified = true;
            COOLDOWN.with_label_values(&[self.symbol.as_str()]).set(1);
        }

        if let Some(rec) = self.lifecycle.record(&t.client_order_id) {
            let notice = match t.to {
                OrderState::Filled => Some(Notice::OrderFilled {
                    symbol: self.symbol.clone(),
                    cl_id: t.client_order_id.clone(),
                    side: rec.side,
                    size: rec.filled_size,
                    avg_price: rec.avg_fill_price,
                }),
                OrderState::Rejected => Some(Notice::OrderRejected {
                    symbol: self.symbol.clone(),
                    cl_id: t.client_order_id.clone(),
                    reason: rec.reject_reason.clone().unwrap_or_else(|| "rejected".into()),
                }),
                OrderState::Expired => {
                    Some(Notice::OrderExpired { symbol: self.symbol.clone(), cl_id: t.client_order_id.clone() })
                }
                _ => None,
            };
            if let Some(n) = notice {
                self.notifier.notify(n);
            }
        }

        if t.to == OrderState::PartiallyFilled && self.cfg.partial_fill_policy == PartialFillPolicy::Hold {
            return;
        }
        if !self.stopping {
            self.cancel_conflicting();
        }
    }

    // ---- workers ----

    fn spawn_submit(&mut self, intent: OrderIntent) {
        let id = intent.client_order_id.clone();
        self.in_flight.insert((id.clone(), Op::Submit));
        let port = self.port.clone();
        let policy = self.cfg.retry.clone();
        let sent_at = Instant::now();
        self.workers.spawn(async move {
            let res = retry(&policy, "submit", false, || port.submit(&intent)).await;
            WorkerResult::Submitted { id, res, sent_at }
        });
    }

    fn spawn_cancel(&mut self, id: &ClientOrderId, expire: bool) {
        if self.in_flight.contains(&(id.clone(), Op::Cancel)) {
            return;
        }
        if let Err(e) = self.lifecycle.begin_cancel(id, expire, now_ms()) {
            debug!(symbol = %self.symbol, err = %e, "cancel skipped");
            return;
        }
        self.in_flight.insert((id.clone(), Op::Cancel));
        let (port, policy, symbol, id) = (self.port.clone(), self.cfg.retry.clone(), self.symbol.clone(), id.clone());
        self.workers.spawn(async move {
            let res = retry(&policy, "cancel", true, || port.cancel(&symbol, &id)).await;
            WorkerResult::Cancelled { id, res }
        });
    }

    fn spawn_query(&mut self, id: &ClientOrderId) {
        let key = (id.clone(), Op::Query);
        if self.in_flight.contains(&key) || self.in_flight.contains(&(id.clone(), Op::Submit)) {
            return;
        }
        self.in_flight.insert(key);
        let (port, policy, symbol, id) = (self.port.clone(), self.cfg.retry.clone(), self.symbol.clone(), id.clone());
        self.workers.spawn(async move {
            let res = retry(&policy, "query", true, || port.query_status(&symbol, &id)).await;
            WorkerResult::Status { id, res }
        });
    }

    fn on_joined(&mut self, joined: Result<WorkerResult, JoinError>) {
        let result = match joined {
            Ok(r) => r,
            Err(e) => {
                error!(symbol = %self.symbol, ?e, "worker died");
                return;
            }
        };
        let now = now_ms();
        match result {
            WorkerResult::Submitted { id, res, sent_at } => {
                self.in_flight.remove(&(id.clone(), Op::Submit));
                match res {
                    Ok(ack) => {
                        LAT_SUBMIT_ACK
                            .with_label_values(&[self.symbol.as_str()])
                            .observe(sent_at.elapsed().as_secs_f64() * 1000.0);
                        let res = self.lifecycle.on_submit_ok(&id, &ack, now);
                        self.handle_applied(res);
                    }
                    Err(e) => {
                        PORT_ERRORS.with_label_values(&["submit", e.kind()]).inc();
                        let res = self.lifecycle.on_submit_failed(&id, &e, now);
                        self.handle_applied(res);
                        match e {
                            PortError::Permanent(_) => {}
                            PortError::Timeout(_) => {
                                warn!(symbol = %self.symbol, cl_id = %id, err = %e, "submit outcome unknown, querying");
                                self.spawn_query(&id);
                            }
                            PortError::Transient(_) => {
                                warn!(symbol = %self.symbol, cl_id = %id, err = %e, "submit retries exhausted, querying");
                                self.notifier.notify(Notice::RetryExhausted {
                                    symbol: self.symbol.clone(),
                                    op: "submit",
                                    cl_id: Some(id.clone()),
                                    error: e.to_string(),
                                });
                                self.spawn_query(&id);
                            }
                        }
                    }
                }
            }
            WorkerResult::Cancelled { id, res } => {
                self.in_flight.remove(&(id.clone(), Op::Cancel));
                match res {
                    Ok(()) => {
                        debug!(symbol = %self.symbol, cl_id = %id, "cancel accepted");
                        if self.stopping {
                            self.shutdown_cancelled += 1;
                        }
                    }
                    Err(PortError::Permanent(msg)) => {
                        // most likely already closed; the status query settles it
                        PORT_ERRORS.with_label_values(&["cancel", "permanent"]).inc();
                        warn!(symbol = %self.symbol, cl_id = %id, %msg, "cancel refused");
                        if self.stopping {
                            self.shutdown_failed += 1;
                        } else {
                            self.spawn_query(&id);
                        }
                    }
                    Err(e) => {
                        PORT_ERRORS.with_label_values(&["cancel", e.kind()]).inc();
                        error!(symbol = %self.symbol, cl_id = %id, err = %e, "cancel failed");
                        self.lifecycle.cancel_failed(&id);
                        if self.stopping {
                            self.shutdown_failed += 1;
                        }
                        self.notifier.notify(Notice::RetryExhausted {
                            symbol: self.symbol.clone(),
                            op: "cancel",
                            cl_id: Some(id.clone()),
                            error: e.to_string(),
                        });
                    }
                }
            }
            WorkerResult::Status { id, res } => {
                self.in_flight.remove(&(id.clone(), Op::Query));
                match res {
                    Ok(snap) => {
                        let out = self.lifecycle.on_status(&id, snap.as_ref(), now);
                        self.on_status_outcome(&id, out);
                    }
                    Err(e) => {
                        PORT_ERRORS.with_label_values(&["query", e.kind()]).inc();
                        let failed = self.lifecycle.on_query_failed(&id);
                        warn!(symbol = %self.symbol, cl_id = %id, err = %e, failed, "status query failed");
                        if failed == self.cfg.retry.max_attempts {
                            self.notifier.notify(Notice::RetryExhausted {
                                symbol: self.symbol.clone(),
                                op: "query",
                                cl_id: Some(id.clone()),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
            WorkerResult::Resync { kind, res } => {
                self.resync_running = false;
                match res {
                    Ok(data) => self.apply_resync(kind, data),
                    Err(e) => {
                        warn!(symbol = %self.symbol, kind = kind.label(), err = %e, "resync failed");
                        let delay = if self.lifecycle.halted().is_some() {
                            self.cfg.resync_interval
                        } else {
                            self.cfg.retry.max_delay
                        };
                        self.schedule_resync(kind, delay);
                    }
                }
                self.maybe_start_resync();
            }
        }
    }

    fn on_status_outcome(&mut self, id: &ClientOrderId, out: Result<StatusOutcome, LifecycleError>) {
        match out {
            Ok(StatusOutcome::Applied(a)) => self.handle_applied(Ok(a)),
            Ok(StatusOutcome::Resubmit(intent)) => {
                if self.stopping || self.in_flight.contains(&(id.clone(), Op::Submit)) {
                    return;
                }
                match self.lifecycle.mark_submitted(id, now_ms()) {
                    Ok(t) => {
                        warn!(symbol = %self.symbol, cl_id = %id, "venue has no such order, re-sending under the same id");
                        self.on_transition(t);
                        self.spawn_submit(intent);
                    }
                    Err(e) => error!(symbol = %self.symbol, err = %e, "resubmit refused"),
                }
            }
            Ok(StatusOutcome::GaveUp(t)) => {
                warn!(symbol = %self.symbol, cl_id = %id, "order never reached the venue, giving up");
                self.on_transition(t);
            }
            Ok(StatusOutcome::Pending) => {}
            Err(e) => self.on_lifecycle_error(e),
        }
    }

    // ---- resync ----

    fn merge_kind(current: Option<ResyncKind>, next: ResyncKind) -> ResyncKind {
        match current {
            Some(k) if k.rebases() && !next.rebases() => k,
            _ => next,
        }
    }

    fn request_resync(&mut self, kind: ResyncKind) {
        self.pending_resync = Some(Self::merge_kind(self.pending_resync, kind));
        self.next_resync_at = Instant::now();
        self.maybe_start_resync();
    }

    fn schedule_resync(&mut self, kind: ResyncKind, delay: Duration) {
        self.pending_resync = Some(Self::merge_kind(self.pending_resync, kind));
        self.next_resync_at = Instant::now() + delay;
    }

    fn maybe_start_resync(&mut self) {
        if self.resync_running || self.stopping || Instant::now() < self.next_resync_at {
            return;
        }
        let Some(kind) = self.pending_resync.take() else { return };
        self.resync_running = true;
        self.resync_started_ms = now_ms();
        // a create still on the wire would read as "not found"
        let ids: Vec<ClientOrderId> = self
            .lifecycle
            .unsettled_ids()
            .into_iter()
            .filter(|id| !self.in_flight.contains(&(id.clone(), Op::Submit)))
            .collect();
        info!(symbol = %self.symbol, kind = kind.label(), orders = ids.len(), "resync started");
        let (port, policy, symbol) = (self.port.clone(), self.cfg.retry.clone(), self.symbol.clone());
        self.workers.spawn(async move {
            let res = fetch_resync(&port, &symbol, ids, &policy).await;
            WorkerResult::Resync { kind, res }
        });
    }

    fn apply_resync(&mut self, kind: ResyncKind, data: ResyncData) {
        let now = now_ms();

        for (id, snap) in &data.statuses {
            let Some((touched, resting)) = self
                .lifecycle
                .record(id)
                .map(|r| (r.last_event_at_ms >= self.resync_started_ms, r.state.is_resting()))
            else {
                continue;
            };
            if snap.is_none() {
                if touched {
                    debug!(symbol = %self.symbol, cl_id = %id, "order moved during resync, not-found answer ignored");
                    continue;
                }
                if resting {
                    if let Some(t) = self.lifecycle.force_close(id, now) {
                        self.on_transition(t);
                    }
                    continue;
                }
            }
            let out = self.lifecycle.on_status(id, snap.as_ref(), now);
            self.on_status_outcome(id, out);
        }
        let symbol = self.symbol.clone();
        for u in data.open.iter().filter(|u| u.symbol == symbol) {
            let res = self.lifecycle.adopt(u, now);
            self.handle_applied(res);
        }

        if kind.rebases() {
            self.lifecycle.rebase(&data.position, now);
            if self.lifecycle.clear_halt() {
                info!(symbol = %self.symbol, "halt cleared by full resync");
                HALTED.with_label_values(&[self.symbol.as_str()]).set(0);
                self.halt_notified = false;
                self.notifier.notify(Notice::Resumed { symbol: self.symbol.clone() });
            }
        } else if !self.lifecycle.position_matches(&data.position) {
            let msg = format!(
                "position {} does not match venue {} after reconnect",
                self.lifecycle.position().net_size,
                data.position.net_size
            );
            self.lifecycle.halt(msg);
        }

        if self.lifecycle.halted().is_some() {
            self.after_halt();
        } else {
            // trading resumes only with a live fill stream
            self.synced = self.stream_up;
            if self.pending_resync == Some(ResyncKind::HaltRecovery) {
                self.pending_resync = None;
            }
        }
        self.export_position();
        info!(
            symbol = %self.symbol,
            kind = kind.label(),
            net = self.lifecycle.position().net_size,
            open = self.lifecycle.open_count(),
            synced = self.synced,
            "resync done"
        );
    }

    // ---- housekeeping ----

    fn housekeeping(&mut self) {
        let now = now_ms();

        if self.lifecycle.risk_mut().roll_day(now) {
            info!(symbol = %self.symbol, "new trading day, daily risk counters reset");
        }
        if self.cooldown_notified && !self.lifecycle.risk().in_cooldown(now) {
            self.cooldown_notified = false;
            COOLDOWN.with_label_values(&[self.symbol.as_str()]).set(0);
            info!(symbol = %self.symbol, "cooldown elapsed");
            self.notifier.notify(Notice::CooldownElapsed { symbol: self.symbol.clone() });
        }

        self.maybe_start_resync();

        if !self.resync_running {
            let ack_ms = self.cfg.ack_timeout.as_millis() as i64;
            for id in self.lifecycle.awaiting_ack(now, ack_ms) {
                if self.in_flight.contains(&(id.clone(), Op::Submit)) {
                    continue;
                }
                if let Some(t) = self.lifecycle.mark_retrying(&id, now) {
                    warn!(symbol = %self.symbol, cl_id = %id, "no acknowledgement in time, querying");
                    self.on_transition(t);
                }
                self.spawn_query(&id);
            }

            // a cancel unanswered for long gets re-sent; otherwise just ask
            let resend: Vec<ClientOrderId> = self
                .lifecycle
                .awaiting_cancel(now, ack_ms * 4)
                .into_iter()
                .filter(|id| !self.in_flight.contains(&(id.clone(), Op::Cancel)))
                .collect();
            for id in &resend {
                self.lifecycle.cancel_failed(id);
                let expire = self.lifecycle.record(id).map_or(false, |r| r.expiring);
                self.spawn_cancel(id, expire);
            }
            for id in self.lifecycle.awaiting_cancel(now, ack_ms) {
                if !resend.contains(&id) {
                    self.spawn_query(&id);
                }
            }

            if let Some(mark) = self.last_tick.as_ref().map(|t| t.mid()) {
                let ttl_ms = self.cfg.order_ttl.as_millis() as i64;
                for id in self.lifecycle.stale_orders(now, mark, ttl_ms, self.cfg.stale_threshold) {
                    info!(symbol = %self.symbol, cl_id = %id, mark, "expiring stale order");
                    self.spawn_cancel(&id, true);
                }
            }
        }

        let removed = self.lifecycle.compact(now, RETAIN_TERMINAL.as_millis() as i64);
        if removed > 0 {
            debug!(symbol = %self.symbol, removed, "compacted terminal orders");
        }
        self.export_position();
    }

    fn export_position(&self) {
        let sym = [self.symbol.as_str()];
        let pos = self.lifecycle.position();
        OPEN_ORDERS.with_label_values(&sym).set(self.lifecycle.open_count() as i64);
        POSITION.with_label_values(&sym).set(pos.net_size);
        PNL_REALIZED.with_label_values(&sym).set(pos.realized_pnl);
        PNL_UNREALIZED.with_label_values(&sym).set(pos.unrealized_pnl);
    }

    // ---- shutdown ----

    async fn drain(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while !self.workers.is_empty() {
            match timeout_at(deadline, self.workers.join_next()).await {
                Ok(Some(joined)) => self.on_joined(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!(symbol = %self.symbol, left = self.workers.len(), "grace period over, abandoning workers");
                    self.workers.abort_all();
                    break;
                }
            }
        }
    }

    async fn shutdown(mut self) -> EngineSummary {
        info!(symbol = %self.symbol, "shutting down: draining in-flight calls");
        self.stopping = true;
        self.drain(self.cfg.shutdown_grace).await;

        let open: Vec<ClientOrderId> = self
            .lifecycle
            .open_orders()
            .filter(|r| r.state != OrderState::Created)
            .map(|r| r.client_order_id.clone())
            .collect();
        if !open.is_empty() {
            info!(symbol = %self.symbol, count = open.len(), "cancelling open orders");
        }
        for id in &open {
            // a cancel from before shutdown may still be pending; send a fresh one
            self.lifecycle.cancel_failed(id);
            self.in_flight.remove(&(id.clone(), Op::Cancel));
            self.spawn_cancel(id, false);
        }
        self.drain(self.cfg.shutdown_grace).await;

        let pos = self.lifecycle.position();
        let summary = EngineSummary {
            symbol: self.symbol.clone(),
            net_size: pos.net_size,
            realized_pnl: pos.realized_pnl,
            cancelled: self.shutdown_cancelled,
            failed: self.shutdown_failed,
        };
        if summary.failed > 0 {
            error!(symbol = %self.symbol, failed = summary.failed, "some orders could not be cancelled");
        }
        self.notifier.notify(Notice::ShutdownSummary {
            symbol: summary.symbol.clone(),
            net_size: summary.net_size,
            realized_pnl: summary.realized_pnl,
            cancelled: summary.cancelled,
            failed: summary.failed,
        });
        info!(symbol = %self.symbol, ?summary, "engine stopped");
        summary
    }
}

async fn fetch_resync(
    port: &SharedPort,
    symbol: &str,
    ids: Vec<ClientOrderId>,
    policy: &RetryPolicy,
) -> Result<ResyncData, EngineError> {
    let position = retry(policy, "position", true, || port.position(symbol)).await?;
    let open = retry(policy, "open_orders", true, || port.open_orders(symbol)).await?;
    let mut statuses = Vec::with_capacity(ids.len());
    for id in ids {
        let snap = retry(policy, "query", true, || port.query_status(symbol, &id)).await?;
        statuses.push((id, snap));
    }
    Ok(ResyncData { position, open, statuses })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::domain::ExchangeStatus;
    use crate::gateway::PaperPort;
    use crate::notifier::{self, Notice};
    use crate::port::ExecutionPort;

    #[derive(Default)]
    struct Script {
        submit_results: VecDeque<Result<SubmitAck, PortError>>,
        status_results: VecDeque<Result<Option<OrderUpdate>, PortError>>,
        submitted: Vec<ClientOrderId>,
        cancelled: Vec<ClientOrderId>,
    }

    /// Port that replays scripted answers and records what it was asked.
    #[derive(Default)]
    struct ScriptedPort {
        script: Mutex<Script>,
    }

    impl ScriptedPort {
        fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script.lock().expect("script lock")
        }
    }

    #[async_trait]
    impl ExecutionPort for ScriptedPort {
        fn name(&self) -> &str { "scripted" }

        async fn submit(&self, intent: &OrderIntent) -> Result<SubmitAck, PortError> {
            let mut s = self.lock();
            s.submitted.push(intent.client_order_id.clone());
            s.submit_results.pop_front().unwrap_or_else(|| Ok(SubmitAck { exchange_order_id: "x-1".into() }))
        }

        async fn cancel(&self, _symbol: &str, id: &ClientOrderId) -> Result<(), PortError> {
            self.lock().cancelled.push(id.clone());
            Ok(())
        }

        async fn query_status(&self, _symbol: &str, _id: &ClientOrderId) -> Result<Option<OrderUpdate>, PortError> {
            self.lock().status_results.pop_front().unwrap_or(Ok(None))
        }

        async fn open_orders(&self, _symbol: &str) -> Result<Vec<OrderUpdate>, PortError> {
            Ok(Vec::new())
        }

        async fn position(&self, symbol: &str) -> Result<PositionSnapshot, PortError> {
            Ok(PositionSnapshot { symbol: symbol.to_string(), net_size: 0.0, avg_entry_price: 0.0 })
        }

        async fn stream_account_events(&self, tx: mpsc::Sender<AccountEvent>) -> Result<(), PortError> {
            let _ = tx.send(AccountEvent::StreamUp).await;
            tx.closed().await;
            Ok(())
        }
    }

    /// Paper venue whose creates land late and whose status answers are read
    /// first and delivered late.
    struct SlowPort {
        inner: PaperPort,
        submit_delay: Duration,
        query_delay: Duration,
    }

    #[async_trait]
    impl ExecutionPort for SlowPort {
        fn name(&self) -> &str { "slow" }

        async fn submit(&self, intent: &OrderIntent) -> Result<SubmitAck, PortError> {
            tokio::time::sleep(self.submit_delay).await;
            self.inner.submit(intent).await
        }

        async fn cancel(&self, symbol: &str, id: &ClientOrderId) -> Result<(), PortError> {
            self.inner.cancel(symbol, id).await
        }

        async fn query_status(&self, symbol: &str, id: &ClientOrderId) -> Result<Option<OrderUpdate>, PortError> {
            let snap = self.inner.query_status(symbol, id).await;
            tokio::time::sleep(self.query_delay).await;
            snap
        }

        async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderUpdate>, PortError> {
            self.inner.open_orders(symbol).await
        }

        async fn position(&self, symbol: &str) -> Result<PositionSnapshot, PortError> {
            self.inner.position(symbol).await
        }

        async fn stream_account_events(&self, tx: mpsc::Sender<AccountEvent>) -> Result<(), PortError> {
            self.inner.stream_account_events(tx).await
        }
    }

    fn fast_cfg() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5) },
            housekeeping: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
            ..EngineConfig::default()
        }
    }

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: 1.0,
            max_open_orders: 2,
            daily_loss_limit: 100.0,
            loss_cooldown_ms: 60_000,
            max_daily_trades: 0,
            profit_lock: 0.0,
        }
    }

    fn engine_with(port: SharedPort, cfg: EngineConfig, limits: RiskLimits) -> (Engine, mpsc::Receiver<Notice>) {
        let (n, rx) = notifier::channel(64);
        let mut e = Engine::new("BTCUSDT", cfg, SignalParams::default(), &limits, port, n, Journal::disabled());
        e.stream_up = true;
        e.synced = true;
        (e, rx)
    }

    fn tick(px: f64) -> Tick {
        Tick { symbol: "BTCUSDT".into(), ts_ms: now_ms(), bid: px, ask: px, mark_price: px }
    }

    /// Warm the signal with a choppy window, then break the lower band.
    fn feed_long_breakout(e: &mut Engine) {
        for i in 0..19 {
            e.on_market(MarketEvent::Tick(tick(if i % 2 == 0 { 101.0 } else { 99.0 })));
        }
        e.on_market(MarketEvent::Tick(tick(96.9)));
    }

    /// Breakout entry filled in full at 96.9 on the paper venue.
    async fn filled_long(e: &mut Engine, paper: &PaperPort) -> ClientOrderId {
        feed_long_breakout(e);
        e.drain(Duration::from_secs(2)).await;
        let id = e.lifecycle.open_orders().next().map(|r| r.client_order_id.clone()).expect("entry");
        let fill = paper.fill(&id, 0.01, 96.9).await.expect("fill");
        e.on_account(AccountEvent::Order(fill));
        assert!((e.lifecycle.position().net_size - 0.01).abs() < 1e-12);
        id
    }

    fn open_exit(e: &Engine) -> Option<(ClientOrderId, Side, f64)> {
        e.lifecycle
            .open_orders()
            .find(|r| r.reduce_only)
            .map(|r| (r.client_order_id.clone(), r.side, r.requested_size))
    }

    fn manual_intent(e: &mut Engine) -> OrderIntent {
        let sig = Signal {
            ts_ms: now_ms(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            strength: 0.9,
            basis_price: 100.0,
            zscore: -2.7,
            mean: 103.0,
        };
        e.build_intent(Side::Buy, 0.01, false, &sig, &tick(100.0))
    }

    fn new_update(id: &ClientOrderId, seq: u64) -> OrderUpdate {
        OrderUpdate {
            symbol: "BTCUSDT".into(),
            client_order_id: Some(id.clone()),
            exchange_order_id: Some("x-1".into()),
            event_id: format!("q-{seq}"),
            seq,
            side: Side::Buy,
            status: ExchangeStatus::New,
            qty: 0.01,
            price: Some(100.0),
            cum_filled: 0.0,
            avg_price: 0.0,
            reduce_only: false,
            reason: None,
        }
    }

    fn drain_notices(rx: &mut mpsc::Receiver<Notice>) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn timeout_then_query_finds_order_and_never_resubmits() {
        let port = Arc::new(ScriptedPort::default());
        let (mut e, _rx) = engine_with(port.clone(), fast_cfg(), limits());
        let intent = manual_intent(&mut e);
        let id = intent.client_order_id.clone();
        {
            let mut s = port.lock();
            s.submit_results.push_back(Err(PortError::Timeout("read timed out".into())));
            s.status_results.push_back(Ok(Some(new_update(&id, 7))));
        }

        e.place(intent);
        e.drain(Duration::from_secs(2)).await;

        assert_eq!(port.lock().submitted, vec![id.clone()]);
        let rec = e.lifecycle.record(&id).expect("record");
        assert_eq!(rec.state, OrderState::Acknowledged);
        assert_eq!(rec.exchange_order_id.as_deref(), Some("x-1"));
    }

    #[tokio::test]
    async fn confirmed_not_found_resends_with_same_client_id() {
        let port = Arc::new(ScriptedPort::default());
        let (mut e, _rx) = engine_with(port.clone(), fast_cfg(), limits());
        let intent = manual_intent(&mut e);
        let id = intent.client_order_id.clone();
        {
            let mut s = port.lock();
            s.submit_results.push_back(Err(PortError::Timeout("no response".into())));
            s.status_results.push_back(Ok(None));
        }

        e.place(intent);
        e.drain(Duration::from_secs(2)).await;

        assert_eq!(port.lock().submitted, vec![id.clone(), id.clone()]);
        assert_eq!(e.lifecycle.record(&id).map(|r| r.state), Some(OrderState::Acknowledged));
    }

    #[tokio::test]
    async fn permanent_rejection_is_terminal_and_notified() {
        let port = Arc::new(ScriptedPort::default());
        let (mut e, mut rx) = engine_with(port.clone(), fast_cfg(), limits());
        let intent = manual_intent(&mut e);
        let id = intent.client_order_id.clone();
        port.lock().submit_results.push_back(Err(PortError::Permanent("retCode 110007: insufficient balance".into())));

        e.place(intent);
        e.drain(Duration::from_secs(2)).await;

        assert_eq!(port.lock().submitted.len(), 1);
        assert_eq!(e.lifecycle.record(&id).map(|r| r.state), Some(OrderState::Rejected));
        let notices = drain_notices(&mut rx);
        assert!(notices.iter().any(|n| matches!(n, Notice::OrderRejected { cl_id, .. } if *cl_id == id)));
    }

    #[tokio::test]
    async fn lower_band_breach_places_one_marketable_buy() {
        let paper = PaperPort::new(None);
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(2)).await;

        assert_eq!(paper.submit_count().await, 1);
        let open: Vec<_> = e.lifecycle.open_orders().collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Buy);
        assert_eq!(open[0].state, OrderState::Acknowledged);
        assert!((open[0].requested_size - 0.01).abs() < 1e-12);
        assert!((open[0].limit_price.unwrap_or_default() - 96.9).abs() < 1e-9);
        // 1.5% under the entry is tighter than 1.5 ATR here
        let stop = open[0].intent.as_ref().and_then(|i| i.stop_loss).expect("stop");
        assert!((stop - 95.4).abs() < 1e-9, "stop {stop}");

        // still long, but an order is already working
        e.on_market(MarketEvent::Tick(tick(96.5)));
        e.drain(Duration::from_secs(2)).await;
        assert_eq!(paper.submit_count().await, 1);
    }

    #[tokio::test]
    async fn risk_rejection_is_notified_once_per_reason() {
        let paper = PaperPort::new(None);
        let mut small = limits();
        small.max_position_size = 0.005;
        let (mut e, mut rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), small);
        feed_long_breakout(&mut e);
        e.on_market(MarketEvent::Tick(tick(95.0)));
        e.drain(Duration::from_secs(1)).await;

        assert_eq!(paper.submit_count().await, 0);
        let rejects: Vec<_> =
            drain_notices(&mut rx).into_iter().filter(|n| matches!(n, Notice::RiskRejected { .. })).collect();
        assert_eq!(rejects.len(), 1);
    }

    #[tokio::test]
    async fn nothing_is_submitted_before_the_first_resync() {
        let paper = PaperPort::new(None);
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        e.synced = false;
        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(1)).await;
        assert_eq!(paper.submit_count().await, 0);
    }

    #[tokio::test]
    async fn conflict_halts_and_full_resync_recovers() {
        let paper = PaperPort::new(None);
        let mut cfg = fast_cfg();
        cfg.resync_interval = Duration::from_millis(0);
        let (mut e, mut rx) = engine_with(Arc::new(paper.clone()), cfg, limits());
        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(2)).await;
        let id = e.lifecycle.open_orders().next().map(|r| r.client_order_id.clone()).expect("order");

        let partial = paper.fill(&id, 0.005, 96.9).await.expect("fill");
        e.on_account(AccountEvent::Order(partial.clone()));
        assert!((e.lifecycle.position().net_size - 0.005).abs() < 1e-12);

        let mut bogus = partial;
        bogus.seq += 10;
        bogus.cum_filled = 0.002;
        bogus.event_id = "bogus".into();
        e.on_account(AccountEvent::Order(bogus));
        assert!(e.lifecycle.halted().is_some());
        assert!(!e.can_submit());

        e.housekeeping();
        e.drain(Duration::from_secs(2)).await;

        assert!(e.lifecycle.halted().is_none());
        assert!(e.synced);
        assert!((e.lifecycle.position().net_size - 0.005).abs() < 1e-12);
        let notices = drain_notices(&mut rx);
        assert!(notices.iter().any(|n| matches!(n, Notice::Halted { .. })));
        assert!(notices.iter().any(|n| matches!(n, Notice::Resumed { .. })));
    }

    #[tokio::test]
    async fn reconnect_with_unexplained_position_halts() {
        let paper = PaperPort::new(None);
        paper.set_position("BTCUSDT", 0.3, 100.0).await;
        let (mut e, mut rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        e.on_account(AccountEvent::StreamUp);
        e.drain(Duration::from_secs(2)).await;

        assert!(e.lifecycle.halted().is_some());
        assert!(drain_notices(&mut rx).iter().any(|n| matches!(n, Notice::Halted { .. })));
    }

    #[tokio::test]
    async fn drifted_order_is_expired() {
        let paper = PaperPort::new(None);
        let (mut e, mut rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(2)).await;
        let id = e.lifecycle.open_orders().next().map(|r| r.client_order_id.clone()).expect("order");

        e.last_tick = Some(tick(97.6));
        e.housekeeping();
        e.drain(Duration::from_secs(2)).await;
        let snap = paper.query_status("BTCUSDT", &id).await.expect("query").expect("known");
        assert_eq!(snap.status, ExchangeStatus::Cancelled);

        e.on_account(AccountEvent::Order(snap));
        assert_eq!(e.lifecycle.record(&id).map(|r| r.state), Some(OrderState::Expired));
        assert!(drain_notices(&mut rx).iter().any(|n| matches!(n, Notice::OrderExpired { .. })));
    }

    #[tokio::test]
    async fn shutdown_cancels_every_open_order() {
        let paper = PaperPort::new(None);
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(2)).await;
        let id = e.lifecycle.open_orders().next().map(|r| r.client_order_id.clone()).expect("order");

        let summary = e.shutdown().await;
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.failed, 0);
        let snap = paper.query_status("BTCUSDT", &id).await.expect("query").expect("known");
        assert_eq!(snap.status, ExchangeStatus::Cancelled);
    }

    #[tokio::test]
    async fn run_loop_trades_on_paper_and_stops_cleanly() {
        let paper = PaperPort::new(Some(Duration::from_millis(5)));
        let port: SharedPort = Arc::new(paper.clone());
        let (n, _notices) = notifier::channel(64);
        let engine = Engine::new("BTCUSDT", fast_cfg(), SignalParams::default(), &limits(), port.clone(), n, Journal::disabled());

        let (md_tx, md_rx) = mpsc::channel(64);
        let (acct_tx, acct_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(crate::feed::run_account_stream(port.clone(), acct_tx, stop_rx.clone()));
        let handle = tokio::spawn(engine.run(md_rx, acct_rx, stop_rx));

        for i in 0..19 {
            md_tx.send(MarketEvent::Tick(tick(if i % 2 == 0 { 101.0 } else { 99.0 }))).await.expect("send");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        md_tx.send(MarketEvent::Tick(tick(96.9))).await.expect("send");

        let mut filled = false;
        for _ in 0..100 {
            if paper.position("BTCUSDT").await.expect("position").net_size > 0.0 {
                filled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(filled, "paper venue never filled the entry");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _ = stop_tx.send(true);
        let summary = handle.await.expect("engine task");
        assert!((summary.net_size - 0.01).abs() < 1e-12);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn resync_does_not_query_a_create_still_in_flight() {
        let paper = PaperPort::new(None);
        let slow = SlowPort {
            inner: paper.clone(),
            submit_delay: Duration::from_millis(100),
            query_delay: Duration::from_millis(150),
        };
        let (mut e, _rx) = engine_with(Arc::new(slow), fast_cfg(), limits());
        feed_long_breakout(&mut e);
        e.on_account(AccountEvent::StreamUp);
        e.drain(Duration::from_secs(2)).await;

        let rec = e.lifecycle.open_orders().next().expect("entry still tracked");
        assert_eq!(rec.state, OrderState::Acknowledged);
        assert_eq!(rec.resubmits, 0);
        let id = rec.client_order_id.clone();
        assert!(e.lifecycle.halted().is_none());
        assert!(e.synced);
        assert_eq!(paper.submit_count().await, 1);
        let venue = paper.query_status("BTCUSDT", &id).await.expect("query").expect("known");
        assert_eq!(venue.status, ExchangeStatus::New);
    }

    #[tokio::test]
    async fn not_found_for_an_order_that_moved_during_resync_is_ignored() {
        let paper = PaperPort::new(None);
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(2)).await;
        let id = e.lifecycle.open_orders().next().map(|r| r.client_order_id.clone()).expect("order");
        let position = paper.position("BTCUSDT").await.expect("position");
        let data = |id: &ClientOrderId| ResyncData { position: position.clone(), open: Vec::new(), statuses: vec![(id.clone(), None)] };

        // acknowledged after the resync began reading the venue
        e.resync_started_ms = now_ms() - 60_000;
        e.apply_resync(ResyncKind::Reconnect, data(&id));
        assert_eq!(e.lifecycle.record(&id).map(|r| r.state), Some(OrderState::Acknowledged));

        // untouched since the read: the venue really lost it
        e.resync_started_ms = now_ms() + 1;
        e.apply_resync(ResyncKind::Reconnect, data(&id));
        assert_eq!(e.lifecycle.record(&id).map(|r| r.state), Some(OrderState::Cancelled));
    }

    #[tokio::test]
    async fn stream_drop_during_resync_keeps_submissions_paused() {
        let paper = PaperPort::new(None);
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        e.on_account(AccountEvent::StreamUp);
        e.on_account(AccountEvent::StreamDown);
        e.drain(Duration::from_secs(2)).await;
        assert!(!e.synced);
        assert!(!e.can_submit());

        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(1)).await;
        assert_eq!(paper.submit_count().await, 0);

        e.on_account(AccountEvent::StreamUp);
        e.drain(Duration::from_secs(2)).await;
        assert!(e.can_submit());
    }

    #[tokio::test]
    async fn reverting_through_the_mean_closes_with_a_reduce_only_exit() {
        let paper = PaperPort::new(None);
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        filled_long(&mut e, &paper).await;

        e.on_market(MarketEvent::Tick(tick(101.0)));
        e.drain(Duration::from_secs(2)).await;

        assert_eq!(paper.submit_count().await, 2);
        let (id, side, size) = open_exit(&e).expect("exit order");
        assert_eq!(side, Side::Sell);
        assert!((size - 0.01).abs() < 1e-12);
        let rec = e.lifecycle.record(&id).expect("record");
        assert!((rec.limit_price.unwrap_or_default() - 101.0).abs() < 1e-9);
        assert!(rec.intent.as_ref().map_or(false, |i| i.stop_loss.is_none()));
    }

    #[tokio::test]
    async fn adverse_run_beyond_atr_stop_closes_the_long() {
        let paper = PaperPort::new(None);
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        filled_long(&mut e, &paper).await;

        // still a long signal, but 1.2 ATR under the 96.9 entry
        e.on_market(MarketEvent::Tick(tick(93.0)));
        e.drain(Duration::from_secs(2)).await;

        assert_eq!(paper.submit_count().await, 2);
        let (_, side, _) = open_exit(&e).expect("stop exit");
        assert_eq!(side, Side::Sell);
        assert_eq!(e.lifecycle.open_count(), 1);
    }

    #[tokio::test]
    async fn unfilled_exit_is_expired_and_reissued() {
        let paper = PaperPort::new(None);
        let (mut e, mut rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        filled_long(&mut e, &paper).await;
        e.on_market(MarketEvent::Tick(tick(101.0)));
        e.drain(Duration::from_secs(2)).await;
        let (exit, _, _) = open_exit(&e).expect("exit order");

        e.last_tick = Some(tick(80.0));
        e.housekeeping();
        e.drain(Duration::from_secs(2)).await;
        let snap = paper.query_status("BTCUSDT", &exit).await.expect("query").expect("known");
        assert_eq!(snap.status, ExchangeStatus::Cancelled);
        e.on_account(AccountEvent::Order(snap));
        assert_eq!(e.lifecycle.record(&exit).map(|r| r.state), Some(OrderState::Expired));
        assert!(drain_notices(&mut rx).iter().any(|n| matches!(n, Notice::OrderExpired { .. })));

        e.on_market(MarketEvent::Tick(tick(101.0)));
        e.drain(Duration::from_secs(2)).await;
        assert_eq!(paper.submit_count().await, 3);
        let (again, side, _) = open_exit(&e).expect("new exit");
        assert_ne!(again, exit);
        assert_eq!(side, Side::Sell);
    }

    #[tokio::test]
    async fn resting_entry_is_cancelled_when_the_signal_flips() {
        let paper = PaperPort::new(None);
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), fast_cfg(), limits());
        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(2)).await;
        let id = e.lifecycle.open_orders().next().map(|r| r.client_order_id.clone()).expect("order");

        e.on_market(MarketEvent::Tick(tick(104.0)));
        assert_eq!(e.last_signal.as_ref().map(|s| s.direction), Some(Direction::Short));
        e.drain(Duration::from_secs(2)).await;

        let snap = paper.query_status("BTCUSDT", &id).await.expect("query").expect("known");
        assert_eq!(snap.status, ExchangeStatus::Cancelled);
        // no short while the long is still being cancelled
        assert_eq!(paper.submit_count().await, 1);
    }

    async fn partial_entry_after_flat_signal(policy: PartialFillPolicy) -> ExchangeStatus {
        let paper = PaperPort::new(None);
        let mut cfg = fast_cfg();
        cfg.partial_fill_policy = policy;
        let (mut e, _rx) = engine_with(Arc::new(paper.clone()), cfg, limits());
        feed_long_breakout(&mut e);
        e.drain(Duration::from_secs(2)).await;
        let id = e.lifecycle.open_orders().next().map(|r| r.client_order_id.clone()).expect("order");
        let partial = paper.fill(&id, 0.005, 96.9).await.expect("fill");
        e.on_account(AccountEvent::Order(partial));
        e.drain(Duration::from_secs(1)).await;

        // back inside the band but still under the mean: flat, no exit yet
        e.on_market(MarketEvent::Tick(tick(99.0)));
        assert_eq!(e.last_signal.as_ref().map(|s| s.direction), Some(Direction::Flat));
        e.drain(Duration::from_secs(2)).await;
        assert!(open_exit(&e).is_none());
        paper.query_status("BTCUSDT", &id).await.expect("query").expect("known").status
    }

    #[tokio::test]
    async fn reevaluate_cancels_partial_entry_on_flat_signal() {
        assert_eq!(partial_entry_after_flat_signal(PartialFillPolicy::Reevaluate).await, ExchangeStatus::Cancelled);
        assert_eq!(partial_entry_after_flat_signal(PartialFillPolicy::Hold).await, ExchangeStatus::PartiallyFilled);
    }
}
