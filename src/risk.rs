// ===============================
// src/risk.rs
// ===============================
use thiserror::Error;

use crate::domain::{OrderIntent, Position, RiskState, QTY_EPS};

/// Why an intent was refused. `code()` is the stable label used in metrics,
/// the journal and notifications.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskRejection {
    #[error("order size must be positive")]
    InvalidSize,
    #[error("cooldown active for another {remaining_ms} ms")]
    CooldownActive { remaining_ms: i64 },
    #[error("daily loss limit breached; exposure may only be reduced")]
    LossLimitLock,
    #[error("daily trade limit of {0} reached")]
    DailyTradeLimit(u32),
    #[error("daily profit lock reached")]
    ProfitLock,
    #[error("{open} open orders, limit {max}")]
    TooManyOpenOrders { open: usize, max: usize },
    #[error("resulting position {resulting} exceeds limit {max}")]
    ExceedsPositionLimit { resulting: f64, max: f64 },
}

impl RiskRejection {
    pub fn code(&self) -> &'static str {
        match self {
            RiskRejection::InvalidSize => "invalid_size",
            RiskRejection::CooldownActive { .. } => "cooldown_active",
            RiskRejection::LossLimitLock => "loss_limit_lock",
            RiskRejection::DailyTradeLimit(_) => "daily_trade_limit",
            RiskRejection::ProfitLock => "profit_lock",
            RiskRejection::TooManyOpenOrders { .. } => "too_many_open_orders",
            RiskRejection::ExceedsPositionLimit { .. } => "exceeds_position_limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approved,
    Rejected(RiskRejection),
}

/// What the manager needs to look at besides the intent itself.
pub struct RiskContext<'a> {
    pub position: &'a Position,
    pub state: &'a RiskState,
    /// Non-terminal orders for the instrument.
    pub open_orders: usize,
    /// Signed remaining size of those orders.
    pub pending_exposure: f64,
    pub now_ms: i64,
}

/// Pre-trade checks. Pure: nothing here mutates position or risk state.
#[derive(Debug, Default, Clone)]
pub struct RiskManager;

impl RiskManager {
    pub fn new() -> Self { Self }

    pub fn approve(&self, intent: &OrderIntent, ctx: &RiskContext<'_>) -> RiskDecision {
        match self.check(intent, ctx) {
            Ok(()) => RiskDecision::Approved,
            Err(r) => RiskDecision::Rejected(r),
        }
    }

    fn check(&self, intent: &OrderIntent, ctx: &RiskContext<'_>) -> Result<(), RiskRejection> {
        let st = ctx.state;

        // 1) Sanity
        if !(intent.size > QTY_EPS) || !intent.size.is_finite() {
            return Err(RiskRejection::InvalidSize);
        }

        // 2) Cooldown blocks everything
        if let Some(until) = st.cooldown_until_ms {
            if ctx.now_ms < until {
                return Err(RiskRejection::CooldownActive { remaining_ms: until - ctx.now_ms });
            }
        }

        let current = ctx.position.net_size + ctx.pending_exposure;
        let resulting = current + intent.signed_size();
        let increases = resulting.abs() > current.abs() + QTY_EPS;

        // 3) Loss lock / profit lock: only reductions pass for the rest of the day
        if st.loss_locked && increases {
            return Err(RiskRejection::LossLimitLock);
        }
        if st.profit_lock > 0.0 && st.daily_realized_pnl >= st.profit_lock && increases {
            return Err(RiskRejection::ProfitLock);
        }

        // 4) Daily trade count
        if st.max_daily_trades > 0 && st.trades_today >= st.max_daily_trades && increases {
            return Err(RiskRejection::DailyTradeLimit(st.max_daily_trades));
        }

        // 5) Open orders
        if ctx.open_orders + 1 > st.max_open_orders {
            return Err(RiskRejection::TooManyOpenOrders { open: ctx.open_orders, max: st.max_open_orders });
        }

        // 6) Position limit
        if increases && resulting.abs() > st.max_position_size + QTY_EPS {
            return Err(RiskRejection::ExceedsPositionLimit { resulting, max: st.max_position_size });
        }

        Ok(())
    }
}
